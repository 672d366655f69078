//! Serde models for the subset of the datafile consumed by the SDK.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audience::ConditionTree;

/// Datafile as it comes over the wire.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Datafile {
    pub version: String,
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub revision: String,
    #[serde(default, rename = "anonymizeIP")]
    pub anonymize_ip: bool,
    #[serde(default)]
    pub bot_filtering: Option<bool>,
    #[serde(default)]
    pub send_flag_decisions: bool,
    #[serde(default)]
    pub region: Region,
    #[serde(default)]
    pub experiments: Vec<TryParse<Experiment>>,
    #[serde(default)]
    pub groups: Vec<TryParse<GroupDef>>,
    #[serde(default)]
    pub feature_flags: Vec<TryParse<FeatureFlag>>,
    #[serde(default)]
    pub rollouts: Vec<TryParse<RolloutDef>>,
    #[serde(default)]
    pub holdouts: Vec<TryParse<Holdout>>,
    #[serde(default)]
    pub audiences: Vec<TryParse<AudienceDef>>,
    #[serde(default)]
    pub typed_audiences: Vec<TryParse<AudienceDef>>,
    #[serde(default)]
    pub attributes: Vec<TryParse<Attribute>>,
    #[serde(default)]
    pub events: Vec<TryParse<Event>>,
    #[serde(default)]
    pub integrations: Vec<TryParse<Integration>>,
}

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum TryParse<T> {
    Parsed(T),
    ParseFailed(Value),
}

impl<T> From<TryParse<T>> for Option<T> {
    fn from(value: TryParse<T>) -> Self {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(value) => {
                log::warn!(target: "optimizely", "skipping malformed datafile entity: {value}");
                None
            }
        }
    }
}

/// Data residency region of the project. Decides which event endpoint receives events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Region {
    #[allow(missing_docs)]
    #[default]
    US,
    #[allow(missing_docs)]
    EU,
}

/// Lifecycle state of an experiment, rollout rule or holdout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum RuleStatus {
    #[allow(missing_docs)]
    Running,
    #[allow(missing_docs)]
    Launched,
    #[allow(missing_docs)]
    Paused,
    #[allow(missing_docs)]
    #[default]
    #[serde(rename = "Not started")]
    NotStarted,
    #[allow(missing_docs)]
    Draft,
    #[allow(missing_docs)]
    Concluded,
    #[allow(missing_docs)]
    Archived,
    /// Any status this SDK does not know about.
    #[serde(other)]
    Unknown,
}

impl RuleStatus {
    /// Only running rules take traffic.
    pub fn is_running(self) -> bool {
        self == RuleStatus::Running
    }
}

/// A bucket range. A bucket value `b` falls into the first allocation with `end_of_range > b`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficAllocation {
    /// Variation (or experiment, for groups) id. Empty means "no entity".
    pub entity_id: String,
    #[allow(missing_docs)]
    pub end_of_range: u32,
}

/// Value of a feature variable inside a variation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VariableValue {
    /// Variable id, see [`VariableDef::id`].
    pub id: String,
    #[allow(missing_docs)]
    pub value: String,
}

/// A variation of an experiment, rollout rule or holdout.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variation {
    #[allow(missing_docs)]
    pub id: String,
    #[allow(missing_docs)]
    pub key: String,
    #[allow(missing_docs)]
    #[serde(default)]
    pub feature_enabled: bool,
    /// Variable overrides, in datafile order.
    #[serde(default)]
    pub variables: Vec<VariableValue>,
}

impl Variation {
    /// Value of variable `variable_id` in this variation, if it overrides it.
    pub fn variable_value(&self, variable_id: &str) -> Option<&str> {
        self.variables
            .iter()
            .find(|it| it.id == variable_id)
            .map(|it| it.value.as_str())
    }
}

/// Contextual multi-armed bandit settings of an experiment.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cmab {
    /// Attributes sent to the prediction endpoint.
    #[serde(default)]
    pub attribute_ids: Vec<String>,
    /// Share of traffic (out of 10000) that enters the experiment.
    pub traffic_allocation: u32,
}

/// An experiment or a rollout rule.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    #[allow(missing_docs)]
    pub id: String,
    #[allow(missing_docs)]
    pub key: String,
    #[allow(missing_docs)]
    #[serde(default)]
    pub status: RuleStatus,
    /// Campaign id reported in impression events.
    #[serde(default)]
    pub layer_id: String,
    #[allow(missing_docs)]
    #[serde(default)]
    pub audience_ids: Vec<String>,
    #[serde(default)]
    pub(crate) audience_conditions: Option<Value>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub variations: Vec<Variation>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub traffic_allocation: Vec<TrafficAllocation>,
    /// Whitelisted users: user id to variation key.
    #[serde(default)]
    pub forced_variations: HashMap<String, String>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub cmab: Option<Cmab>,
    /// Set for experiments declared inside a group.
    #[serde(skip)]
    pub group_id: Option<String>,
    #[serde(skip)]
    pub(crate) audience_tree: Option<ConditionTree<String>>,
}

/// A holdout: a slice of traffic that is kept out of experiments and rollouts.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Holdout {
    #[allow(missing_docs)]
    pub id: String,
    #[allow(missing_docs)]
    pub key: String,
    #[allow(missing_docs)]
    #[serde(default)]
    pub status: RuleStatus,
    /// Flag ids this holdout is limited to. Empty means all flags.
    #[serde(default)]
    pub included_flags: Vec<String>,
    /// Flag ids excluded from a global holdout.
    #[serde(default)]
    pub excluded_flags: Vec<String>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub audience_ids: Vec<String>,
    #[serde(default)]
    pub(crate) audience_conditions: Option<Value>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub variations: Vec<Variation>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub traffic_allocation: Vec<TrafficAllocation>,
    #[serde(skip)]
    pub(crate) audience_tree: Option<ConditionTree<String>>,
}

impl Holdout {
    /// Returns `true` if the holdout should be evaluated for `flag_id`.
    ///
    /// A non-empty inclusion list wins over the exclusion list.
    pub fn applies_to(&self, flag_id: &str) -> bool {
        if self.included_flags.is_empty() {
            !self.excluded_flags.iter().any(|it| it == flag_id)
        } else {
            self.included_flags.iter().any(|it| it == flag_id)
        }
    }
}

/// Common view over experiments, rollout rules and holdouts: everything needed to gate a user
/// by audience and bucket them into a variation.
pub trait Rule {
    #[allow(missing_docs)]
    fn id(&self) -> &str;
    #[allow(missing_docs)]
    fn key(&self) -> &str;
    #[allow(missing_docs)]
    fn variations(&self) -> &[Variation];
    #[allow(missing_docs)]
    fn traffic_allocation(&self) -> &[TrafficAllocation];
    /// Parsed audience conditions. `None` means everyone qualifies.
    fn audience_conditions(&self) -> Option<&ConditionTree<String>>;

    #[allow(missing_docs)]
    fn variation_by_id(&self, variation_id: &str) -> Option<&Variation> {
        self.variations().iter().find(|it| it.id == variation_id)
    }

    #[allow(missing_docs)]
    fn variation_by_key(&self, variation_key: &str) -> Option<&Variation> {
        self.variations().iter().find(|it| it.key == variation_key)
    }
}

impl Rule for Experiment {
    fn id(&self) -> &str {
        &self.id
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn variations(&self) -> &[Variation] {
        &self.variations
    }

    fn traffic_allocation(&self) -> &[TrafficAllocation] {
        &self.traffic_allocation
    }

    fn audience_conditions(&self) -> Option<&ConditionTree<String>> {
        self.audience_tree.as_ref()
    }
}

impl Rule for Holdout {
    fn id(&self) -> &str {
        &self.id
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn variations(&self) -> &[Variation] {
        &self.variations
    }

    fn traffic_allocation(&self) -> &[TrafficAllocation] {
        &self.traffic_allocation
    }

    fn audience_conditions(&self) -> Option<&ConditionTree<String>> {
        self.audience_tree.as_ref()
    }
}

/// Mutual exclusion group as it appears in the datafile.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GroupDef {
    pub id: String,
    #[serde(default)]
    pub policy: GroupPolicy,
    #[serde(default)]
    pub traffic_allocation: Vec<TrafficAllocation>,
    #[serde(default)]
    pub experiments: Vec<TryParse<Experiment>>,
}

/// How experiments of a group share traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupPolicy {
    /// Users are first bucketed into exactly one experiment of the group.
    #[default]
    Random,
    /// Experiments bucket independently.
    Overlapping,
}

/// Type of a feature variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    #[allow(missing_docs)]
    String,
    #[allow(missing_docs)]
    Integer,
    #[allow(missing_docs)]
    Double,
    #[allow(missing_docs)]
    Boolean,
    #[allow(missing_docs)]
    Json,
}

/// Declaration of a feature variable.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableDef {
    #[allow(missing_docs)]
    pub id: String,
    #[allow(missing_docs)]
    pub key: String,
    #[allow(missing_docs)]
    #[serde(rename = "type")]
    pub variable_type: VariableType,
    /// Legacy datafiles declare json variables as `string` with `subType: "json"`.
    #[serde(default)]
    pub sub_type: Option<String>,
    #[allow(missing_docs)]
    pub default_value: String,
}

impl VariableDef {
    /// Effective type, taking the legacy `subType` into account.
    pub fn effective_type(&self) -> VariableType {
        match (self.variable_type, self.sub_type.as_deref()) {
            (VariableType::String, Some("json")) => VariableType::Json,
            (t, _) => t,
        }
    }
}

/// A feature flag.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlag {
    #[allow(missing_docs)]
    pub id: String,
    #[allow(missing_docs)]
    pub key: String,
    /// Rollout evaluated after experiments. Empty if the flag has none.
    #[serde(default)]
    pub rollout_id: String,
    /// Feature-test experiments, in evaluation order.
    #[serde(default)]
    pub experiment_ids: Vec<String>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub variables: Vec<VariableDef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RolloutDef {
    pub id: String,
    #[serde(default)]
    pub experiments: Vec<TryParse<Experiment>>,
}

/// Audience as it appears in either `audiences` (conditions encoded as a JSON string) or
/// `typedAudiences` (conditions as JSON).
#[derive(Debug, Deserialize)]
pub(crate) struct AudienceDef {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub conditions: Value,
}

/// Attribute declared in the project.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Attribute {
    #[allow(missing_docs)]
    pub id: String,
    #[allow(missing_docs)]
    pub key: String,
}

/// Conversion event declared in the project.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[allow(missing_docs)]
    pub id: String,
    #[allow(missing_docs)]
    pub key: String,
    #[allow(missing_docs)]
    #[serde(default)]
    pub experiment_ids: Vec<String>,
}

/// Third-party integration settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Integration {
    pub key: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
}
