use std::{collections::HashMap, sync::Arc};

use serde_json::Value;

use crate::{
    audience::{Audience, ConditionTree},
    datafile::models::{
        Attribute, Datafile, Event, Experiment, FeatureFlag, GroupPolicy, Holdout, Region,
        TrafficAllocation, TryParse,
    },
    odp::OdpConfig,
    Error, Result,
};

const SUPPORTED_VERSIONS: [&str; 3] = ["2", "3", "4"];

const ODP_INTEGRATION_KEY: &str = "odp";

/// Mutual exclusion group.
#[derive(Debug, Clone)]
pub struct Group {
    #[allow(missing_docs)]
    pub id: String,
    #[allow(missing_docs)]
    pub policy: GroupPolicy,
    /// Allocation of group traffic to experiment ids.
    pub traffic_allocation: Vec<TrafficAllocation>,
}

/// Ordered list of delivery rules of a flag. The last rule targets everyone else.
#[derive(Debug, Clone)]
pub struct Rollout {
    #[allow(missing_docs)]
    pub id: String,
    #[allow(missing_docs)]
    pub rules: Vec<Arc<Experiment>>,
}

/// Immutable, queryable view of a datafile.
///
/// Entities reachable by both id and key are stored once and shared, so both lookups always
/// return the same value.
#[derive(Debug)]
pub struct ProjectConfig {
    account_id: String,
    project_id: String,
    revision: String,
    anonymize_ip: bool,
    bot_filtering: Option<bool>,
    send_flag_decisions: bool,
    region: Region,

    experiment_id_map: HashMap<String, Arc<Experiment>>,
    experiment_key_map: HashMap<String, Arc<Experiment>>,
    group_id_map: HashMap<String, Arc<Group>>,
    flags: Vec<Arc<FeatureFlag>>,
    flag_key_map: HashMap<String, Arc<FeatureFlag>>,
    rollout_id_map: HashMap<String, Arc<Rollout>>,
    holdouts: Vec<Arc<Holdout>>,
    holdout_id_map: HashMap<String, Arc<Holdout>>,
    audience_id_map: HashMap<String, Arc<Audience>>,
    attribute_key_map: HashMap<String, Attribute>,
    attribute_id_map: HashMap<String, Attribute>,
    event_key_map: HashMap<String, Event>,
    odp_config: OdpConfig,
}

fn parsed<T>(items: Vec<TryParse<T>>) -> impl Iterator<Item = T> {
    items.into_iter().filter_map(Option::from)
}

/// Leaves of experiment audience conditions are audience ids.
fn audience_id(value: &Value) -> String {
    value.as_str().unwrap_or_default().to_owned()
}

/// Build the audience tree of a rule. `audienceConditions` take precedence over `audienceIds`,
/// which are an implicit `or`. An empty list targets everyone.
fn audience_tree(
    conditions: Option<&Value>,
    audience_ids: &[String],
) -> Option<ConditionTree<String>> {
    match conditions {
        Some(Value::Array(items)) if items.is_empty() => None,
        None | Some(Value::Null) if audience_ids.is_empty() => None,
        None | Some(Value::Null) => Some(ConditionTree::Or(
            audience_ids.iter().cloned().map(ConditionTree::Leaf).collect(),
        )),
        Some(conditions) => Some(ConditionTree::from_json(conditions, &audience_id)),
    }
}

fn prepare_experiment(mut experiment: Experiment, group_id: Option<&str>) -> Arc<Experiment> {
    experiment.audience_tree = audience_tree(
        experiment.audience_conditions.as_ref(),
        &experiment.audience_ids,
    );
    experiment.group_id = group_id.map(str::to_owned);
    Arc::new(experiment)
}

impl ProjectConfig {
    /// Parse a datafile.
    ///
    /// Malformed entities are skipped with a warning. The datafile itself must be valid JSON of a
    /// supported version.
    pub fn from_datafile(datafile: &str) -> Result<ProjectConfig> {
        let datafile: Datafile = serde_json::from_str(datafile)
            .map_err(|err| Error::InvalidDatafile(Arc::new(err)))?;

        if !SUPPORTED_VERSIONS.contains(&datafile.version.as_str()) {
            return Err(Error::UnsupportedDatafileVersion(datafile.version));
        }

        let mut experiments = parsed(datafile.experiments)
            .map(|it| prepare_experiment(it, None))
            .collect::<Vec<_>>();

        let mut group_id_map = HashMap::new();
        for group in parsed(datafile.groups) {
            experiments.extend(
                parsed(group.experiments).map(|it| prepare_experiment(it, Some(&group.id))),
            );
            group_id_map.insert(
                group.id.clone(),
                Arc::new(Group {
                    id: group.id,
                    policy: group.policy,
                    traffic_allocation: group.traffic_allocation,
                }),
            );
        }

        let mut rollout_id_map = HashMap::new();
        for rollout in parsed(datafile.rollouts) {
            let rules = parsed(rollout.experiments)
                .map(|it| prepare_experiment(it, None))
                .collect::<Vec<_>>();
            experiments.extend(rules.iter().cloned());
            rollout_id_map.insert(
                rollout.id.clone(),
                Arc::new(Rollout {
                    id: rollout.id,
                    rules,
                }),
            );
        }

        let experiment_id_map = experiments
            .iter()
            .map(|it| (it.id.clone(), Arc::clone(it)))
            .collect();
        let experiment_key_map = experiments
            .iter()
            .map(|it| (it.key.clone(), Arc::clone(it)))
            .collect();

        let flags = parsed(datafile.feature_flags)
            .map(Arc::new)
            .collect::<Vec<_>>();
        let flag_key_map = flags
            .iter()
            .map(|it| (it.key.clone(), Arc::clone(it)))
            .collect();

        let holdouts = parsed(datafile.holdouts)
            .map(|mut holdout| {
                holdout.audience_tree =
                    audience_tree(holdout.audience_conditions.as_ref(), &holdout.audience_ids);
                Arc::new(holdout)
            })
            .collect::<Vec<_>>();
        let holdout_id_map = holdouts
            .iter()
            .map(|it| (it.id.clone(), Arc::clone(it)))
            .collect();

        // Typed audiences come last so that they replace legacy audiences with the same id.
        let mut audience_id_map = HashMap::new();
        let mut segments_to_check = Vec::<String>::new();
        for audience in parsed(datafile.audiences).chain(parsed(datafile.typed_audiences)) {
            let audience = Audience::parse(audience.id, audience.name, &audience.conditions);
            for segment in audience.segments() {
                if !segments_to_check.contains(&segment) {
                    segments_to_check.push(segment);
                }
            }
            audience_id_map.insert(audience.id.clone(), Arc::new(audience));
        }

        let attributes = parsed(datafile.attributes).collect::<Vec<_>>();
        let attribute_id_map = attributes
            .iter()
            .map(|it| (it.id.clone(), it.clone()))
            .collect();
        let attribute_key_map = attributes
            .into_iter()
            .map(|it| (it.key.clone(), it))
            .collect();

        let event_key_map = parsed(datafile.events)
            .map(|it| (it.key.clone(), it))
            .collect();

        let odp_config = parsed(datafile.integrations)
            .find(|it| it.key == ODP_INTEGRATION_KEY)
            .map(|it| OdpConfig::new(it.public_key, it.host, segments_to_check.clone()))
            .unwrap_or_else(|| OdpConfig::new(None, None, segments_to_check));

        log::debug!(target: "optimizely",
                    revision:display = datafile.revision,
                    flags = flags.len();
                    "parsed datafile");

        Ok(ProjectConfig {
            account_id: datafile.account_id,
            project_id: datafile.project_id,
            revision: datafile.revision,
            anonymize_ip: datafile.anonymize_ip,
            bot_filtering: datafile.bot_filtering,
            send_flag_decisions: datafile.send_flag_decisions,
            region: datafile.region,
            experiment_id_map,
            experiment_key_map,
            group_id_map,
            flags,
            flag_key_map,
            rollout_id_map,
            holdouts,
            holdout_id_map,
            audience_id_map,
            attribute_key_map,
            attribute_id_map,
            event_key_map,
            odp_config,
        })
    }

    #[allow(missing_docs)]
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    #[allow(missing_docs)]
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Revision of the datafile. Two configs with the same revision are the same config.
    pub fn revision(&self) -> &str {
        &self.revision
    }

    #[allow(missing_docs)]
    pub fn anonymize_ip(&self) -> bool {
        self.anonymize_ip
    }

    #[allow(missing_docs)]
    pub fn bot_filtering(&self) -> Option<bool> {
        self.bot_filtering
    }

    /// Whether impressions are sent for rollout decisions.
    pub fn send_flag_decisions(&self) -> bool {
        self.send_flag_decisions
    }

    #[allow(missing_docs)]
    pub fn region(&self) -> Region {
        self.region
    }

    /// All flags in datafile order.
    pub fn flags(&self) -> &[Arc<FeatureFlag>] {
        &self.flags
    }

    #[allow(missing_docs)]
    pub fn get_flag(&self, flag_key: &str) -> Option<&Arc<FeatureFlag>> {
        self.flag_key_map.get(flag_key)
    }

    /// Look up an experiment or rollout rule by id.
    pub fn get_experiment_by_id(&self, experiment_id: &str) -> Option<&Arc<Experiment>> {
        self.experiment_id_map.get(experiment_id)
    }

    /// Look up an experiment or rollout rule by key.
    pub fn get_experiment_by_key(&self, experiment_key: &str) -> Option<&Arc<Experiment>> {
        self.experiment_key_map.get(experiment_key)
    }

    #[allow(missing_docs)]
    pub fn get_group(&self, group_id: &str) -> Option<&Arc<Group>> {
        self.group_id_map.get(group_id)
    }

    #[allow(missing_docs)]
    pub fn get_rollout(&self, rollout_id: &str) -> Option<&Arc<Rollout>> {
        self.rollout_id_map.get(rollout_id)
    }

    #[allow(missing_docs)]
    pub fn get_holdout(&self, holdout_id: &str) -> Option<&Arc<Holdout>> {
        self.holdout_id_map.get(holdout_id)
    }

    /// Holdouts applicable to `flag_id`, in declared order.
    pub fn holdouts_for_flag<'a>(
        &'a self,
        flag_id: &'a str,
    ) -> impl Iterator<Item = &'a Arc<Holdout>> + 'a {
        self.holdouts.iter().filter(move |it| it.applies_to(flag_id))
    }

    #[allow(missing_docs)]
    pub fn audiences(&self) -> &HashMap<String, Arc<Audience>> {
        &self.audience_id_map
    }

    #[allow(missing_docs)]
    pub fn get_attribute(&self, attribute_key: &str) -> Option<&Attribute> {
        self.attribute_key_map.get(attribute_key)
    }

    #[allow(missing_docs)]
    pub fn get_attribute_by_id(&self, attribute_id: &str) -> Option<&Attribute> {
        self.attribute_id_map.get(attribute_id)
    }

    #[allow(missing_docs)]
    pub fn get_event(&self, event_key: &str) -> Option<&Event> {
        self.event_key_map.get(event_key)
    }

    #[allow(missing_docs)]
    pub fn odp_config(&self) -> &OdpConfig {
        &self.odp_config
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::ProjectConfig;
    use crate::{
        datafile::{GroupPolicy, Region, Rule, RuleStatus, TEST_DATAFILE as DATAFILE},
        Error,
    };

    #[test]
    fn parse_fixture() {
        let config = ProjectConfig::from_datafile(DATAFILE).unwrap();
        assert_eq!(config.revision(), "42");
        assert_eq!(config.account_id(), "12001");
        assert_eq!(config.region(), Region::US);
        assert!(config.send_flag_decisions());
        assert_eq!(config.bot_filtering(), Some(true));
        assert_eq!(config.flags().len(), 4);
    }

    #[test]
    fn id_and_key_lookups_agree() {
        let config = ProjectConfig::from_datafile(DATAFILE).unwrap();
        let by_key = config.get_experiment_by_key("exp_1").unwrap();
        let by_id = config.get_experiment_by_id(&by_key.id).unwrap();
        assert!(Arc::ptr_eq(by_key, by_id));
        assert_eq!(by_id.status, RuleStatus::Running);
        assert!(by_id.variation_by_key("a").is_some());
    }

    #[test]
    fn group_experiments_know_their_group() {
        let config = ProjectConfig::from_datafile(DATAFILE).unwrap();
        let experiment = config.get_experiment_by_key("group_exp_1").unwrap();
        let group_id = experiment.group_id.as_deref().unwrap();
        assert_eq!(config.get_group(group_id).unwrap().policy, GroupPolicy::Random);
    }

    #[test]
    fn rollout_rules_are_experiments() {
        let config = ProjectConfig::from_datafile(DATAFILE).unwrap();
        let flag = config.get_flag("flag_1").unwrap();
        let rollout = config.get_rollout(&flag.rollout_id).unwrap();
        assert_eq!(rollout.rules.len(), 2);
        assert!(config.get_experiment_by_id(&rollout.rules[0].id).is_some());
    }

    #[test]
    fn typed_audiences_override_legacy() {
        let config = ProjectConfig::from_datafile(DATAFILE).unwrap();
        assert_eq!(config.audiences()["3001"].name, "typed beta users");
    }

    #[test]
    fn holdouts_for_flag() {
        let config = ProjectConfig::from_datafile(DATAFILE).unwrap();
        let flag_1 = config.get_flag("flag_1").unwrap();
        let keys = config
            .holdouts_for_flag(&flag_1.id)
            .map(|it| it.key().to_owned())
            .collect::<Vec<_>>();
        assert_eq!(keys, vec!["holdout_2"]);

        let flag_2 = config.get_flag("flag_2").unwrap();
        let keys = config
            .holdouts_for_flag(&flag_2.id)
            .map(|it| it.key().to_owned())
            .collect::<Vec<_>>();
        assert_eq!(keys, vec!["holdout_1"]);
    }

    #[test]
    fn odp_config_collects_segments() {
        let config = ProjectConfig::from_datafile(DATAFILE).unwrap();
        let odp = config.odp_config();
        assert!(odp.is_ready());
        assert_eq!(odp.segments_to_check, vec!["vip".to_owned()]);
    }

    #[test]
    fn rejects_invalid_datafiles() {
        assert!(matches!(
            ProjectConfig::from_datafile("{"),
            Err(Error::InvalidDatafile(_))
        ));
        assert!(matches!(
            ProjectConfig::from_datafile(r#"{"version": "1"}"#),
            Err(Error::UnsupportedDatafileVersion(_))
        ));
        assert!(ProjectConfig::from_datafile(r#"{"version": "4", "revision": "1"}"#).is_ok());
    }
}
