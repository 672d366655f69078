use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{
    datafile::{ProjectConfig, Region},
    decision::FeatureDecision,
    user_context::UserContext,
    AttributeValue,
};

/// Name reported as the SDK name in event batches.
pub(crate) const CLIENT_NAME: &str = "rust-sdk";

/// Prefix of reserved attributes that are reported even when the datafile does not declare them.
const RESERVED_ATTRIBUTE_PREFIX: &str = "$opt_";

/// Free-form tags attached to a conversion.
pub type EventTags = HashMap<String, serde_json::Value>;

/// Fields every event in a batch must share.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventContext {
    #[allow(missing_docs)]
    pub account_id: String,
    #[allow(missing_docs)]
    pub project_id: String,
    #[allow(missing_docs)]
    pub revision: String,
    #[allow(missing_docs)]
    pub client_name: String,
    #[allow(missing_docs)]
    pub client_version: String,
    #[allow(missing_docs)]
    pub anonymize_ip: bool,
    #[allow(missing_docs)]
    pub bot_filtering: Option<bool>,
    #[allow(missing_docs)]
    pub region: Region,
}

impl EventContext {
    pub(crate) fn from_config(config: &ProjectConfig) -> EventContext {
        EventContext {
            account_id: config.account_id().to_owned(),
            project_id: config.project_id().to_owned(),
            revision: config.revision().to_owned(),
            client_name: CLIENT_NAME.to_owned(),
            client_version: env!("CARGO_PKG_VERSION").to_owned(),
            anonymize_ip: config.anonymize_ip(),
            bot_filtering: config.bot_filtering(),
            region: config.region(),
        }
    }
}

/// Reference to a datafile entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
    #[allow(missing_docs)]
    pub id: String,
    #[allow(missing_docs)]
    pub key: String,
}

/// A user attribute as reported to the event endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorAttribute {
    /// Attribute id, or the attribute key for reserved `$opt_` attributes.
    pub entity_id: String,
    #[allow(missing_docs)]
    pub key: String,
    #[allow(missing_docs)]
    pub value: AttributeValue,
}

/// The user an event is about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Visitor {
    #[allow(missing_docs)]
    pub id: String,
    #[allow(missing_docs)]
    pub attributes: Vec<VisitorAttribute>,
}

/// A user was exposed to a flag decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpressionEvent {
    #[allow(missing_docs)]
    pub context: EventContext,
    #[allow(missing_docs)]
    pub uuid: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[allow(missing_docs)]
    pub user: Visitor,
    /// Campaign of the decided rule. Holdouts have none.
    pub layer: Option<EntityRef>,
    #[allow(missing_docs)]
    pub experiment: Option<EntityRef>,
    #[allow(missing_docs)]
    pub variation: Option<EntityRef>,
    #[allow(missing_docs)]
    pub rule_key: String,
    #[allow(missing_docs)]
    pub flag_key: String,
    #[allow(missing_docs)]
    pub rule_type: String,
    #[allow(missing_docs)]
    pub enabled: bool,
    #[allow(missing_docs)]
    pub cmab_uuid: Option<String>,
}

/// A user triggered a tracked event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionEvent {
    #[allow(missing_docs)]
    pub context: EventContext,
    #[allow(missing_docs)]
    pub uuid: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[allow(missing_docs)]
    pub user: Visitor,
    #[allow(missing_docs)]
    pub event: EntityRef,
    /// Integer revenue parsed from the `revenue` tag.
    pub revenue: Option<i64>,
    /// Numeric value parsed from the `value` tag.
    pub value: Option<f64>,
    #[allow(missing_docs)]
    pub tags: Option<EventTags>,
}

/// Event produced by a decision or a `track` call, waiting to be batched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserEvent {
    #[allow(missing_docs)]
    Impression(ImpressionEvent),
    #[allow(missing_docs)]
    Conversion(ConversionEvent),
}

impl UserEvent {
    #[allow(missing_docs)]
    pub fn context(&self) -> &EventContext {
        match self {
            UserEvent::Impression(event) => &event.context,
            UserEvent::Conversion(event) => &event.context,
        }
    }

    #[allow(missing_docs)]
    pub fn uuid(&self) -> &str {
        match self {
            UserEvent::Impression(event) => &event.uuid,
            UserEvent::Conversion(event) => &event.uuid,
        }
    }

    #[allow(missing_docs)]
    pub fn timestamp(&self) -> i64 {
        match self {
            UserEvent::Impression(event) => event.timestamp,
            UserEvent::Conversion(event) => event.timestamp,
        }
    }

    #[allow(missing_docs)]
    pub fn user(&self) -> &Visitor {
        match self {
            UserEvent::Impression(event) => &event.user,
            UserEvent::Conversion(event) => &event.user,
        }
    }

    /// Impression for `decision` of `flag_key`.
    pub(crate) fn impression(
        config: &ProjectConfig,
        flag_key: &str,
        decision: &FeatureDecision,
        user: &UserContext,
    ) -> UserEvent {
        let (layer, experiment) = match (&decision.experiment, &decision.holdout) {
            (Some(experiment), _) => (
                Some(EntityRef {
                    id: experiment.layer_id.clone(),
                    key: String::new(),
                }),
                Some(EntityRef {
                    id: experiment.id.clone(),
                    key: experiment.key.clone(),
                }),
            ),
            (None, Some(holdout)) => (
                None,
                Some(EntityRef {
                    id: holdout.id.clone(),
                    key: holdout.key.clone(),
                }),
            ),
            (None, None) => (None, None),
        };

        UserEvent::Impression(ImpressionEvent {
            context: EventContext::from_config(config),
            uuid: uuid::Uuid::new_v4().to_string(),
            timestamp: now_millis(),
            user: visitor(config, user),
            layer,
            experiment,
            variation: decision.variation.as_ref().map(|variation| EntityRef {
                id: variation.id.clone(),
                key: variation.key.clone(),
            }),
            rule_key: decision.rule_key().unwrap_or_default().to_owned(),
            flag_key: flag_key.to_owned(),
            rule_type: decision.decision_source.as_str().to_owned(),
            enabled: decision.enabled(),
            cmab_uuid: decision.cmab_uuid.clone(),
        })
    }

    /// Conversion of `event`, with `revenue` and `value` extracted from `tags`.
    pub(crate) fn conversion(
        config: &ProjectConfig,
        event: EntityRef,
        user: &UserContext,
        tags: Option<EventTags>,
    ) -> UserEvent {
        let revenue = tags.as_ref().and_then(revenue_value);
        let value = tags.as_ref().and_then(numeric_value);

        UserEvent::Conversion(ConversionEvent {
            context: EventContext::from_config(config),
            uuid: uuid::Uuid::new_v4().to_string(),
            timestamp: now_millis(),
            user: visitor(config, user),
            event,
            revenue,
            value,
            tags: tags.filter(|it| !it.is_empty()),
        })
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Reportable attributes of the user. Attributes the datafile does not declare are dropped, except
/// reserved `$opt_` ones.
fn visitor(config: &ProjectConfig, user: &UserContext) -> Visitor {
    let mut attributes = user
        .attributes()
        .iter()
        .filter(|(_, value)| value.is_reportable())
        .filter_map(|(key, value)| {
            let entity_id = match config.get_attribute(key) {
                Some(attribute) => attribute.id.clone(),
                None if key.starts_with(RESERVED_ATTRIBUTE_PREFIX) => key.clone(),
                None => {
                    log::debug!(target: "optimizely", attribute_key:display = key;
                                "attribute is not in the datafile, not reporting it");
                    return None;
                }
            };
            Some(VisitorAttribute {
                entity_id,
                key: key.clone(),
                value: value.clone(),
            })
        })
        .collect::<Vec<_>>();
    // Stable order for reproducible payloads.
    attributes.sort_by(|a, b| a.key.cmp(&b.key));

    Visitor {
        id: user.user_id().to_owned(),
        attributes,
    }
}

const REVENUE_TAG: &str = "revenue";
const VALUE_TAG: &str = "value";

/// Integer revenue from the `revenue` tag. Numbers and numeric strings are accepted, fractional
/// parts are truncated.
fn revenue_value(tags: &EventTags) -> Option<i64> {
    let raw = tags.get(REVENUE_TAG)?;
    let parsed = match raw {
        serde_json::Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().filter(|it| it.is_finite()).map(|it| it.trunc() as i64)),
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok().or_else(|| {
            s.trim()
                .parse::<f64>()
                .ok()
                .filter(|it| it.is_finite())
                .map(|it| it.trunc() as i64)
        }),
        _ => None,
    };
    match parsed {
        Some(revenue) => {
            log::info!(target: "optimizely", revenue; "parsed revenue value from event tags");
            Some(revenue)
        }
        None => {
            log::warn!(target: "optimizely", raw:display = raw;
                       "failed to parse revenue value from event tags");
            None
        }
    }
}

/// Finite numeric value from the `value` tag.
fn numeric_value(tags: &EventTags) -> Option<f64> {
    let raw = tags.get(VALUE_TAG)?;
    let parsed = match raw {
        serde_json::Value::Number(number) => number.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|it| it.is_finite());
    match parsed {
        Some(value) => {
            log::info!(target: "optimizely", value; "parsed numeric value from event tags");
            Some(value)
        }
        None => {
            log::warn!(target: "optimizely", raw:display = raw;
                       "failed to parse numeric value from event tags");
            None
        }
    }
}
