//! Wire format of event batches.
use serde::{Deserialize, Serialize};

use crate::{
    datafile::Region,
    events::{EventContext, EventTags, UserEvent, VisitorAttribute},
};

/// Event endpoint of projects hosted in the US (and the default).
pub const US_EVENT_ENDPOINT: &str = "https://logx.optimizely.com/v1/events";
/// Event endpoint of projects hosted in the EU.
pub const EU_EVENT_ENDPOINT: &str = "https://eu.logx.optimizely.com/v1/events";

const ACTIVATE_EVENT_KEY: &str = "campaign_activated";
const CUSTOM_ATTRIBUTE_TYPE: &str = "custom";
const BOT_FILTERING_ATTRIBUTE: &str = "$opt_bot_filtering";

/// Payload accepted by the event endpoint. All events of a batch share one context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
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
    pub enrich_decisions: bool,
    #[allow(missing_docs)]
    pub visitors: Vec<BatchVisitor>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchVisitor {
    pub visitor_id: String,
    pub attributes: Vec<BatchAttribute>,
    pub snapshots: Vec<Snapshot>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchAttribute {
    pub entity_id: String,
    pub key: String,
    #[serde(rename = "type")]
    pub attribute_type: String,
    pub value: serde_json::Value,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub decisions: Vec<BatchDecision>,
    pub events: Vec<SnapshotEvent>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchDecision {
    pub campaign_id: String,
    pub experiment_id: String,
    pub variation_id: String,
    pub metadata: DecisionMetadata,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionMetadata {
    pub flag_key: String,
    pub rule_key: String,
    pub rule_type: String,
    pub variation_key: String,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmab_uuid: Option<String>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEvent {
    pub entity_id: String,
    pub key: String,
    pub timestamp: i64,
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revenue: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<EventTags>,
}

/// A batch ready to be sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    #[allow(missing_docs)]
    pub url: String,
    #[allow(missing_docs)]
    pub http_verb: String,
    #[allow(missing_docs)]
    pub params: EventBatch,
}

/// Event endpoint of `region`.
pub fn event_endpoint(region: Region) -> &'static str {
    match region {
        Region::EU => EU_EVENT_ENDPOINT,
        Region::US => US_EVENT_ENDPOINT,
    }
}

/// Build the batch payload of `events`. The batch context is taken from the first event.
pub fn make_event_batch(events: &[UserEvent]) -> EventBatch {
    let context = events
        .first()
        .map(UserEvent::context)
        .cloned()
        .unwrap_or_default();

    EventBatch {
        account_id: context.account_id.clone(),
        project_id: context.project_id.clone(),
        revision: context.revision.clone(),
        client_name: context.client_name.clone(),
        client_version: context.client_version.clone(),
        anonymize_ip: context.anonymize_ip,
        enrich_decisions: true,
        visitors: events.iter().map(make_visitor).collect(),
    }
}

/// [`make_event_batch`] plus the endpoint the batch goes to.
pub fn format_events(events: &[UserEvent]) -> LogEvent {
    let region = events
        .first()
        .map(|it| it.context().region)
        .unwrap_or_default();
    LogEvent {
        url: event_endpoint(region).to_owned(),
        http_verb: "POST".to_owned(),
        params: make_event_batch(events),
    }
}

fn make_visitor(event: &UserEvent) -> BatchVisitor {
    let user = event.user();
    let mut attributes = user
        .attributes
        .iter()
        .map(batch_attribute)
        .collect::<Vec<_>>();
    if let Some(bot_filtering) = event.context().bot_filtering {
        attributes.push(BatchAttribute {
            entity_id: BOT_FILTERING_ATTRIBUTE.to_owned(),
            key: BOT_FILTERING_ATTRIBUTE.to_owned(),
            attribute_type: CUSTOM_ATTRIBUTE_TYPE.to_owned(),
            value: bot_filtering.into(),
        });
    }

    let snapshot = match event {
        UserEvent::Impression(impression) => Snapshot {
            decisions: vec![BatchDecision {
                campaign_id: impression
                    .layer
                    .as_ref()
                    .map(|it| it.id.clone())
                    .unwrap_or_default(),
                experiment_id: impression
                    .experiment
                    .as_ref()
                    .map(|it| it.id.clone())
                    .unwrap_or_default(),
                variation_id: impression
                    .variation
                    .as_ref()
                    .map(|it| it.id.clone())
                    .unwrap_or_default(),
                metadata: DecisionMetadata {
                    flag_key: impression.flag_key.clone(),
                    rule_key: impression.rule_key.clone(),
                    rule_type: impression.rule_type.clone(),
                    variation_key: impression
                        .variation
                        .as_ref()
                        .map(|it| it.key.clone())
                        .unwrap_or_default(),
                    enabled: impression.enabled,
                    cmab_uuid: impression.cmab_uuid.clone(),
                },
            }],
            events: vec![SnapshotEvent {
                entity_id: impression
                    .layer
                    .as_ref()
                    .map(|it| it.id.clone())
                    .unwrap_or_default(),
                key: ACTIVATE_EVENT_KEY.to_owned(),
                timestamp: impression.timestamp,
                uuid: impression.uuid.clone(),
                revenue: None,
                value: None,
                tags: None,
            }],
        },
        UserEvent::Conversion(conversion) => Snapshot {
            decisions: Vec::new(),
            events: vec![SnapshotEvent {
                entity_id: conversion.event.id.clone(),
                key: conversion.event.key.clone(),
                timestamp: conversion.timestamp,
                uuid: conversion.uuid.clone(),
                revenue: conversion.revenue,
                value: conversion.value,
                tags: conversion.tags.clone(),
            }],
        },
    };

    BatchVisitor {
        visitor_id: user.id.clone(),
        attributes,
        snapshots: vec![snapshot],
    }
}

fn batch_attribute(attribute: &VisitorAttribute) -> BatchAttribute {
    BatchAttribute {
        entity_id: attribute.entity_id.clone(),
        key: attribute.key.clone(),
        attribute_type: CUSTOM_ATTRIBUTE_TYPE.to_owned(),
        value: attribute.value.to_json(),
    }
}

/// Whether `event` can join a batch whose events have `context`.
pub(crate) fn is_same_context(context: &EventContext, event: &UserEvent) -> bool {
    context == event.context()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{format_events, make_event_batch, EU_EVENT_ENDPOINT, US_EVENT_ENDPOINT};
    use crate::{
        datafile::Region,
        decision::{DecisionSource, FeatureDecision},
        events::{user_event::tests::config, EntityRef, UserEvent},
        user_context::UserContext,
    };

    fn impression() -> UserEvent {
        let config = config();
        let experiment = config.get_experiment_by_key("exp_1").unwrap();
        let decision = FeatureDecision {
            experiment: Some(experiment.clone()),
            holdout: None,
            variation: experiment.variations.first().cloned(),
            decision_source: DecisionSource::FeatureTest,
            cmab_uuid: None,
        };
        let mut user = UserContext::new("user-1", Default::default());
        user.set_attribute("browser", "chrome");
        UserEvent::impression(&config, "flag_1", &decision, &user)
    }

    fn conversion() -> UserEvent {
        let config = config();
        let tags = serde_json::from_value(json!({"revenue": 0, "value": "1.5", "size": "xl"}));
        UserEvent::conversion(
            &config,
            EntityRef {
                id: "111099".to_owned(),
                key: "purchase".to_owned(),
            },
            &UserContext::new("user-2", Default::default()),
            Some(tags.unwrap()),
        )
    }

    #[test]
    fn impression_payload() {
        let event = impression();
        let batch = serde_json::to_value(make_event_batch(&[event.clone()])).unwrap();

        assert_eq!(batch["account_id"], "12001");
        assert_eq!(batch["revision"], "42");
        assert_eq!(batch["client_name"], "rust-sdk");
        assert_eq!(batch["enrich_decisions"], true);

        let visitor = &batch["visitors"][0];
        assert_eq!(visitor["visitor_id"], "user-1");
        assert_eq!(
            visitor["attributes"],
            json!([
                {"entity_id": "111094", "key": "browser", "type": "custom", "value": "chrome"},
                {
                    "entity_id": "$opt_bot_filtering",
                    "key": "$opt_bot_filtering",
                    "type": "custom",
                    "value": true
                }
            ])
        );

        let snapshot = &visitor["snapshots"][0];
        assert_eq!(
            snapshot["decisions"][0],
            json!({
                "campaign_id": "9001",
                "experiment_id": "2001",
                "variation_id": "2002",
                "metadata": {
                    "flag_key": "flag_1",
                    "rule_key": "exp_1",
                    "rule_type": "feature-test",
                    "variation_key": "a",
                    "enabled": true
                }
            })
        );
        assert_eq!(snapshot["events"][0]["key"], "campaign_activated");
        assert_eq!(snapshot["events"][0]["entity_id"], "9001");
        assert_eq!(snapshot["events"][0]["uuid"], event.uuid());
    }

    #[test]
    fn conversion_payload() {
        let batch = serde_json::to_value(make_event_batch(&[conversion()])).unwrap();
        let snapshot = &batch["visitors"][0]["snapshots"][0];

        assert!(snapshot.get("decisions").is_none());
        let event = &snapshot["events"][0];
        assert_eq!(event["entity_id"], "111099");
        assert_eq!(event["key"], "purchase");
        assert_eq!(event["revenue"], 0);
        assert_eq!(event["value"], 1.5);
        assert_eq!(event["tags"]["revenue"], 0);
        assert_eq!(event["tags"]["size"], "xl");
    }

    #[test]
    fn one_visitor_per_event() {
        let batch = make_event_batch(&[impression(), conversion()]);
        assert_eq!(batch.visitors.len(), 2);
        assert_eq!(batch.visitors[1].visitor_id, "user-2");
    }

    #[test]
    fn endpoint_follows_region() {
        let mut event = impression();
        assert_eq!(format_events(&[event.clone()]).url, US_EVENT_ENDPOINT);

        if let UserEvent::Impression(impression) = &mut event {
            impression.context.region = Region::EU;
        }
        let log_event = format_events(&[event]);
        assert_eq!(log_event.url, EU_EVENT_ENDPOINT);
        assert_eq!(log_event.http_verb, "POST");
    }
}
