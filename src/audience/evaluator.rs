use std::{collections::HashMap, sync::Arc};

use serde_json::Value;

use crate::{
    audience::{ConditionTree, MatchCondition, Tristate},
    UserAttributes,
};

/// An audience of the project with its parsed conditions.
#[derive(Debug, Clone)]
pub struct Audience {
    #[allow(missing_docs)]
    pub id: String,
    #[allow(missing_docs)]
    pub name: String,
    pub(crate) conditions: ConditionTree<MatchCondition>,
}

impl Audience {
    /// Parse audience conditions. Legacy audiences carry their conditions as a JSON-encoded
    /// string, typed audiences as plain JSON.
    pub(crate) fn parse(id: String, name: String, conditions: &Value) -> Audience {
        let decoded;
        let conditions = match conditions {
            Value::String(encoded) => {
                decoded = serde_json::from_str(encoded).unwrap_or_else(|err| {
                    log::warn!(target: "optimizely", audience_id:display = id;
                               "unable to decode audience conditions: {err}");
                    Value::Array(Vec::new())
                });
                &decoded
            }
            conditions => conditions,
        };

        Audience {
            conditions: ConditionTree::from_json(conditions, &MatchCondition::from_json),
            id,
            name,
        }
    }

    /// Names of ODP segments referenced by `qualified` conditions of this audience.
    pub(crate) fn segments(&self) -> Vec<String> {
        let mut segments = Vec::new();
        self.conditions.for_each_leaf(&mut |condition: &MatchCondition| {
            if let Some(segment) = condition.segment_name() {
                segments.push(segment.to_owned());
            }
        });
        segments
    }
}

/// Evaluates audience conditions for a single user.
pub struct AudienceEvaluator<'a> {
    attributes: &'a UserAttributes,
    segments: Option<&'a [String]>,
}

impl<'a> AudienceEvaluator<'a> {
    /// `segments` holds the ODP segments the user qualifies for, or `None` if they were never
    /// fetched.
    pub fn new(attributes: &'a UserAttributes, segments: Option<&'a [String]>) -> Self {
        AudienceEvaluator {
            attributes,
            segments,
        }
    }

    /// Returns `true` if the user matches `audience_conditions`.
    ///
    /// Leaves of `audience_conditions` are audience ids. No conditions means everyone matches.
    /// `Unknown` at the top level does not match.
    pub fn evaluate(
        &self,
        audience_conditions: Option<&ConditionTree<String>>,
        audiences_by_id: &HashMap<String, Arc<Audience>>,
    ) -> bool {
        let Some(audience_conditions) = audience_conditions else {
            return true;
        };

        audience_conditions
            .evaluate(&mut |audience_id: &String| match audiences_by_id.get(audience_id) {
                Some(audience) => self.evaluate_audience(audience),
                None => {
                    log::warn!(target: "optimizely", audience_id:display = audience_id;
                               "audience is not present in the datafile");
                    Tristate::Unknown
                }
            })
            .is_true()
    }

    /// Evaluate a single audience.
    pub fn evaluate_audience(&self, audience: &Audience) -> Tristate {
        let result = audience
            .conditions
            .evaluate(&mut |condition: &MatchCondition| {
                condition.evaluate(self.attributes, self.segments)
            });
        log::trace!(target: "optimizely",
                    audience_id:display = audience.id,
                    result:debug = result;
                    "evaluated audience");
        result
    }
}
