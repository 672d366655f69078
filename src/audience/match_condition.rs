use std::cmp::Ordering;

use serde::Deserialize;
use serde_json::Value;

use crate::{
    attributes::{AttributeValue, MAX_SAFE_NUMBER},
    audience::{version::compare_versions, Tristate},
    UserAttributes,
};

/// Condition type for user attribute matches.
pub(crate) const CUSTOM_ATTRIBUTE_CONDITION_TYPE: &str = "custom_attribute";
/// Condition type for ODP segment matches.
pub(crate) const THIRD_PARTY_DIMENSION_CONDITION_TYPE: &str = "third_party_dimension";

/// A leaf condition of an audience, e.g.
/// `{"name": "age", "type": "custom_attribute", "match": "gt", "value": 18}`.
///
/// Every field is optional so that a malformed leaf still parses and evaluates to
/// [`Tristate::Unknown`] instead of invalidating the whole audience.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MatchCondition {
    #[allow(missing_docs)]
    #[serde(default)]
    pub name: Option<String>,
    #[allow(missing_docs)]
    #[serde(default, rename = "type")]
    pub condition_type: Option<String>,
    #[allow(missing_docs)]
    #[serde(default, rename = "match")]
    pub match_type: Option<String>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub value: Option<Value>,
}

/// Supported match types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    /// Equality of strings, numbers or booleans. Default when `match` is absent.
    Exact,
    /// Attribute is present and not null.
    Exists,
    /// Attribute string contains the condition string.
    Substring,
    #[allow(missing_docs)]
    Gt,
    #[allow(missing_docs)]
    Ge,
    #[allow(missing_docs)]
    Lt,
    #[allow(missing_docs)]
    Le,
    #[allow(missing_docs)]
    SemverEq,
    #[allow(missing_docs)]
    SemverGt,
    #[allow(missing_docs)]
    SemverGe,
    #[allow(missing_docs)]
    SemverLt,
    #[allow(missing_docs)]
    SemverLe,
    /// User is qualified for the ODP segment named by the condition value.
    Qualified,
}

impl MatchType {
    fn parse(s: &str) -> Option<MatchType> {
        Some(match s {
            "exact" => MatchType::Exact,
            "exists" => MatchType::Exists,
            "substring" => MatchType::Substring,
            "gt" => MatchType::Gt,
            "ge" => MatchType::Ge,
            "lt" => MatchType::Lt,
            "le" => MatchType::Le,
            "semver_eq" => MatchType::SemverEq,
            "semver_gt" => MatchType::SemverGt,
            "semver_ge" => MatchType::SemverGe,
            "semver_lt" => MatchType::SemverLt,
            "semver_le" => MatchType::SemverLe,
            "qualified" => MatchType::Qualified,
            _ => return None,
        })
    }
}

impl MatchCondition {
    pub(crate) fn from_json(value: &Value) -> MatchCondition {
        serde_json::from_value(value.clone()).unwrap_or_else(|err| {
            log::warn!(target: "optimizely", "unable to parse audience condition {value}: {err}");
            MatchCondition::default()
        })
    }

    /// Name of the ODP segment if this is a `qualified` condition.
    pub(crate) fn segment_name(&self) -> Option<&str> {
        if self.match_type.as_deref() == Some("qualified") {
            self.value.as_ref().and_then(Value::as_str)
        } else {
            None
        }
    }

    /// Evaluate the condition against the user.
    pub(crate) fn evaluate(
        &self,
        attributes: &UserAttributes,
        segments: Option<&[String]>,
    ) -> Tristate {
        let match_type = match self.match_type.as_deref() {
            None => MatchType::Exact,
            Some(s) => match MatchType::parse(s) {
                Some(m) => m,
                None => {
                    log::warn!(target: "optimizely", condition:debug = self;
                               "audience condition uses an unknown match type");
                    return Tristate::Unknown;
                }
            },
        };

        match (self.condition_type.as_deref(), match_type) {
            (Some(THIRD_PARTY_DIMENSION_CONDITION_TYPE), MatchType::Qualified) => {
                self.eval_qualified(segments)
            }
            (Some(CUSTOM_ATTRIBUTE_CONDITION_TYPE), MatchType::Qualified) => {
                log::warn!(target: "optimizely", condition:debug = self;
                           "qualified match requires third_party_dimension condition type");
                Tristate::Unknown
            }
            (Some(CUSTOM_ATTRIBUTE_CONDITION_TYPE), m) => self.eval_attribute(m, attributes),
            _ => {
                log::warn!(target: "optimizely", condition:debug = self;
                           "audience condition uses an unknown condition type");
                Tristate::Unknown
            }
        }
    }

    fn eval_qualified(&self, segments: Option<&[String]>) -> Tristate {
        let Some(segment) = self.value.as_ref().and_then(Value::as_str) else {
            log::warn!(target: "optimizely", condition:debug = self;
                       "qualified condition value must be a string");
            return Tristate::Unknown;
        };
        segments
            .is_some_and(|segments| segments.iter().any(|it| it == segment))
            .into()
    }

    fn eval_attribute(&self, match_type: MatchType, attributes: &UserAttributes) -> Tristate {
        let attribute = self.name.as_deref().and_then(|name| attributes.get(name));

        if match_type == MatchType::Exists {
            return matches!(attribute, Some(v) if *v != AttributeValue::Null).into();
        }

        let Some(condition_value) = self.value.as_ref() else {
            log::warn!(target: "optimizely", condition:debug = self;
                       "audience condition has no value");
            return Tristate::Unknown;
        };

        let attribute = match attribute {
            None => {
                log::debug!(target: "optimizely", condition:debug = self;
                            "attribute is missing, condition evaluates to unknown");
                return Tristate::Unknown;
            }
            Some(AttributeValue::Null) => {
                log::debug!(target: "optimizely", condition:debug = self;
                            "attribute is null, condition evaluates to unknown");
                return Tristate::Unknown;
            }
            Some(attribute) => attribute,
        };

        let result = match match_type {
            MatchType::Exact => exact(attribute, condition_value),
            MatchType::Substring => substring(attribute, condition_value),
            MatchType::Gt | MatchType::Ge | MatchType::Lt | MatchType::Le => {
                numeric(attribute, condition_value).map(|ordering| match match_type {
                    MatchType::Gt => ordering == Ordering::Greater,
                    MatchType::Ge => ordering != Ordering::Less,
                    MatchType::Lt => ordering == Ordering::Less,
                    _ => ordering != Ordering::Greater,
                })
            }
            MatchType::SemverEq
            | MatchType::SemverGt
            | MatchType::SemverGe
            | MatchType::SemverLt
            | MatchType::SemverLe => {
                semver(attribute, condition_value).map(|ordering| match match_type {
                    MatchType::SemverEq => ordering == Ordering::Equal,
                    MatchType::SemverGt => ordering == Ordering::Greater,
                    MatchType::SemverGe => ordering != Ordering::Less,
                    MatchType::SemverLt => ordering == Ordering::Less,
                    _ => ordering != Ordering::Greater,
                })
            }
            MatchType::Exists | MatchType::Qualified => None,
        };

        if result.is_none() {
            log::warn!(target: "optimizely",
                       condition:debug = self,
                       attribute:debug = attribute;
                       "attribute has an unexpected type or value for this condition");
        }
        result.into()
    }
}

/// Number that is finite and exactly representable, or `None`.
fn safe_number(value: f64) -> Option<f64> {
    (value.is_finite() && value.abs() <= MAX_SAFE_NUMBER).then_some(value)
}

fn exact(attribute: &AttributeValue, condition_value: &Value) -> Option<bool> {
    match (condition_value, attribute) {
        (Value::String(c), AttributeValue::String(a)) => Some(c == a),
        (Value::Bool(c), AttributeValue::Boolean(a)) => Some(c == a),
        (Value::Number(c), AttributeValue::Number(a)) => {
            let c = safe_number(c.as_f64()?)?;
            let a = safe_number(*a)?;
            Some(c == a)
        }
        _ => None,
    }
}

fn substring(attribute: &AttributeValue, condition_value: &Value) -> Option<bool> {
    let condition = condition_value.as_str()?;
    let attribute = attribute.as_str()?;
    Some(attribute.contains(condition))
}

/// Compare the attribute against the condition value.
fn numeric(attribute: &AttributeValue, condition_value: &Value) -> Option<Ordering> {
    let condition = safe_number(condition_value.as_f64()?)?;
    let attribute = match attribute {
        AttributeValue::Number(n) => safe_number(*n)?,
        _ => return None,
    };
    attribute.partial_cmp(&condition)
}

/// Compare the attribute version against the condition version.
fn semver(attribute: &AttributeValue, condition_value: &Value) -> Option<Ordering> {
    let condition = condition_value.as_str()?;
    let attribute = attribute.as_str()?;
    compare_versions(condition, attribute)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::MatchCondition;
    use crate::{audience::Tristate, AttributeValue, UserAttributes};

    fn condition(value: serde_json::Value) -> MatchCondition {
        MatchCondition::from_json(&value)
    }

    fn attrs(name: &str, value: impl Into<AttributeValue>) -> UserAttributes {
        HashMap::from([(name.to_owned(), value.into())])
    }

    fn eval(c: serde_json::Value, attributes: &UserAttributes) -> Tristate {
        condition(c).evaluate(attributes, None)
    }

    #[test]
    fn exact_match() {
        let c = json!({
            "name": "browser",
            "type": "custom_attribute",
            "match": "exact",
            "value": "safari",
        });
        assert_eq!(eval(c.clone(), &attrs("browser", "safari")), Tristate::True);
        assert_eq!(eval(c.clone(), &attrs("browser", "chrome")), Tristate::False);
        assert_eq!(eval(c.clone(), &attrs("browser", 42.0)), Tristate::Unknown);
        assert_eq!(eval(c, &HashMap::new()), Tristate::Unknown);
    }

    #[test]
    fn missing_match_type_defaults_to_exact() {
        let c = json!({"name": "is_beta", "type": "custom_attribute", "value": true});
        assert_eq!(eval(c.clone(), &attrs("is_beta", true)), Tristate::True);
        assert_eq!(eval(c, &attrs("is_beta", false)), Tristate::False);
    }

    #[test]
    fn exact_number_out_of_bounds() {
        let c = json!({"name": "n", "type": "custom_attribute", "match": "exact", "value": 10});
        assert_eq!(eval(c.clone(), &attrs("n", 10.0)), Tristate::True);
        assert_eq!(eval(c, &attrs("n", 2f64.powi(60))), Tristate::Unknown);
    }

    #[test]
    fn exists_match() {
        let c = json!({"name": "plan", "type": "custom_attribute", "match": "exists"});
        assert_eq!(eval(c.clone(), &attrs("plan", "gold")), Tristate::True);
        assert_eq!(eval(c.clone(), &attrs("plan", AttributeValue::Null)), Tristate::False);
        assert_eq!(eval(c, &HashMap::new()), Tristate::False);
    }

    #[test]
    fn substring_match() {
        let c = json!({
            "name": "url",
            "type": "custom_attribute",
            "match": "substring",
            "value": "/checkout",
        });
        assert_eq!(eval(c.clone(), &attrs("url", "https://shop/checkout/1")), Tristate::True);
        assert_eq!(eval(c.clone(), &attrs("url", "https://shop/cart")), Tristate::False);
        assert_eq!(eval(c, &attrs("url", true)), Tristate::Unknown);
    }

    #[test]
    fn numeric_matches() {
        let gt = json!({"name": "age", "type": "custom_attribute", "match": "gt", "value": 18});
        let ge = json!({"name": "age", "type": "custom_attribute", "match": "ge", "value": 18});
        let lt = json!({"name": "age", "type": "custom_attribute", "match": "lt", "value": 18});
        let le = json!({"name": "age", "type": "custom_attribute", "match": "le", "value": 18});
        assert_eq!(eval(gt.clone(), &attrs("age", 19.0)), Tristate::True);
        assert_eq!(eval(gt, &attrs("age", 18.0)), Tristate::False);
        assert_eq!(eval(ge, &attrs("age", 18.0)), Tristate::True);
        assert_eq!(eval(lt.clone(), &attrs("age", 17.5)), Tristate::True);
        assert_eq!(eval(lt, &attrs("age", "17")), Tristate::Unknown);
        assert_eq!(eval(le, &attrs("age", 18.0)), Tristate::True);
    }

    #[test]
    fn semver_matches() {
        let ge = json!({
            "name": "app",
            "type": "custom_attribute",
            "match": "semver_ge",
            "value": "2.1",
        });
        assert_eq!(eval(ge.clone(), &attrs("app", "2.1.9")), Tristate::True);
        assert_eq!(eval(ge.clone(), &attrs("app", "2.0.9")), Tristate::False);
        assert_eq!(eval(ge.clone(), &attrs("app", "not a version")), Tristate::Unknown);
        assert_eq!(eval(ge, &attrs("app", 2.1)), Tristate::Unknown);

        let eq = json!({
            "name": "app",
            "type": "custom_attribute",
            "match": "semver_eq",
            "value": "3.0.0",
        });
        assert_eq!(eval(eq.clone(), &attrs("app", "3.0.0")), Tristate::True);
        assert_eq!(eval(eq, &attrs("app", "3.0.0-beta")), Tristate::False);
    }

    #[test]
    fn qualified_match() {
        let c = condition(json!({
            "name": "odp.audiences",
            "type": "third_party_dimension",
            "match": "qualified",
            "value": "vip",
        }));
        let segments = vec!["vip".to_owned(), "churned".to_owned()];
        assert_eq!(c.evaluate(&HashMap::new(), Some(segments.as_slice())), Tristate::True);
        assert_eq!(c.evaluate(&HashMap::new(), Some(&[][..])), Tristate::False);
        assert_eq!(c.evaluate(&HashMap::new(), None), Tristate::False);
        assert_eq!(c.segment_name(), Some("vip"));
    }

    #[test]
    fn unknown_types_are_unknown() {
        let c = json!({"name": "a", "type": "custom_attribute", "match": "regex", "value": "x"});
        assert_eq!(eval(c, &attrs("a", "x")), Tristate::Unknown);
        let c = json!({"name": "a", "type": "weird", "match": "exact", "value": "x"});
        assert_eq!(eval(c, &attrs("a", "x")), Tristate::Unknown);
        assert_eq!(eval(json!("not an object"), &attrs("a", "x")), Tristate::Unknown);
    }
}
