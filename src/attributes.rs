use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

/// Type alias for a HashMap representing user attributes.
///
/// # Examples
/// ```
/// # use optimizely::{UserAttributes, AttributeValue};
/// let attributes = [
///     ("age".to_owned(), 30.0.into()),
///     ("is_premium_member".to_owned(), true.into()),
///     ("browser".to_owned(), "firefox".into()),
/// ].into_iter().collect::<UserAttributes>();
/// ```
pub type UserAttributes = HashMap<String, AttributeValue>;

/// Largest integer magnitude that is exactly representable as `f64`. Numeric comparisons refuse
/// values outside of this range.
pub(crate) const MAX_SAFE_NUMBER: f64 = 9_007_199_254_740_992.0;

/// Enum representing possible values of a user attribute.
///
/// Conveniently implements `From` conversions for `String`, `&str`, `f64`, and `bool` types.
#[derive(Debug, Serialize, Deserialize, PartialEq, PartialOrd, From, Clone)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A string value.
    String(String),
    /// A numerical value.
    Number(f64),
    /// A boolean value.
    Boolean(bool),
    /// A null value or absence of value.
    Null,
}

impl AttributeValue {
    /// Return the string value, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        if let AttributeValue::String(s) = self {
            Some(s.as_str())
        } else {
            None
        }
    }

    /// Return the numeric value, if this is a finite number.
    pub fn as_finite_number(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(n) if n.is_finite() => Some(*n),
            _ => None,
        }
    }

    /// Returns `true` if the value can be sent to the event endpoint as a visitor attribute.
    pub(crate) fn is_reportable(&self) -> bool {
        match self {
            AttributeValue::String(_) | AttributeValue::Boolean(_) => true,
            AttributeValue::Number(n) => n.is_finite() && n.abs() <= MAX_SAFE_NUMBER,
            AttributeValue::Null => false,
        }
    }

    pub(crate) fn to_json(&self) -> serde_json::Value {
        match self {
            AttributeValue::String(s) => serde_json::Value::String(s.clone()),
            AttributeValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            AttributeValue::Boolean(b) => serde_json::Value::Bool(*b),
            AttributeValue::Null => serde_json::Value::Null,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::AttributeValue;

    #[test]
    fn reportable_values() {
        assert!(AttributeValue::from("chrome").is_reportable());
        assert!(AttributeValue::from(false).is_reportable());
        assert!(AttributeValue::from(42.5).is_reportable());
        assert!(!AttributeValue::Null.is_reportable());
        assert!(!AttributeValue::from(f64::NAN).is_reportable());
        assert!(!AttributeValue::from(f64::INFINITY).is_reportable());
        assert!(!AttributeValue::from(2f64.powi(60)).is_reportable());
    }

    #[test]
    fn deserializes_untagged() {
        let value: AttributeValue = serde_json::from_str("12").unwrap();
        assert_eq!(value, AttributeValue::Number(12.0));
        let value: AttributeValue = serde_json::from_str("null").unwrap();
        assert_eq!(value, AttributeValue::Null);
    }
}
