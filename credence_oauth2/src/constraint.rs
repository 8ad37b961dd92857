//! Constraints on the claims a tenant accepts

use std::fmt;

use serde::Deserialize;
use serde_json::Value;

use crate::Claims;

/// The JSON type of a claim value
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JsonType {
    /// A string
    String,
    /// Any number
    Number,
    /// `true` or `false`
    Boolean,
    /// An array
    Array,
    /// An object
    Object,
    /// `null`
    Null,
}

impl JsonType {
    fn of(value: &Value) -> Self {
        match value {
            Value::String(_) => Self::String,
            Value::Number(_) => Self::Number,
            Value::Bool(_) => Self::Boolean,
            Value::Array(_) => Self::Array,
            Value::Object(_) => Self::Object,
            Value::Null => Self::Null,
        }
    }
}

impl fmt::Display for JsonType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::Null => "null",
        })
    }
}

/// A requirement on a single claim
///
/// ```
/// # use credence_oauth2::ClaimConstraint;
/// let constraint: ClaimConstraint = serde_json::from_value(serde_json::json!({
///     "contains": { "claim": "scope", "value": "orders.read" }
/// })).unwrap();
/// assert_eq!(constraint.claim(), "scope");
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum ClaimConstraint {
    /// The claim equals `value`
    Equals {
        /// The claim name
        claim: String,
        /// The required value
        value: Value,
    },
    /// The claim is an array holding `value`, or a space-delimited string holding
    /// the string `value`, as `scope` claims are
    Contains {
        /// The claim name
        claim: String,
        /// The required member
        value: Value,
    },
    /// The claim has the given JSON type
    OfType {
        /// The claim name
        claim: String,
        /// The required type
        #[serde(rename = "type")]
        json_type: JsonType,
    },
    /// The claim is present, with any value
    Present {
        /// The claim name
        claim: String,
    },
}

impl ClaimConstraint {
    /// The name of the constrained claim
    pub fn claim(&self) -> &str {
        match self {
            Self::Equals { claim, .. }
            | Self::Contains { claim, .. }
            | Self::OfType { claim, .. }
            | Self::Present { claim } => claim,
        }
    }

    /// Whether `claims` satisfy this constraint
    pub fn is_satisfied_by(&self, claims: &Claims) -> bool {
        let Some(actual) = claims.get(self.claim()) else {
            return false;
        };

        match self {
            Self::Equals { value, .. } => actual == value,
            Self::Contains { value, .. } => match (actual, value) {
                (Value::Array(members), _) => members.contains(value),
                (Value::String(list), Value::String(item)) => {
                    list.split_whitespace().any(|member| member == item)
                }
                _ => false,
            },
            Self::OfType { json_type, .. } => JsonType::of(actual) == *json_type,
            Self::Present { .. } => true,
        }
    }
}

impl fmt::Display for ClaimConstraint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Equals { claim, value } => write!(f, "`{}` equals {}", claim, value),
            Self::Contains { claim, value } => write!(f, "`{}` contains {}", claim, value),
            Self::OfType { claim, json_type } => write!(f, "`{}` is a {}", claim, json_type),
            Self::Present { claim } => write!(f, "`{}` is present", claim),
        }
    }
}
