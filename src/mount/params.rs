//! Caller-supplied bind parameters
//!
//! Raw bind parameters arrive as a JSON object. They are narrowed here into a
//! map of small tagged values; anything that is not a string, boolean or
//! number is rejected at the boundary.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Parameters as submitted by the caller, keyed by parameter name
pub type BindParameters = BTreeMap<String, ParamValue>;

// =============================================================================
// Parameter Value
// =============================================================================

/// A single caller-supplied parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
}

impl ParamValue {
    /// Narrow a JSON value, naming `key` if it has an unsupported shape
    pub fn from_json(key: &str, value: Value) -> Result<Self> {
        match value {
            Value::Bool(b) => Ok(ParamValue::Bool(b)),
            Value::Number(n) => Ok(ParamValue::Number(n)),
            Value::String(s) => Ok(ParamValue::Text(s)),
            Value::Null => Err(Error::invalid(key, "value must not be null")),
            Value::Array(_) | Value::Object(_) => Err(Error::invalid(
                key,
                "value must be a string, boolean or number",
            )),
        }
    }

    /// String form used inside a mount configuration
    pub fn to_mount_value(&self) -> String {
        match self {
            ParamValue::Bool(b) => b.to_string(),
            ParamValue::Number(n) => n.to_string(),
            ParamValue::Text(s) => s.clone(),
        }
    }

    /// Borrow the value if it is a string
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get the value if it is a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Text(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        ParamValue::Text(s)
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        ParamValue::Bool(b)
    }
}

impl From<i64> for ParamValue {
    fn from(n: i64) -> Self {
        ParamValue::Number(n.into())
    }
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode raw JSON bind parameters
///
/// Empty input and a JSON `null` both mean "no parameters".
pub fn parse_parameters(raw: &[u8]) -> Result<BindParameters> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(BindParameters::new());
    }

    let value: Value = serde_json::from_slice(raw)
        .map_err(|e| Error::invalid("parameters", format!("not valid JSON: {}", e)))?;

    match value {
        Value::Null => Ok(BindParameters::new()),
        Value::Object(map) => map
            .into_iter()
            .map(|(key, value)| ParamValue::from_json(&key, value).map(|v| (key, v)))
            .collect(),
        _ => Err(Error::invalid("parameters", "must be a JSON object")),
    }
}
