//! Tagged data-point value accessors (spec §9: "Dynamic typing of JSON values").
//!
//! Adapters read arbitrary JSON scalars out of a device's `dps` map.
//! This wraps that map with typed accessors that distinguish a missing
//! key from one holding the wrong JSON type, rather than adapters
//! chaining `.get().and_then()` themselves.

use std::fmt;

#[derive(Debug, PartialEq)]
pub enum DpsAccessError {
    Missing,
    WrongType { expected: &'static str, found: &'static str },
}

impl fmt::Display for DpsAccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DpsAccessError::Missing => write!(f, "data point missing"),
            DpsAccessError::WrongType { expected, found } => {
                write!(f, "expected {expected}, found {found}")
            }
        }
    }
}

impl std::error::Error for DpsAccessError {}

/// A read-only view over a device's `{"dps": {"<id>": value, ...}}` map.
/// Values are raw JSON scalars; no type coercion happens at this layer
/// (spec §3) — coercion is exactly what the typed accessors below do,
/// explicitly and per-call.
pub struct DpsMap<'a> {
    dps: &'a serde_json::Value,
}

impl<'a> DpsMap<'a> {
    /// Build a view from a full device response, looking under the
    /// `"dps"` key if present, else treating the value itself as the map
    /// (some responses are already unwrapped).
    pub fn from_response(response: &'a serde_json::Value) -> Self {
        DpsMap { dps: response.get("dps").unwrap_or(response) }
    }

    fn get(&self, id: u32) -> Result<&serde_json::Value, DpsAccessError> {
        self.dps.get(id.to_string()).ok_or(DpsAccessError::Missing)
    }

    pub fn get_bool(&self, id: u32) -> Result<bool, DpsAccessError> {
        let v = self.get(id)?;
        v.as_bool().ok_or(DpsAccessError::WrongType { expected: "bool", found: type_name(v) })
    }

    pub fn get_i64(&self, id: u32) -> Result<i64, DpsAccessError> {
        let v = self.get(id)?;
        v.as_i64().ok_or(DpsAccessError::WrongType { expected: "integer", found: type_name(v) })
    }

    pub fn get_str(&self, id: u32) -> Result<&str, DpsAccessError> {
        let v = self.get(id)?;
        v.as_str().ok_or(DpsAccessError::WrongType { expected: "string", found: type_name(v) })
    }

    pub fn get_object(&self, id: u32) -> Result<&serde_json::Map<String, serde_json::Value>, DpsAccessError> {
        let v = self.get(id)?;
        v.as_object().ok_or(DpsAccessError::WrongType { expected: "object", found: type_name(v) })
    }

    pub fn get_array(&self, id: u32) -> Result<&Vec<serde_json::Value>, DpsAccessError> {
        let v = self.get(id)?;
        v.as_array().ok_or(DpsAccessError::WrongType { expected: "array", found: type_name(v) })
    }

    /// The raw JSON value for a data point, with no type assertion.
    pub fn get_raw(&self, id: u32) -> Option<&serde_json::Value> {
        self.dps.get(id.to_string())
    }
}

fn type_name(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_under_dps_key() {
        let response = serde_json::json!({"dps": {"1": true, "2": 42, "4": "manual"}});
        let dps = DpsMap::from_response(&response);
        assert_eq!(dps.get_bool(1).unwrap(), true);
        assert_eq!(dps.get_i64(2).unwrap(), 42);
        assert_eq!(dps.get_str(4).unwrap(), "manual");
    }

    #[test]
    fn falls_back_to_bare_map_when_no_dps_key() {
        let response = serde_json::json!({"1": true});
        let dps = DpsMap::from_response(&response);
        assert_eq!(dps.get_bool(1).unwrap(), true);
    }

    #[test]
    fn missing_field_is_distinguished_from_wrong_type() {
        let response = serde_json::json!({"dps": {"1": "not a bool"}});
        let dps = DpsMap::from_response(&response);
        assert_eq!(dps.get_bool(2), Err(DpsAccessError::Missing));
        assert!(matches!(dps.get_bool(1), Err(DpsAccessError::WrongType { .. })));
    }
}
