//! Connection and Host Property Maps
//!
//! Connection properties are read-only inputs supplied by the caller; host
//! property maps are built up by merging per-connector probe results.

use crate::error::{Error, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Merged host description, in insertion order
pub type PropertyMap = IndexMap<String, Value>;

/// Keys whose values are masked before logging (compared lower-cased)
const SECRET_KEYS: &[&str] = &[
    "password",
    "auth_password",
    "admin_password",
    "chappassword",
    "discovery_auth_password",
    "secret",
    "secret_uuid",
    "token",
    "auth_token",
    "passphrase",
    "keyphrase",
    "private_key",
    "encrypted_key",
    "cephxkey",
    "sslkey",
    "fernetkey",
];

const MASK: &str = "***";

// =============================================================================
// Access Mode
// =============================================================================

/// Volume access mode requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    #[serde(rename = "rw")]
    ReadWrite,
    #[serde(rename = "ro")]
    ReadOnly,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::ReadWrite => "rw",
            AccessMode::ReadOnly => "ro",
        }
    }
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Connection Properties
// =============================================================================

/// Protocol-specific description of the volume to attach
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionProperties(IndexMap<String, Value>);

impl ConnectionProperties {
    pub fn new() -> Self {
        Self(IndexMap::new())
    }

    /// Build from a JSON object
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map.into_iter().collect())),
            other => Err(Error::Configuration(format!(
                "connection properties must be a JSON object, got {}",
                other
            ))),
        }
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// A required string value
    pub fn require_str(&self, key: &str) -> Result<&str> {
        match self.0.get(key) {
            Some(Value::String(s)) => Ok(s),
            Some(other) => Err(Error::invalid_property(
                key,
                format!("expected a string, got {}", other),
            )),
            None => Err(Error::invalid_property(key, "missing required key")),
        }
    }

    /// A string or number rendered as a string; `None` when absent or null
    pub fn get_scalar(&self, key: &str) -> Option<String> {
        match self.0.get(key) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn require_scalar(&self, key: &str) -> Result<String> {
        self.get_scalar(key)
            .ok_or_else(|| Error::invalid_property(key, "missing required key"))
    }

    /// An unsigned integer given either as a number or a decimal string
    pub fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .map(Some)
                .ok_or_else(|| Error::invalid_property(key, format!("not an unsigned integer: {}", n))),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| Error::invalid_property(key, format!("not an unsigned integer: {}", s))),
            Some(other) => Err(Error::invalid_property(
                key,
                format!("expected an integer, got {}", other),
            )),
        }
    }

    pub fn require_u64(&self, key: &str) -> Result<u64> {
        self.get_u64(key)?
            .ok_or_else(|| Error::invalid_property(key, "missing required key"))
    }

    /// Boolean flag; absent means false
    pub fn get_bool(&self, key: &str) -> bool {
        match self.0.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => matches!(s.to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
            _ => false,
        }
    }

    /// A string or a list of strings
    pub fn string_list(&self, key: &str) -> Result<Vec<String>> {
        match self.0.get(key) {
            Some(Value::String(s)) => Ok(vec![s.clone()]),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        Error::invalid_property(key, format!("list entry is not a string: {}", item))
                    })
                })
                .collect(),
            Some(other) => Err(Error::invalid_property(
                key,
                format!("expected a string or list, got {}", other),
            )),
            None => Err(Error::invalid_property(key, "missing required key")),
        }
    }

    /// The requested access mode; missing or unknown values are rejected
    pub fn access_mode(&self) -> Result<AccessMode> {
        match self.get_str("access_mode") {
            Some("rw") => Ok(AccessMode::ReadWrite),
            Some("ro") => Ok(AccessMode::ReadOnly),
            Some(other) => Err(Error::invalid_property(
                "access_mode",
                format!("invalid access_mode {} specified in the connection data", other),
            )),
            None => Err(Error::invalid_property(
                "access_mode",
                "no access_mode specified in the connection data",
            )),
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone().into_iter().collect())
    }

    /// Copy suitable for logging
    pub fn masked(&self) -> Value {
        mask_secrets(&self.to_value())
    }
}

impl std::fmt::Debug for ConnectionProperties {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnectionProperties({})", self.masked())
    }
}

/// Connection info as handed over by the volume service
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionInfo {
    pub driver_volume_type: String,
    pub data: ConnectionProperties,
    pub serial: Option<String>,
}

impl ConnectionInfo {
    pub fn new(driver_volume_type: impl Into<String>, data: ConnectionProperties) -> Self {
        Self {
            driver_volume_type: driver_volume_type.into(),
            data,
            serial: None,
        }
    }

    /// True when `data.encrypted` is set
    pub fn is_encrypted(&self) -> bool {
        self.data.get_bool("encrypted")
    }

    pub fn masked(&self) -> Value {
        serde_json::json!({
            "driver_volume_type": self.driver_volume_type,
            "data": self.data.masked(),
            "serial": self.serial,
        })
    }
}

impl std::fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnectionInfo({})", self.masked())
    }
}

// =============================================================================
// Merge / Mask
// =============================================================================

/// Merge `source` into `target`.
///
/// Scalars are last-write-wins, lists are unioned in order, nested objects
/// merge recursively. Keys already in `target` are never dropped.
pub fn merge_properties(target: &mut PropertyMap, source: PropertyMap) {
    for (key, value) in source {
        match target.get_mut(&key) {
            Some(slot) => merge_value(slot, value),
            None => {
                target.insert(key, value);
            }
        }
    }
}

fn merge_value(slot: &mut Value, incoming: Value) {
    match (slot, incoming) {
        (Value::Array(existing), Value::Array(incoming)) => {
            for item in incoming {
                if !existing.contains(&item) {
                    existing.push(item);
                }
            }
        }
        (Value::Object(existing), Value::Object(incoming)) => {
            for (key, value) in incoming {
                match existing.get_mut(&key) {
                    Some(nested) => merge_value(nested, value),
                    None => {
                        existing.insert(key, value);
                    }
                }
            }
        }
        (slot, incoming) => *slot = incoming,
    }
}

/// Replace the values of secret-bearing keys with `***`
pub fn mask_secrets(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| {
                    let lower = key.to_ascii_lowercase();
                    if SECRET_KEYS.contains(&lower.as_str()) || lower.ends_with("password") {
                        (key.clone(), Value::String(MASK.to_string()))
                    } else {
                        (key.clone(), mask_secrets(value))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(mask_secrets).collect()),
        other => other.clone(),
    }
}
