//! Typed structures exchanged between the host, the runtime and plugins.
//!
//! Every type here has a serde wire form so hosts can forward them without
//! re-encoding: events and requests carry a `type` field, `ServiceResponse`
//! is tagged by `type`, and `PointValue` is `{"type": .., "value": ..}`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RuntimeError;

/// Error codes carried by `ServiceResponse::Error`.
pub mod codes {
    pub const PLUGIN_ERROR: &str = "PLUGIN_ERROR";
    pub const NOT_IMPLEMENTED: &str = "NOT_IMPLEMENTED";
    pub const NOT_RUNNING: &str = "NOT_RUNNING";
    pub const PLUGIN_NOT_FOUND: &str = "PLUGIN_NOT_FOUND";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const INVALID_RESPONSE: &str = "INVALID_RESPONSE";
}

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a plugin id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    Unregistered,
    Registered,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Unregistered => "Unregistered",
            LifecycleState::Registered => "Registered",
            LifecycleState::Starting => "Starting",
            LifecycleState::Running => "Running",
            LifecycleState::Stopping => "Stopping",
            LifecycleState::Stopped => "Stopped",
        };
        f.write_str(name)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Point values
// ─────────────────────────────────────────────────────────────────────────────

/// A value held by a point in the managed system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum PointValue {
    Null,
    Boolean(bool),
    Real(f64),
    Integer(i64),
    String(String),
    Enum(i32),
    Array(Vec<PointValue>),
}

impl PointValue {
    /// Name of the variant, as used in the wire form.
    pub fn type_name(&self) -> &'static str {
        match self {
            PointValue::Null => "Null",
            PointValue::Boolean(_) => "Boolean",
            PointValue::Real(_) => "Real",
            PointValue::Integer(_) => "Integer",
            PointValue::String(_) => "String",
            PointValue::Enum(_) => "Enum",
            PointValue::Array(_) => "Array",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, PointValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PointValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric view; integers and enums widen to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PointValue::Real(v) => Some(*v),
            PointValue::Integer(v) => Some(*v as f64),
            PointValue::Enum(v) => Some(f64::from(*v)),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PointValue::Integer(v) => Some(*v),
            PointValue::Enum(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PointValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Check the value survives the JSON wire form unchanged.
    ///
    /// JSON has no representation for NaN or infinities, so those reals
    /// (at any depth) are rejected.
    pub fn check_encodable(&self) -> Result<(), RuntimeError> {
        match self {
            PointValue::Real(v) if !v.is_finite() => Err(RuntimeError::Serialization(format!(
                "real value {v} has no wire encoding"
            ))),
            PointValue::Array(items) => items.iter().try_for_each(PointValue::check_encodable),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for PointValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointValue::Null => write!(f, "null"),
            PointValue::Boolean(v) => write!(f, "{v}"),
            PointValue::Real(v) => write!(f, "{v:.2}"),
            PointValue::Integer(v) => write!(f, "{v}"),
            PointValue::String(v) => write!(f, "{v}"),
            PointValue::Enum(v) => write!(f, "enum({v})"),
            PointValue::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl TryFrom<Value> for PointValue {
    type Error = RuntimeError;

    /// Encode arbitrary JSON as a point value.
    ///
    /// Integers that fit `i64` become `Integer`, other numbers `Real`.
    /// Objects are only accepted when they already are a tagged point value.
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Null => Ok(PointValue::Null),
            Value::Bool(b) => Ok(PointValue::Boolean(b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(PointValue::Integer(i))
                } else if n.is_u64() {
                    Err(RuntimeError::Serialization(format!(
                        "integer {n} does not fit a 64-bit signed point value"
                    )))
                } else {
                    n.as_f64()
                        .filter(|v| v.is_finite())
                        .map(PointValue::Real)
                        .ok_or_else(|| {
                            RuntimeError::Serialization(format!("number {n} is not representable"))
                        })
                }
            }
            Value::String(s) => Ok(PointValue::String(s)),
            Value::Array(items) => items
                .into_iter()
                .map(PointValue::try_from)
                .collect::<Result<Vec<_>, _>>()
                .map(PointValue::Array),
            Value::Object(map) => {
                if !map.contains_key("type") {
                    return Err(RuntimeError::Serialization(
                        "objects have no point value encoding".to_string(),
                    ));
                }
                serde_json::from_value(Value::Object(map))
                    .map_err(|e| RuntimeError::Serialization(format!("invalid point value: {e}")))
            }
        }
    }
}

impl From<bool> for PointValue {
    fn from(v: bool) -> Self {
        PointValue::Boolean(v)
    }
}

impl From<f64> for PointValue {
    fn from(v: f64) -> Self {
        PointValue::Real(v)
    }
}

impl From<f32> for PointValue {
    fn from(v: f32) -> Self {
        PointValue::Real(f64::from(v))
    }
}

impl From<i64> for PointValue {
    fn from(v: i64) -> Self {
        PointValue::Integer(v)
    }
}

impl From<i32> for PointValue {
    fn from(v: i32) -> Self {
        PointValue::Integer(i64::from(v))
    }
}

impl From<u32> for PointValue {
    fn from(v: u32) -> Self {
        PointValue::Integer(i64::from(v))
    }
}

impl From<String> for PointValue {
    fn from(v: String) -> Self {
        PointValue::String(v)
    }
}

impl From<&str> for PointValue {
    fn from(v: &str) -> Self {
        PointValue::String(v.to_string())
    }
}

impl<T: Into<PointValue>> From<Vec<T>> for PointValue {
    fn from(items: Vec<T>) -> Self {
        PointValue::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<PointValue>> From<Option<T>> for PointValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(PointValue::Null)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────────────────

/// An event delivered to or published by a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event type identifier (e.g., "PointValueChanged", "Device/Connected")
    #[serde(rename = "type")]
    pub event_type: String,

    /// Plugin or system that generated the event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Event payload
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,

    /// Virtual clock time in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl Event {
    /// Create an event with no source, data or timestamp.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            source: None,
            data: Value::Null,
            timestamp: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Check if this event matches a subscription pattern
    ///
    /// Patterns support:
    /// - Exact match: "PointValueChanged" matches "PointValueChanged"
    /// - Wildcard suffix: "Device/*" matches "Device/Connected", "Device/Disconnected"
    /// - Global wildcard: "*" matches everything
    pub fn matches(&self, pattern: &str) -> bool {
        if pattern == "*" {
            return true;
        }

        if let Some(prefix) = pattern.strip_suffix('*') {
            if prefix.ends_with('/') {
                return self.event_type.starts_with(prefix);
            }
        }

        self.event_type == pattern
    }

    /// Get a field from the event data
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.data.get(key).and_then(|v| v.as_f64())
    }

    /// Deserialize the event data to a specific type
    pub fn parse_data<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Requests and responses
// ─────────────────────────────────────────────────────────────────────────────

/// A request routed to a single plugin's `on_request` handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    #[serde(rename = "type")]
    pub request_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl ServiceRequest {
    pub fn new(request_type: impl Into<String>) -> Self {
        Self {
            request_type: request_type.into(),
            action: None,
            data: Value::Null,
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Deserialize the request data to a specific type
    pub fn parse_data<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}

/// Response returned for every request, including failed ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServiceResponse {
    /// Generic success response
    Ok,

    /// Plugin-defined payload
    Custom {
        #[serde(default)]
        data: Value,
    },

    /// Structured failure
    Error { code: String, message: String },
}

impl ServiceResponse {
    pub fn custom(data: Value) -> Self {
        ServiceResponse::Custom { data }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServiceResponse::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ServiceResponse::Error { .. })
    }

    /// Error code, if this is an error response.
    pub fn error_code(&self) -> Option<&str> {
        match self {
            ServiceResponse::Error { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Validate a loosely-typed JSON value into a response.
    pub fn from_json(value: Value) -> Result<Self, RuntimeError> {
        serde_json::from_value(value)
            .map_err(|e| RuntimeError::Validation(format!("malformed service response: {e}")))
    }
}

impl From<RuntimeError> for ServiceResponse {
    fn from(err: RuntimeError) -> Self {
        match err {
            // The handler's own error text is forwarded verbatim.
            RuntimeError::Handler { message, .. } => {
                ServiceResponse::error(codes::PLUGIN_ERROR, message)
            }
            other => ServiceResponse::error(other.code(), other.to_string()),
        }
    }
}
