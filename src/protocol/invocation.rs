//! Invocation request and result descriptors.
//!
//! Both travel as JSON text inside a [`Message`](super::Message)'s `Data` field.
//! Arguments and results stay as raw JSON values here; typed decoding happens
//! once the target method (or the pending call) is known.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ProtocolError;

/// A method invocation request.
///
/// `id` is the correlation token. It is unset for fire-and-forget
/// notifications, which never produce a result message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InvocationDescriptor {
    /// Correlation token (unique per originating endpoint).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Target method name.
    pub method_name: String,
    /// Positional arguments, not yet typed.
    #[serde(default)]
    pub arguments: Vec<Value>,
}

impl InvocationDescriptor {
    /// Build a correlated request.
    pub fn call(id: impl Into<String>, method_name: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            id: Some(id.into()),
            method_name: method_name.into(),
            arguments,
        }
    }

    /// Build a fire-and-forget notification.
    pub fn notification(method_name: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            id: None,
            method_name: method_name.into(),
            arguments,
        }
    }

    /// Parse the `Data` of an invocation message.
    ///
    /// Returns `Err` when the text is not JSON at all, and `Ok(None)` when it is
    /// JSON but not an invocation envelope (for example a missing `MethodName`).
    pub fn parse(data: &str) -> Result<Option<Self>, ProtocolError> {
        let value: Value = serde_json::from_str(data).map_err(ProtocolError::MalformedJson)?;
        Ok(serde_json::from_value(value).ok())
    }

    /// Best-effort extraction of the correlation id from arbitrary JSON text.
    ///
    /// Used to answer requests whose envelope is otherwise unusable.
    pub fn peek_id(data: &str) -> Option<String> {
        let value: Value = serde_json::from_str(data).ok()?;
        match value.get("Id")? {
            Value::String(id) => Some(id.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Encode as JSON text.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

/// The outcome of a correlated invocation.
///
/// Exactly one of `result` / `error` is meaningful: when `error` is set the
/// result is ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InvocationResultDescriptor {
    /// Correlation token copied from the request.
    pub id: String,
    /// Return value (JSON `null` for unit results).
    #[serde(default)]
    pub result: Value,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InvocationResultDescriptor {
    /// Successful result.
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            result,
            error: None,
        }
    }

    /// Failed result.
    pub fn failure(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: Value::Null,
            error: Some(error.into()),
        }
    }

    /// Parse the `Data` of a result message.
    pub fn parse(data: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(data).map_err(ProtocolError::MalformedJson)?;
        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidEnvelope(e.to_string()))
    }

    /// Encode as JSON text.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Collapse into `Ok(result)` or `Err(error)`.
    pub fn into_outcome(self) -> Result<Value, String> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result),
        }
    }
}
