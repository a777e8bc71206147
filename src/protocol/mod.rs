//! Wire-level data model.
//!
//! Every logical message on a channel is one JSON envelope:
//!
//! ```text
//! {"MessageType": <int>, "Data": <string>}
//! ```
//!
//! Message types:
//! - `0`: Text (free-form string payload)
//! - `1`: ClientMethodInvocation (`Data` is an encoded [`InvocationDescriptor`])
//! - `2`: ConnectionEvent (`Data` is the newly assigned connection id)
//! - `3`: InvocationResult (`Data` is an encoded [`InvocationResultDescriptor`])
//!
//! Field names and numeric values must match across client and server.

pub mod arguments;
pub mod invocation;

use serde::{Deserialize, Serialize};

pub use arguments::{FromArguments, IntoArguments};
pub use invocation::{InvocationDescriptor, InvocationResultDescriptor};

/// Errors raised while encoding or decoding wire data.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The payload is not valid JSON (or not UTF-8).
    #[error("malformed JSON: {0}")]
    MalformedJson(#[source] serde_json::Error),

    /// Valid JSON that does not describe a known envelope.
    #[error("not a recognized envelope: {0}")]
    InvalidEnvelope(String),

    /// Envelope carries a message type outside the known set.
    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    /// Positional argument count does not match the target signature.
    #[error("expected {expected} argument(s), got {actual}")]
    ArgumentCount {
        /// Declared parameter count.
        expected: usize,
        /// Supplied argument count.
        actual: usize,
    },

    /// An argument could not be decoded into its declared parameter type.
    #[error("argument {index} is not a valid {expected}: {source}")]
    ArgumentType {
        /// Zero-based argument position.
        index: usize,
        /// Declared Rust type name.
        expected: &'static str,
        /// Underlying decode error.
        #[source]
        source: serde_json::Error,
    },

    /// A value could not be serialized.
    #[error("serialization failed: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Kind of a wire message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MessageType {
    /// Free-form text.
    Text,
    /// Method invocation (either direction).
    ClientMethodInvocation,
    /// Server-assigned connection id, sent once on connect.
    ConnectionEvent,
    /// Result of a correlated invocation.
    InvocationResult,
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Text => 0,
            MessageType::ClientMethodInvocation => 1,
            MessageType::ConnectionEvent => 2,
            MessageType::InvocationResult => 3,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Text),
            1 => Ok(Self::ClientMethodInvocation),
            2 => Ok(Self::ConnectionEvent),
            3 => Ok(Self::InvocationResult),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// A single wire message.
///
/// Immutable once constructed; build a new one per send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Message {
    message_type: MessageType,
    #[serde(default)]
    data: String,
}

impl Message {
    /// Create a message from its parts.
    pub fn new(message_type: MessageType, data: impl Into<String>) -> Self {
        Self {
            message_type,
            data: data.into(),
        }
    }

    /// Create a text message.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(MessageType::Text, text)
    }

    /// Create the connection event announcing `connection_id`.
    pub fn connection_event(connection_id: impl Into<String>) -> Self {
        Self::new(MessageType::ConnectionEvent, connection_id)
    }

    /// Wrap an invocation request.
    pub fn invocation(descriptor: &InvocationDescriptor) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            MessageType::ClientMethodInvocation,
            descriptor.to_json()?,
        ))
    }

    /// Wrap an invocation result.
    pub fn invocation_result(
        descriptor: &InvocationResultDescriptor,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::InvocationResult, descriptor.to_json()?))
    }

    /// Message kind.
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Raw `Data` payload.
    pub fn data(&self) -> &str {
        &self.data
    }

    /// Consume the message, returning its payload.
    pub fn into_data(self) -> String {
        self.data
    }

    /// Encode into envelope bytes.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(ProtocolError::Encode)
    }

    /// Decode envelope bytes.
    ///
    /// Syntax errors are reported as [`ProtocolError::MalformedJson`]; well-formed
    /// JSON with the wrong shape as [`ProtocolError::InvalidEnvelope`].
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(ProtocolError::MalformedJson)?;
        if let Some(raw) = value.get("MessageType").and_then(serde_json::Value::as_u64) {
            if let Ok(raw) = u8::try_from(raw) {
                MessageType::try_from(raw)?;
            }
        }
        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidEnvelope(e.to_string()))
    }
}
