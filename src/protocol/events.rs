//! Caller-facing event catalog
//!
//! Inbound control events (`RESOLVE`, `ABORT`, `RESPONSE`) and outbound
//! service events (`QUERY`, `END`, `ERROR`). Outbound events are multiplexed
//! over one bus using the channel id `TYPE/requestId`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::protocol::codec::{MessageType, ProtocolMessage};

// ============================================================================
// Caller Decisions
// ============================================================================

/// Adjudication of a candidate match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Match,
    Reject,
}

impl Decision {
    pub fn message_type(self) -> MessageType {
        match self {
            Self::Match => MessageType::Match,
            Self::Reject => MessageType::Reject,
        }
    }
}

/// Caller feedback for a running resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "type")]
    pub decision: Decision,

    #[serde(default)]
    pub payload: Value,
}

impl Response {
    pub fn new(decision: Decision, payload: Value) -> Self {
        Self { decision, payload }
    }

    /// Wire message written to the resolver process
    pub fn into_message(self) -> ProtocolMessage {
        ProtocolMessage::new(self.decision.message_type(), self.payload)
    }
}

// ============================================================================
// Inbound Control Events
// ============================================================================

/// One resolution request as supplied by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionRequest {
    /// Caller-supplied id, unique while active
    pub request_id: String,

    /// Dataset/configuration selector passed through to the process
    pub protocol_id: String,

    /// Opaque options passed through to the process
    #[serde(default)]
    pub options: Map<String, Value>,
}

impl ResolutionRequest {
    #[cfg(test)]
    pub fn new(request_id: impl Into<String>, protocol_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            protocol_id: protocol_id.into(),
            options: Map::new(),
        }
    }

    #[cfg(test)]
    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Handshake message written to the process once it is running
    pub fn handshake(&self) -> ProtocolMessage {
        ProtocolMessage::new(
            MessageType::Resolve,
            json!({
                "requestId": self.request_id,
                "protocolId": self.protocol_id,
                "options": self.options,
            }),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortRequest {
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RespondRequest {
    pub request_id: String,

    #[serde(rename = "type")]
    pub decision: Decision,

    #[serde(default)]
    pub payload: Value,
}

impl RespondRequest {
    pub fn response(&self) -> Response {
        Response::new(self.decision, self.payload.clone())
    }
}

/// Control event sent by the caller to the service
///
/// On the bus: `{"type": "RESOLVE", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlEvent {
    Resolve(ResolutionRequest),
    Abort(AbortRequest),
    Response(RespondRequest),
}

impl ControlEvent {
    pub fn request_id(&self) -> &str {
        match self {
            Self::Resolve(request) => &request.request_id,
            Self::Abort(request) => &request.request_id,
            Self::Response(request) => &request.request_id,
        }
    }
}

// ============================================================================
// Outbound Service Events
// ============================================================================

/// Event emitted by the service towards the caller of one request
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceEvent {
    /// Candidate match needing adjudication
    Query { request_id: String, payload: Value },
    /// Natural completion
    End { request_id: String },
    /// Terminal failure
    Error { request_id: String, error: String },
}

impl ServiceEvent {
    pub fn query(request_id: impl Into<String>, payload: Value) -> Self {
        Self::Query {
            request_id: request_id.into(),
            payload,
        }
    }

    pub fn end(request_id: impl Into<String>) -> Self {
        Self::End {
            request_id: request_id.into(),
        }
    }

    pub fn error(request_id: impl Into<String>, error: impl ToString) -> Self {
        Self::Error {
            request_id: request_id.into(),
            error: error.to_string(),
        }
    }

    pub fn kind(&self) -> MessageType {
        match self {
            Self::Query { .. } => MessageType::Query,
            Self::End { .. } => MessageType::End,
            Self::Error { .. } => MessageType::Error,
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            Self::Query { request_id, .. }
            | Self::End { request_id }
            | Self::Error { request_id, .. } => request_id,
        }
    }

    /// Whether this event ends the request
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End { .. } | Self::Error { .. })
    }

    /// Multiplexing channel id, `TYPE/requestId`
    pub fn channel(&self) -> String {
        format!("{}/{}", self.kind(), self.request_id())
    }

    pub fn payload(&self) -> Value {
        match self {
            Self::Query { payload, .. } => payload.clone(),
            Self::End { .. } => Value::Null,
            Self::Error { error, .. } => json!({ "error": error }),
        }
    }

    pub fn to_frame(&self) -> BusFrame {
        BusFrame {
            channel: self.channel(),
            payload: self.payload(),
        }
    }
}

/// Outbound bus record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusFrame {
    pub channel: String,
    pub payload: Value,
}

// ============================================================================
// Tests
// ============================================================================
