//! Resolver wire protocol codec
//!
//! One message per line, `TYPE PAYLOAD_JSON`. The type token runs up to the
//! first space; everything after it is the JSON payload.

use serde_json::Value;
use std::fmt;

// ============================================================================
// Message Types
// ============================================================================

/// Message type token
///
/// Process-side vocabulary is `RESOLVE`, `MATCH`, `MAYBE`, `REJECT`, `LOG`;
/// caller-side vocabulary adds `ABORT`, `END`, `ERROR`, `QUERY`, `RESPONSE`.
/// Tokens outside both sets decode to [`MessageType::Unknown`] so newer
/// resolver programs keep working.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    Resolve,
    Match,
    Maybe,
    Reject,
    Log,
    Abort,
    End,
    Error,
    Query,
    Response,
    Unknown(String),
}

impl MessageType {
    /// Parse a type token (case sensitive)
    pub fn parse(token: &str) -> Self {
        match token {
            "RESOLVE" => Self::Resolve,
            "MATCH" => Self::Match,
            "MAYBE" => Self::Maybe,
            "REJECT" => Self::Reject,
            "LOG" => Self::Log,
            "ABORT" => Self::Abort,
            "END" => Self::End,
            "ERROR" => Self::Error,
            "QUERY" => Self::Query,
            "RESPONSE" => Self::Response,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Wire token
    pub fn as_str(&self) -> &str {
        match self {
            Self::Resolve => "RESOLVE",
            Self::Match => "MATCH",
            Self::Maybe => "MAYBE",
            Self::Reject => "REJECT",
            Self::Log => "LOG",
            Self::Abort => "ABORT",
            Self::End => "END",
            Self::Error => "ERROR",
            Self::Query => "QUERY",
            Self::Response => "RESPONSE",
            Self::Unknown(token) => token,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded protocol message
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolMessage {
    /// Message type
    pub kind: MessageType,

    /// Arbitrary structured payload (`null` when the line carried none)
    pub payload: Value,
}

impl ProtocolMessage {
    pub fn new(kind: MessageType, payload: Value) -> Self {
        Self { kind, payload }
    }
}

// ============================================================================
// Protocol Errors
// ============================================================================

/// Error types for the wire protocol
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed {kind} payload: {source}")]
    Decode {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Empty protocol line")]
    EmptyLine,

    #[error("Cannot encode {kind} message: {reason}")]
    Encode { kind: String, reason: String },
}

// ============================================================================
// Decode / Encode
// ============================================================================

/// Decode one protocol line (terminator already stripped)
///
/// A line without a space decodes with a `null` payload. Unknown type tokens
/// are accepted; an invalid JSON payload is an error.
pub fn decode(line: &str) -> Result<ProtocolMessage, ProtocolError> {
    if line.trim().is_empty() {
        return Err(ProtocolError::EmptyLine);
    }

    let (token, payload) = match line.split_once(' ') {
        Some((token, payload)) => (token, Some(payload)),
        None => (line, None),
    };

    let kind = MessageType::parse(token);
    let payload = match payload {
        Some(text) => serde_json::from_str(text).map_err(|source| ProtocolError::Decode {
            kind: kind.to_string(),
            source,
        })?,
        None => Value::Null,
    };

    Ok(ProtocolMessage { kind, payload })
}

/// Encode a message as exactly one line (no terminator)
///
/// Fails rather than produce output that would break line framing.
pub fn encode(message: &ProtocolMessage) -> Result<String, ProtocolError> {
    let token = message.kind.as_str();
    if token.is_empty() || token.chars().any(char::is_whitespace) {
        return Err(ProtocolError::Encode {
            kind: token.to_string(),
            reason: "type token must be a single non-empty word".to_string(),
        });
    }

    let payload = serde_json::to_string(&message.payload).map_err(|e| ProtocolError::Encode {
        kind: token.to_string(),
        reason: e.to_string(),
    })?;

    if payload.contains('\n') {
        return Err(ProtocolError::Encode {
            kind: token.to_string(),
            reason: "serialized payload spans multiple lines".to_string(),
        });
    }

    Ok(format!("{token} {payload}"))
}

// ============================================================================
// Tests
// ============================================================================
