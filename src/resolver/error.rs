//! Error types for resolver configuration, resolvers and the service

use std::path::PathBuf;

use crate::io::PipelineError;
use crate::protocol::ProtocolError;

// ============================================================================
// Resolver Errors
// ============================================================================

/// Per-request failure; its message becomes the `ERROR` payload
#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    /// Resolver process could not be started
    #[error("Failed to start resolver: {0}")]
    Start(#[source] PipelineError),

    /// Resolver process failed while streaming
    #[error("{0}")]
    Pipeline(#[source] PipelineError),

    /// Resolver process wrote a malformed line
    #[error("{0}")]
    Protocol(#[from] ProtocolError),
}

// ============================================================================
// Service Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// A resolver for this id is already active
    #[error("Resolution request '{request_id}' is already active")]
    DuplicateRequest { request_id: String },
}

impl ServiceError {
    pub fn duplicate_request(request_id: impl Into<String>) -> Self {
        Self::DuplicateRequest {
            request_id: request_id.into(),
        }
    }
}

// ============================================================================
// Configuration Errors
// ============================================================================

/// Configuration validation and building errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Missing required configuration field
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    /// Invalid resolver command
    #[error("Invalid resolver command: {reason}")]
    InvalidCommand { reason: String },

    /// Invalid line limit
    #[error("Invalid max line bytes: {value} - {reason}")]
    InvalidLineLimit { value: usize, reason: String },

    /// Working directory validation error
    #[error("Working directory validation failed: {working_dir}")]
    WorkingDirectoryValidation {
        working_dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    pub fn invalid_command(reason: impl Into<String>) -> Self {
        Self::InvalidCommand {
            reason: reason.into(),
        }
    }

    pub fn invalid_line_limit(value: usize, reason: impl Into<String>) -> Self {
        Self::InvalidLineLimit {
            value,
            reason: reason.into(),
        }
    }
}
