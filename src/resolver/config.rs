//! Resolver process configuration
//!
//! Every resolution request starts the same external program; the request
//! itself travels through the environment and the `RESOLVE` handshake line.

use std::path::{Path, PathBuf};

use crate::io::framing::DEFAULT_MAX_LINE_BYTES;
use crate::io::{CommandSpec, PipelineOptions, StderrPolicy};
use crate::protocol::ResolutionRequest;
use crate::resolver::error::ConfigError;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Upper bound for the configurable line limit (64 MiB)
pub const MAX_LINE_BYTES_LIMIT: usize = 64 * 1024 * 1024;

/// Environment variable carrying the request id to the resolver process
pub const REQUEST_ID_ENV: &str = "RESOLVER_REQUEST_ID";

/// Environment variable carrying the protocol id to the resolver process
pub const PROTOCOL_ID_ENV: &str = "RESOLVER_PROTOCOL_ID";

// ============================================================================
// Resolver Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Resolver executable
    pub program: String,

    /// Fixed arguments passed on every start
    pub args: Vec<String>,

    /// Working directory for resolver processes (inherited if None)
    pub working_directory: Option<PathBuf>,

    /// Framing and stderr handling
    pub pipeline: PipelineOptions,
}

impl ResolverConfig {
    pub fn builder() -> ResolverConfigBuilder {
        ResolverConfigBuilder::new()
    }

    /// Command that runs the resolver for `request`
    pub fn command_for(&self, request: &ResolutionRequest) -> CommandSpec {
        let mut command = CommandSpec::new(&self.program)
            .args(&self.args)
            .env(REQUEST_ID_ENV, &request.request_id)
            .env(PROTOCOL_ID_ENV, &request.protocol_id);

        if let Some(dir) = &self.working_directory {
            command = command.current_dir(dir);
        }
        command
    }
}

// ============================================================================
// Configuration Builder
// ============================================================================

/// Builder for ResolverConfig with validation and defaults
#[derive(Debug, Default)]
pub struct ResolverConfigBuilder {
    program: Option<String>,
    args: Vec<String>,
    working_directory: Option<PathBuf>,
    max_line_bytes: Option<usize>,
    stderr_policy: Option<StderrPolicy>,
}

impl ResolverConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the resolver executable
    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = Some(program.into());
        self
    }

    /// Add multiple fixed arguments
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(path.into());
        self
    }

    pub fn max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = Some(max_line_bytes);
        self
    }

    pub fn stderr_policy(mut self, policy: StderrPolicy) -> Self {
        self.stderr_policy = Some(policy);
        self
    }

    /// Build the configuration with validation
    pub fn build(self) -> Result<ResolverConfig, ConfigError> {
        let program = self
            .program
            .ok_or_else(|| ConfigError::missing_field("program"))?;
        Self::validate_program(&program)?;

        if let Some(dir) = &self.working_directory {
            Self::validate_working_directory(dir)?;
        }

        let max_line_bytes = self.max_line_bytes.unwrap_or(DEFAULT_MAX_LINE_BYTES);
        Self::validate_max_line_bytes(max_line_bytes)?;

        Ok(ResolverConfig {
            program,
            args: self.args,
            working_directory: self.working_directory,
            pipeline: PipelineOptions {
                max_line_bytes,
                stderr_policy: self.stderr_policy.unwrap_or_default(),
            },
        })
    }

    fn validate_program(program: &str) -> Result<(), ConfigError> {
        if program.trim().is_empty() {
            return Err(ConfigError::invalid_command("program must not be empty"));
        }
        Ok(())
    }

    /// Validate working directory exists and is a directory
    fn validate_working_directory(path: &Path) -> Result<(), ConfigError> {
        if !path.exists() {
            return Err(ConfigError::WorkingDirectoryValidation {
                working_dir: path.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Working directory does not exist",
                ),
            });
        }

        if !path.is_dir() {
            return Err(ConfigError::WorkingDirectoryValidation {
                working_dir: path.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "Working directory path is not a directory",
                ),
            });
        }

        Ok(())
    }

    fn validate_max_line_bytes(value: usize) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(ConfigError::invalid_line_limit(value, "must be greater than zero"));
        }
        if value > MAX_LINE_BYTES_LIMIT {
            return Err(ConfigError::invalid_line_limit(
                value,
                format!("must not exceed {MAX_LINE_BYTES_LIMIT}"),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
