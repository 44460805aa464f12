//! Logging setup for the resolver bridge
//!
//! Logs go to stderr or a file, never stdout: stdout carries the control bus.

use std::env;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable naming the log file
pub const LOG_FILE_ENV: &str = "RESOLVER_LOG_FILE";

/// Set to "true" to suffix the log file name with the process ID
pub const LOG_UNIQUE_ENV: &str = "RESOLVER_LOG_UNIQUE";

/// Set to "true" for JSON log records
pub const LOG_JSON_ENV: &str = "RESOLVER_LOG_JSON";

/// Configuration for the logging system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Log level filter (e.g., "debug", "info", "resolver_bridge=trace")
    pub level: String,
    /// Optional log file path. If None, logs only to stderr
    pub file_path: Option<PathBuf>,
    /// Whether to use structured JSON format for logs
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            json_format: false,
        }
    }
}

impl LogConfig {
    /// Create LogConfig from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let is_true = |key: &str| lookup(key).is_some_and(|value| value == "true");

        let level = lookup("RUST_LOG").unwrap_or_else(|| "info".to_string());
        let file_path = lookup(LOG_FILE_ENV).map(|path| {
            let path = PathBuf::from(path);
            if is_true(LOG_UNIQUE_ENV) {
                unique_log_path(&path, std::process::id())
            } else {
                path
            }
        });

        Self {
            level,
            file_path,
            json_format: is_true(LOG_JSON_ENV),
        }
    }

    /// Override values from CLI arguments
    pub fn with_overrides(mut self, level: Option<String>, file_path: Option<PathBuf>) -> Self {
        if let Some(level) = level {
            self.level = level;
        }
        if let Some(file_path) = file_path {
            self.file_path = Some(file_path);
        }
        self
    }
}

/// `resolver.log` -> `resolver.<pid>.log`
fn unique_log_path(path: &Path, pid: u32) -> PathBuf {
    let Some(stem) = path.file_stem() else {
        return path.to_path_buf();
    };

    let unique_name = match path.extension().and_then(|ext| ext.to_str()) {
        Some(extension) if !extension.is_empty() => {
            format!("{}.{}.{}", stem.to_string_lossy(), pid, extension)
        }
        _ => format!("{}.{}", stem.to_string_lossy(), pid),
    };
    path.with_file_name(unique_name)
}

/// Initialize the logging system based on configuration
pub fn init_logging(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_new(&config.level).or_else(|_| EnvFilter::try_new("info"))?;

    let (writer, ansi) = match &config.file_path {
        Some(file_path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;
            (BoxMakeWriter::new(file), false)
        }
        None => (BoxMakeWriter::new(io::stderr), true),
    };

    let subscriber = tracing_subscriber::registry().with(env_filter);

    if config.json_format {
        subscriber
            .with(fmt::layer().json().with_writer(writer).with_ansi(false))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true),
            )
            .init();
    }

    Ok(())
}

/// Log one resolver wire message in a single structured line
#[macro_export]
macro_rules! log_protocol_message {
    ($level:expr, $direction:expr, $request_id:expr, $message:expr) => {
        tracing::event!(
            $level,
            direction = $direction,
            request_id = %$request_id,
            kind = %$message.kind,
            payload = %$message.payload,
            pid = std::process::id(),
            "Resolver message"
        );
    };
}

/// Helper function to log performance timing
#[macro_export]
macro_rules! log_timing {
    ($level:expr, $operation:expr, $duration:expr) => {
        tracing::event!(
            $level,
            operation = $operation,
            duration_ms = $duration.as_millis(),
            pid = std::process::id(),
            "Performance timing"
        );
    };
}
