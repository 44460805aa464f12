mod bus;
mod io;
mod logging;
mod protocol;
mod resolver;

#[cfg(test)]
mod test_utils;

use clap::Parser;
use logging::{LogConfig, init_logging};
use resolver::{ResolverConfig, ResolverService};

use io::StderrPolicy;
use std::path::PathBuf;
use tokio::io::{stdin, stdout};
use tracing::{info, warn};

/// Environment variable naming the resolver executable
const RESOLVER_COMMAND_ENV: &str = "RESOLVER_COMMAND";

/// CLI arguments for the resolver bridge
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Resolver executable started for every request (overrides RESOLVER_COMMAND env var)
    #[arg(long, value_name = "PATH")]
    resolver_command: Option<String>,

    /// Argument passed to the resolver executable (repeatable)
    #[arg(long = "resolver-arg", value_name = "ARG", allow_hyphen_values = true)]
    resolver_args: Vec<String>,

    /// Working directory for resolver processes (defaults to the current directory)
    #[arg(long, value_name = "DIR")]
    working_dir: Option<PathBuf>,

    /// Maximum accepted line length on resolver output
    #[arg(long, value_name = "BYTES")]
    max_line_bytes: Option<usize>,

    /// Handling of resolver stderr output: "fatal" or "log"
    #[arg(long, value_name = "POLICY", default_value_t = StderrPolicy::Fatal)]
    stderr_policy: StderrPolicy,

    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file path (overrides RESOLVER_LOG_FILE env var)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,
}

/// Resolve the resolver executable from CLI args and environment
fn resolve_resolver_command(command_arg: Option<String>) -> Option<String> {
    // Priority: CLI arg > RESOLVER_COMMAND env var
    command_arg.or_else(|| std::env::var(RESOLVER_COMMAND_ENV).ok())
}

fn build_config(args: &Args) -> Result<ResolverConfig, Box<dyn std::error::Error>> {
    let program = resolve_resolver_command(args.resolver_command.clone()).ok_or_else(|| {
        format!("no resolver command given (use --resolver-command or {RESOLVER_COMMAND_ENV})")
    })?;

    let mut builder = ResolverConfig::builder()
        .program(program)
        .args(args.resolver_args.iter().cloned())
        .stderr_policy(args.stderr_policy);

    if let Some(dir) = &args.working_dir {
        builder = builder.working_directory(dir);
    }
    if let Some(max_line_bytes) = args.max_line_bytes {
        builder = builder.max_line_bytes(max_line_bytes);
    }

    Ok(builder.build()?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging with configuration from env vars and CLI args
    let log_config = LogConfig::from_env().with_overrides(args.log_level.clone(), args.log_file.clone());

    if let Err(e) = init_logging(log_config) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid resolver configuration: {e}");
            std::process::exit(2);
        }
    };

    info!(
        "Resolver bridge ready: '{} {}' (stderr policy: {})",
        config.program,
        config.args.join(" "),
        config.pipeline.stderr_policy
    );

    let service = ResolverService::new(config);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    bus::serve(service, stdin(), stdout(), shutdown).await?;
    info!("Resolver bridge shutdown");

    Ok(())
}
