//! Test utilities and global setup
//!
//! Provides centralized test logging configuration and resolver test helpers.

use std::time::Duration;
use tokio::sync::mpsc;

use crate::protocol::ServiceEvent;
use crate::resolver::ResolverConfig;

/// Upper bound for any single wait in tests
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Test logging utilities
#[cfg(all(test, feature = "test-logging"))]
pub mod logging {
    use std::sync::Once;
    use tracing_subscriber::{EnvFilter, fmt};

    static INIT: Once = Once::new();

    /// Initialize test logging globally - safe to call multiple times
    ///
    /// Respects `RUST_LOG`, defaulting to debug for this crate.
    ///
    /// ```bash
    /// RUST_LOG=resolver_bridge=trace cargo test --features test-logging
    /// ```
    pub fn init() {
        INIT.call_once(|| {
            let env_filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("debug,tokio=info"));

            fmt()
                .with_env_filter(env_filter)
                .with_test_writer()
                .with_target(true)
                .with_thread_ids(true)
                .compact()
                .try_init()
                .ok();
        });
    }
}

/// Resolver configuration running `script` through `sh -c`
pub fn shell_config(script: &str) -> ResolverConfig {
    ResolverConfig::builder()
        .program("sh")
        .args(["-c", script])
        .build()
        .unwrap()
}

/// Next service event, failing the test if none arrives in time
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<ServiceEvent>) -> ServiceEvent {
    tokio::time::timeout(TEST_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for service event")
        .expect("event channel closed")
}

/// Assert that no further event arrives before every sender is gone
pub async fn wait_closed(rx: &mut mpsc::UnboundedReceiver<ServiceEvent>) {
    let next = tokio::time::timeout(TEST_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for event channel to close");
    assert!(next.is_none(), "unexpected event {next:?}");
}
