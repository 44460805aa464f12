//! Resolution requests
//!
//! - **Config**: which external program resolves requests and how its output is framed
//! - **Instance**: one request's state machine, running as its own task
//! - **Service**: the multiplexing front door keyed by request id
//! - **Sink**: where service events for one request are delivered

pub mod config;
pub mod error;
pub mod instance;
pub mod service;
pub mod sink;

pub use config::ResolverConfig;
pub use service::ResolverService;
pub use sink::EventSink;
