//! I/O layer - Process management, line framing and the process pipeline
//!
//! - **Process**: spawn external programs and expose their stdio as raw byte streams
//! - **Framing**: newline-delimited framing over raw byte streams
//! - **Pipeline**: a started process composed with framing into a line sequence
//!
//! Nothing in this layer knows about the resolver protocol.

pub mod framing;
pub mod pipeline;
pub mod process;

#[cfg(test)]
pub mod testing;

// Re-export main types for convenience
pub use framing::{FramingError, LineFramer};
pub use pipeline::{PipelineError, PipelineEvent, PipelineOptions, ProcessPipeline, StderrPolicy};
pub use process::{ChildProcessRunner, CommandRunner, CommandSpec};
