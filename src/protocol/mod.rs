//! Resolver protocol layer
//!
//! - **Codec**: `TYPE PAYLOAD_JSON` wire lines exchanged with the resolver process
//! - **Events**: control events from the caller and service events back to it

pub mod codec;
pub mod events;

pub use codec::{MessageType, ProtocolError, ProtocolMessage, decode, encode};
pub use events::{ControlEvent, ResolutionRequest, Response, ServiceEvent};
