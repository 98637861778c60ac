//! L4: message envelope and dispatch (§3.4, §4.6).

pub mod correlation;
pub mod envelope;
pub mod protocol;
pub mod registry;

pub use envelope::P2PMessage;
pub use protocol::ProtocolCode;
pub use registry::{Handler, HandlerRegistry};
