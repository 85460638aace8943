//! # courier-core
//!
//! Shared vocabulary for the courier workspace: branded identifiers, the
//! error taxonomy, and the transport traits a mailbox worker delivers through.

pub mod errors;
pub mod ids;
pub mod memory;
pub mod transport;

pub use errors::{TransportError, WorkerError};
pub use ids::{ConnectionId, WorkerId};
pub use transport::{MessageSink, MessageSource, Received};
