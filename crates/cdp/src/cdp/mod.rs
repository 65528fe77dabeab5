//! CDP (Chrome DevTools Protocol) wire layer
//!
//! Core principle: Single transport, multiplexed sessions.
//! Inbound traffic is handled on one task, in order, without suspending.

pub mod connection;
pub mod protocol;
pub mod session;
pub mod transport;

pub use connection::{CDPConnection, ConnectionEvent};
pub use protocol::{CDPEvent, CDPRequest, CDPResponse, ProtocolEvent, SessionId, TargetId, TargetInfo};
pub use session::{CDPSession, SessionEvent};
pub use transport::{Inbound, Transport, WebSocketTransport};
