//! Publish-only STOMP 1.2 transport.

pub mod codec;
pub mod connection;
pub mod frame;
pub(crate) mod parser;

pub use codec::{MAX_FRAME_SIZE, StompCodec, StompItem};
pub use connection::{StompConnection, StompDialer, StompSession, negotiate_heartbeats, parse_heartbeat_header};
pub use frame::Frame;
