//! Signaling Channel: ordered delivery of offer/answer/candidate messages to
//! the paired peer through the relay.

pub mod channel;
pub mod message;
pub mod transport;

pub use channel::{ChannelState, OnCloseHdlrFn, OnMessageHdlrFn, SignalingChannel};
pub use message::SignalingMessage;
pub use transport::{SignalLink, SignalTransport, WebSocketTransport};
