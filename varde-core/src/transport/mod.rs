//! TCP transport: framing, outbound writers, inbound listener.

pub mod codec;
pub mod message;
pub mod peer;
pub mod server;

pub use message::{Envelope, Payload};
pub use peer::PeerConnector;
