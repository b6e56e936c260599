//! Peer wire protocol (BEP-3)
//!
//! This module implements the base peer wire protocol: handshake,
//! length-prefixed message framing, the per-connection state machine,
//! and the read loop that routes block deliveries and piece
//! advertisements into the transfer layer.

mod bitfield;
mod connection;
mod error;
pub mod handshake;
mod message;
mod peer_id;
mod state;
mod transport;

pub use bitfield::Bitfield;
pub use connection::PeerConn;
pub use error::PeerError;
pub use handshake::HandshakeEvent;
pub use message::{Handshake, Message, MessageId};
pub use peer_id::PeerId;
pub use state::{ChokingState, PeerState, UnchokeHandle};
pub use transport::{FrameReader, FrameWriter};

#[cfg(test)]
mod tests;
