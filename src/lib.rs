//! runnel - a BitTorrent peer wire-protocol engine
//!
//! This library implements the peer side of the BitTorrent protocol: it
//! establishes TCP connections (accepting and dialing), performs the
//! 68-byte handshake, then runs the long-lived message exchange that
//! drives piece acquisition for an in-progress transfer.
//!
//! # Modules
//!
//! - [`peer`] - Handshake, message framing, per-peer state machine, and
//!   the connection read loop
//! - [`transfer`] - Transfers, pieces, block assembly, SHA-1
//!   verification, and the info-hash registry
//! - [`engine`] - Accept/dial drivers and process-wide state
//! - [`metrics`] - Exported counters
//! - [`constants`] - Protocol constants and tuning parameters
//!
//! Torrent metadata loading, tracker announces, and piece selection are
//! collaborators: the metadata loader builds [`transfer::Transfer`]s,
//! and a selector consumes each piece's advertisement channel to decide
//! which connection to ask for which block.

pub mod constants;
pub mod engine;
pub mod metrics;
pub mod peer;
pub mod transfer;

pub use engine::Engine;
pub use metrics::{Metrics, MetricsSnapshot};
pub use peer::{
    Bitfield, ChokingState, FrameReader, FrameWriter, Handshake, HandshakeEvent, Message,
    MessageId, PeerConn, PeerError, PeerId, UnchokeHandle,
};
pub use transfer::{
    BlockDelivery, InfoHash, Piece, PieceAssembler, Transfer, TransferError, TransferRegistry,
    WriteTarget,
};
