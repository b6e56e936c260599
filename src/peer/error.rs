use crate::transfer::InfoHash;
use thiserror::Error;

/// Errors that can occur on a peer connection.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The handshake header did not announce the BitTorrent protocol.
    #[error("bad protocol header")]
    BadProtocol,

    /// The 60-second handshake window expired.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// An accepted peer asked for a torrent we are not serving.
    #[error("no transfer registered for info hash {0}")]
    UnknownInfoHash(InfoHash),

    /// The dialed peer answered with a different torrent than we asked for.
    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// The remote peer ID equals our own.
    #[error("connected to ourselves")]
    SelfConnection,

    /// Frame contents inconsistent with the message type or the
    /// connection phase.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The declared frame length exceeds the safety cap.
    #[error("frame of {0} bytes exceeds safety cap")]
    FrameTooLarge(usize),

    /// Bitfield length mismatch or trailing pad bit set.
    #[error("invalid bitfield: {0}")]
    InvalidBitfield(String),

    /// A piece index at or beyond the transfer's piece count.
    #[error("piece index {0} out of range")]
    PieceOutOfRange(u32),

    /// A piece frame with a misaligned offset or wrong block length.
    #[error("bad block: piece {index}, offset {begin}, length {length}")]
    BadBlock { index: u32, begin: u32, length: usize },

    /// Message ID outside the base protocol. Logged and drained, never
    /// fatal.
    #[error("unknown message id: {0}")]
    UnknownMessageId(u8),

    /// A block request was issued before interest was latched and an
    /// unchoke observed.
    #[error("request issued before interest and unchoke")]
    RequestNotReady,

    /// The connection was closed by the peer or shut down locally.
    #[error("connection closed")]
    ConnectionClosed,

    /// The inactivity or write deadline expired.
    #[error("timeout")]
    Timeout,
}
