use thiserror::Error;

/// Errors raised by the piece layer.
#[derive(Debug, Error)]
pub enum TransferError {
    /// A file-target write failed. Fatal to the owning transfer.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Not a 20-byte hash.
    #[error("invalid info hash")]
    InvalidInfoHash,

    /// A piece index at or beyond the transfer's piece count.
    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(u32),

    /// A delivery with a misaligned offset, out-of-range block, or wrong
    /// block length.
    #[error("bad block: piece {piece}, offset {offset}, length {length}")]
    BadBlock {
        piece: u32,
        offset: u32,
        length: usize,
    },

    /// The assembled piece did not hash to the expected digest.
    /// Recoverable; the piece is reset and re-requested from other peers.
    #[error("piece hash mismatch for piece {0}")]
    HashMismatch(u32),

    /// No transfer registered under the given info hash.
    #[error("transfer not registered: {0}")]
    TransferNotFound(String),
}
