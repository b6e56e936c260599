//! Transfers, pieces, and their inbound channels.
//!
//! A `Transfer` is the engine's view of one in-progress torrent: piece
//! geometry plus the per-piece fan-in channels that connections publish
//! into. Pieces never hold references back to connections; "peer P
//! advertises piece i" travels as a message on the piece's have channel.

use super::error::TransferError;
use super::info_hash::InfoHash;
use crate::constants::{BLOCK_SIZE, HAVE_CHANNEL_CAPACITY};
use crate::peer::{PeerConn, PeerId};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io::SeekFrom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex as TokioMutex};

/// Computes the number of blocks in a piece.
pub fn block_count(piece_length: u32) -> u32 {
    piece_length.div_ceil(BLOCK_SIZE)
}

/// Computes the length of block `block_index` within a piece. All blocks
/// are 16 KiB except the final one, which may be shorter.
pub fn block_length(piece_length: u32, block_index: u32) -> u32 {
    let offset = block_index as u64 * BLOCK_SIZE as u64;
    let remaining = (piece_length as u64).saturating_sub(offset);
    remaining.min(BLOCK_SIZE as u64) as u32
}

/// A block of piece data delivered by a remote peer.
#[derive(Debug, Clone)]
pub struct BlockDelivery {
    /// The piece index.
    pub index: u32,
    /// Byte offset within the piece; always block-aligned.
    pub begin: u32,
    /// The block data.
    pub data: Bytes,
    /// Which peer delivered it, for hash-failure accounting.
    pub from: PeerId,
}

/// One destination range for a verified piece. A piece may span files, so
/// it carries an ordered list of these.
pub struct WriteTarget {
    file: Arc<TokioMutex<File>>,
    /// Absolute byte offset within the file.
    pub offset: u64,
    /// Number of bytes of the piece that land here.
    pub length: u64,
}

impl WriteTarget {
    pub fn new(file: Arc<TokioMutex<File>>, offset: u64, length: u64) -> Self {
        Self {
            file,
            offset,
            length,
        }
    }

    /// Writes `data` at the target's offset. Returns the number of bytes
    /// written.
    pub async fn write_at(&self, data: &[u8]) -> Result<usize, TransferError> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(self.offset)).await?;
        file.write_all(data).await?;
        Ok(data.len())
    }
}

/// One piece of a transfer: verification metadata, write targets, and the
/// two inbound channels connections publish into.
pub struct Piece {
    /// The piece index.
    pub index: u32,
    /// Expected SHA-1 of the complete piece.
    pub expected_hash: [u8; 20],
    /// Piece length in bytes; the last piece of a transfer may be short.
    pub length: u32,
    /// Destination ranges, in piece order.
    pub targets: Vec<WriteTarget>,
    // Senders are parked here so close() can drop them; the channel then
    // closes once every connection's clone is gone.
    have_tx: Mutex<Option<mpsc::Sender<Arc<PeerConn>>>>,
    have_rx: Mutex<Option<mpsc::Receiver<Arc<PeerConn>>>>,
    block_tx: Mutex<Option<mpsc::Sender<BlockDelivery>>>,
    block_rx: Mutex<Option<mpsc::Receiver<BlockDelivery>>>,
    verified: AtomicBool,
    banned: Mutex<HashSet<PeerId>>,
}

impl Piece {
    pub fn new(index: u32, expected_hash: [u8; 20], length: u32, targets: Vec<WriteTarget>) -> Self {
        let (have_tx, have_rx) = mpsc::channel(HAVE_CHANNEL_CAPACITY);
        let (block_tx, block_rx) = mpsc::channel(block_count(length).max(1) as usize);
        Self {
            index,
            expected_hash,
            length,
            targets,
            have_tx: Mutex::new(Some(have_tx)),
            have_rx: Mutex::new(Some(have_rx)),
            block_tx: Mutex::new(Some(block_tx)),
            block_rx: Mutex::new(Some(block_rx)),
            verified: AtomicBool::new(false),
            banned: Mutex::new(HashSet::new()),
        }
    }

    pub fn block_count(&self) -> u32 {
        block_count(self.length)
    }

    pub fn block_length(&self, block_index: u32) -> u32 {
        block_length(self.length, block_index)
    }

    /// Sender half of the advertisement channel, for connections. `None`
    /// once the piece has been closed.
    pub fn have_sender(&self) -> Option<mpsc::Sender<Arc<PeerConn>>> {
        self.have_tx.lock().clone()
    }

    /// Sender half of the block channel, for connections. `None` once the
    /// piece has been closed.
    pub fn block_sender(&self) -> Option<mpsc::Sender<BlockDelivery>> {
        self.block_tx.lock().clone()
    }

    /// Takes the advertisement receiver. The piece selector consumes it;
    /// only the first caller gets it.
    pub fn take_have_receiver(&self) -> Option<mpsc::Receiver<Arc<PeerConn>>> {
        self.have_rx.lock().take()
    }

    /// Takes the block receiver. The assembler consumes it; only the
    /// first caller gets it.
    pub fn take_block_receiver(&self) -> Option<mpsc::Receiver<BlockDelivery>> {
        self.block_rx.lock().take()
    }

    /// True once the piece has been verified and written. A verified
    /// piece is never re-requested; late deliveries are dropped.
    pub fn is_verified(&self) -> bool {
        self.verified.load(Ordering::Acquire)
    }

    pub(crate) fn mark_verified(&self) {
        self.verified.store(true, Ordering::Release);
        self.close();
    }

    /// Stops accepting new publishers. In-flight sender clones held by
    /// connections drain naturally; once they drop, the receivers see the
    /// channel close. Called on verification and on transfer teardown.
    pub fn close(&self) {
        self.have_tx.lock().take();
        self.block_tx.lock().take();
    }

    /// Bans a peer from this piece after it contributed to a failed hash.
    pub fn ban_peer(&self, peer: PeerId) {
        self.banned.lock().insert(peer);
    }

    /// True if the peer contributed to an earlier failed attempt at this
    /// piece. The selector must not route its deliveries here again.
    pub fn is_banned(&self, peer: &PeerId) -> bool {
        self.banned.lock().contains(peer)
    }
}

/// One in-progress torrent as the wire engine sees it.
pub struct Transfer {
    info_hash: InfoHash,
    piece_length: u32,
    total_length: u64,
    pieces: Vec<Arc<Piece>>,
}

impl Transfer {
    /// Builds a transfer from metadata-loader output. `pieces` must be
    /// indexed `0..ceil(total_length / piece_length)` in order.
    pub fn new(
        info_hash: InfoHash,
        piece_length: u32,
        total_length: u64,
        pieces: Vec<Piece>,
    ) -> Arc<Self> {
        debug_assert_eq!(
            pieces.len() as u64,
            total_length.div_ceil(piece_length as u64)
        );
        Arc::new(Self {
            info_hash,
            piece_length,
            total_length,
            pieces: pieces.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn piece_count(&self) -> u32 {
        self.pieces.len() as u32
    }

    pub fn piece(&self, index: u32) -> Option<&Arc<Piece>> {
        self.pieces.get(index as usize)
    }

    pub fn pieces(&self) -> &[Arc<Piece>] {
        &self.pieces
    }

    /// Tears the transfer down: every piece stops accepting publishers,
    /// so assemblers and selectors wind down once live connections drop
    /// their channel handles.
    pub fn close(&self) {
        for piece in &self.pieces {
            piece.close();
        }
    }

    /// Returns the length of a piece; only the last one may be short.
    pub fn piece_size(&self, index: u32) -> u32 {
        if (index as usize) < self.pieces.len().saturating_sub(1) {
            self.piece_length
        } else {
            let remainder = self.total_length % self.piece_length as u64;
            if remainder == 0 {
                self.piece_length
            } else {
                remainder as u32
            }
        }
    }
}
