//! Per-piece block assembly, verification, and persistence.

use super::error::TransferError;
use super::piece::{BlockDelivery, Piece};
use crate::constants::BLOCK_SIZE;
use crate::metrics::Metrics;
use crate::peer::PeerId;
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Assembles one piece from block deliveries fanned in from any number of
/// peer connections.
///
/// Deliveries land in a scratch buffer at their offset; when every block
/// is present the buffer is hashed. A mismatch resets the attempt and
/// bans the contributing peers from this piece; a match writes the buffer
/// to every target in declared order and latches the piece verified.
pub struct PieceAssembler {
    piece: Arc<Piece>,
    buf: Vec<u8>,
    received: Vec<bool>,
    received_count: u32,
    contributors: HashSet<PeerId>,
    metrics: Arc<Metrics>,
}

impl PieceAssembler {
    pub fn new(piece: Arc<Piece>, metrics: Arc<Metrics>) -> Self {
        let blocks = piece.block_count() as usize;
        Self {
            buf: vec![0; piece.length as usize],
            received: vec![false; blocks],
            received_count: 0,
            contributors: HashSet::new(),
            piece,
            metrics,
        }
    }

    /// Accepts one delivery into the scratch buffer.
    ///
    /// Returns `true` once the piece is complete. Duplicate deliveries
    /// overwrite silently; misaligned, out-of-range, or wrong-length
    /// blocks are rejected.
    pub fn accept(&mut self, delivery: BlockDelivery) -> Result<bool, TransferError> {
        if delivery.index != self.piece.index {
            return Err(TransferError::InvalidPieceIndex(delivery.index));
        }
        let bad_block = || TransferError::BadBlock {
            piece: delivery.index,
            offset: delivery.begin,
            length: delivery.data.len(),
        };
        if delivery.begin % BLOCK_SIZE != 0 {
            return Err(bad_block());
        }
        let block = delivery.begin / BLOCK_SIZE;
        if block >= self.piece.block_count() {
            return Err(bad_block());
        }
        if delivery.data.len() != self.piece.block_length(block) as usize {
            return Err(bad_block());
        }

        let begin = delivery.begin as usize;
        self.buf[begin..begin + delivery.data.len()].copy_from_slice(&delivery.data);
        if !self.received[block as usize] {
            self.received[block as usize] = true;
            self.received_count += 1;
        }
        self.contributors.insert(delivery.from);

        Ok(self.is_complete())
    }

    pub fn is_complete(&self) -> bool {
        self.received_count == self.piece.block_count()
    }

    /// Hashes the scratch buffer and compares against the expected digest.
    pub fn verify(&self) -> bool {
        let digest: [u8; 20] = Sha1::digest(&self.buf).into();
        digest == self.piece.expected_hash
    }

    /// Writes the verified buffer to every target in declared order and
    /// latches the piece verified. Any write failure is fatal to the
    /// transfer.
    pub async fn commit(&self) -> Result<(), TransferError> {
        let mut written = 0usize;
        for target in &self.piece.targets {
            let end = written + target.length as usize;
            target.write_at(&self.buf[written..end]).await?;
            written = end;
        }
        self.piece.mark_verified();
        self.metrics.inc_pieces_verified();
        Ok(())
    }

    /// Discards the current attempt. Returns the peers that contributed
    /// to it so they can be banned from this piece.
    pub fn reset(&mut self) -> HashSet<PeerId> {
        self.received.fill(false);
        self.received_count = 0;
        std::mem::take(&mut self.contributors)
    }

    /// Drives the piece to verification, consuming its block channel.
    ///
    /// Hash mismatches are recovered in place: the attempt resets, the
    /// contributing peers are banned for this piece, and assembly
    /// continues with whatever other peers deliver. Returns once the
    /// piece is verified and written, or when every sender is gone.
    pub async fn run(mut self) -> Result<(), TransferError> {
        let Some(mut block_rx) = self.piece.take_block_receiver() else {
            debug!(piece = self.piece.index, "block receiver already taken");
            return Ok(());
        };

        while let Some(delivery) = block_rx.recv().await {
            let from = delivery.from;
            let complete = match self.accept(delivery) {
                Ok(complete) => complete,
                Err(e) => {
                    warn!(piece = self.piece.index, peer = %from, error = %e, "dropping bad block");
                    self.piece.ban_peer(from);
                    continue;
                }
            };
            if !complete {
                continue;
            }

            if self.verify() {
                self.commit().await?;
                debug!(piece = self.piece.index, "piece verified and written");
                return Ok(());
            }

            self.metrics.inc_hash_failures();
            let contributors = self.reset();
            warn!(
                piece = self.piece.index,
                peers = contributors.len(),
                "piece hash mismatch, discarding and re-requesting"
            );
            for peer in contributors {
                self.piece.ban_peer(peer);
            }
        }

        debug!(piece = self.piece.index, "all block senders gone");
        Ok(())
    }
}
