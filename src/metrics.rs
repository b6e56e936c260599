//! Counters exported by the engine.
//!
//! The core exports counters only; scraping, aggregation, and shipping
//! belong to the embedding application.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters shared by the engine, its connections, and the piece
/// assemblers.
#[derive(Debug, Default)]
pub struct Metrics {
    peers_connected: AtomicU64,
    peers_accepted: AtomicU64,
    peers_dialed: AtomicU64,
    handshake_failures: AtomicU64,
    protocol_violations: AtomicU64,
    unknown_messages: AtomicU64,
    blocks_received: AtomicU64,
    bytes_downloaded: AtomicU64,
    haves_received: AtomicU64,
    pieces_verified: AtomicU64,
    hash_failures: AtomicU64,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub peers_connected: u64,
    pub peers_accepted: u64,
    pub peers_dialed: u64,
    pub handshake_failures: u64,
    pub protocol_violations: u64,
    pub unknown_messages: u64,
    pub blocks_received: u64,
    pub bytes_downloaded: u64,
    pub haves_received: u64,
    pub pieces_verified: u64,
    pub hash_failures: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_peer_connected(&self) {
        self.peers_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_peer_disconnected(&self) {
        self.peers_connected.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_peers_accepted(&self) {
        self.peers_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_peers_dialed(&self) {
        self.peers_dialed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_handshake_failures(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_protocol_violations(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_unknown_messages(&self) {
        self.unknown_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_block_received(&self, bytes: usize) {
        self.blocks_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_downloaded
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn inc_haves_received(&self) {
        self.haves_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_pieces_verified(&self) {
        self.pieces_verified.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_hash_failures(&self) {
        self.hash_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            peers_connected: self.peers_connected.load(Ordering::Relaxed),
            peers_accepted: self.peers_accepted.load(Ordering::Relaxed),
            peers_dialed: self.peers_dialed.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            unknown_messages: self.unknown_messages.load(Ordering::Relaxed),
            blocks_received: self.blocks_received.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            haves_received: self.haves_received.load(Ordering::Relaxed),
            pieces_verified: self.pieces_verified.load(Ordering::Relaxed),
            hash_failures: self.hash_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.on_peer_connected();
        metrics.on_peer_connected();
        metrics.on_peer_disconnected();
        metrics.on_block_received(16384);
        metrics.on_block_received(1024);
        metrics.inc_hash_failures();

        let snap = metrics.snapshot();
        assert_eq!(snap.peers_connected, 1);
        assert_eq!(snap.blocks_received, 2);
        assert_eq!(snap.bytes_downloaded, 17408);
        assert_eq!(snap.hash_failures, 1);
        assert_eq!(snap.pieces_verified, 0);
    }
}
