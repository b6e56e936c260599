//! Protocol constants and tuning parameters.
//!
//! Timeouts follow the values the wire protocol was tuned against; the
//! frame cap and channel capacities bound what an untrusted peer can make
//! us buffer.

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Client ID prefix for peer ID generation (Azureus-style).
pub const CLIENT_PREFIX: &[u8; 8] = b"-RN0001-";

// ============================================================================
// Protocol constants
// ============================================================================

/// BitTorrent protocol identifier sent in every handshake.
pub const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Length of the fixed handshake message in bytes.
pub const HANDSHAKE_LEN: usize = 68;

/// Offset of the peer ID within the handshake; everything before it can
/// be validated without waiting for the final 20 bytes.
pub const HANDSHAKE_PREFIX_LEN: usize = 48;

/// Standard block size (16 KiB). All current implementations use this and
/// close connections that request more.
pub const BLOCK_SIZE: u32 = 16384;

// ============================================================================
// Timeouts
// ============================================================================

/// Window for completing the full handshake exchange, either direction.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Post-handshake inactivity limit. Any frame, keep-alive included,
/// resets it.
pub const READ_TIMEOUT: Duration = Duration::from_secs(180);

/// Per-frame write timeout.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Buffers and channels
// ============================================================================

/// Slack added on top of the largest legitimate frame when computing the
/// per-connection frame cap.
pub const FRAME_LENGTH_MARGIN: usize = 1024;

/// Initial capacity of the per-connection read buffer.
pub const READ_BUFFER_SIZE: usize = 32 * 1024;

/// Capacity of each piece's advertisement channel.
pub const HAVE_CHANNEL_CAPACITY: usize = 256;

/// Recommended number of outstanding block requests per peer. Advisory;
/// the selector owns pipelining policy.
pub const REQUEST_PIPELINE_DEPTH: usize = 5;
