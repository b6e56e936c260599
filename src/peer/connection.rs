use super::bitfield::Bitfield;
use super::error::PeerError;
use super::message::Message;
use super::peer_id::PeerId;
use super::state::{ChokingState, PeerState, UnchokeHandle};
use super::transport::{FrameReader, FrameWriter};
use crate::constants::BLOCK_SIZE;
use crate::metrics::Metrics;
use crate::transfer::{BlockDelivery, Piece, Transfer};
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

/// One live peer connection, created after a successful handshake.
///
/// The read loop owns all mutation of the remote bitfield and the
/// remote-driven flags; external tasks interact through
/// [`be_interested`](Self::be_interested), [`request`](Self::request),
/// and snapshots.
pub struct PeerConn {
    addr: SocketAddr,
    remote_id: PeerId,
    transfer: Arc<Transfer>,
    state: PeerState,
    bitfield: Mutex<Bitfield>,
    writer: TokioMutex<FrameWriter<OwnedWriteHalf>>,
    shutdown: Notify,
    metrics: Arc<Metrics>,
    // Handle to ourselves for have publication; the channel message IS
    // the back-reference, the piece stores nothing.
    this: Weak<PeerConn>,
}

impl PeerConn {
    pub(crate) fn new(
        addr: SocketAddr,
        remote_id: PeerId,
        transfer: Arc<Transfer>,
        writer: FrameWriter<OwnedWriteHalf>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let piece_count = transfer.piece_count();
        Arc::new_cyclic(|this| Self {
            addr,
            remote_id,
            transfer,
            state: PeerState::new(),
            bitfield: Mutex::new(Bitfield::new(piece_count)),
            writer: TokioMutex::new(writer),
            shutdown: Notify::new(),
            metrics,
            this: this.clone(),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn remote_id(&self) -> PeerId {
        self.remote_id
    }

    pub fn transfer(&self) -> &Arc<Transfer> {
        &self.transfer
    }

    /// Returns a copy of the four connection flags.
    pub fn flags(&self) -> ChokingState {
        self.state.flags()
    }

    /// Returns a copy of the remote bitfield for the piece selector.
    pub fn remote_bitfield_snapshot(&self) -> Bitfield {
        self.bitfield.lock().clone()
    }

    /// Tells the peer we want its data and returns a handle for the next
    /// unchoke.
    ///
    /// The `interested` frame is transmitted at most once per connection
    /// no matter how many callers land here; if the peer is already not
    /// choking us the returned handle is released immediately. There is
    /// no way to take interest back on this connection.
    pub async fn be_interested(&self) -> Result<UnchokeHandle, PeerError> {
        let (first, handle) = self.state.latch_interest();
        if first {
            self.send(Message::Interested).await?;
        }
        Ok(handle)
    }

    /// Requests a block from the peer.
    ///
    /// Refused until interest has been latched and at least one unchoke
    /// has been observed on this connection.
    pub async fn request(&self, index: u32, begin: u32, length: u32) -> Result<(), PeerError> {
        if !self.state.may_request() {
            return Err(PeerError::RequestNotReady);
        }
        self.send(Message::Request {
            index,
            begin,
            length,
        })
        .await
    }

    /// Requests block `block_index` of piece `index`, deriving offset and
    /// length from the piece geometry.
    pub async fn request_block(&self, index: u32, block_index: u32) -> Result<(), PeerError> {
        let piece = self
            .transfer
            .piece(index)
            .ok_or(PeerError::PieceOutOfRange(index))?;
        if block_index >= piece.block_count() {
            return Err(PeerError::BadBlock {
                index,
                begin: block_index * BLOCK_SIZE,
                length: 0,
            });
        }
        self.request(
            index,
            block_index * BLOCK_SIZE,
            piece.block_length(block_index),
        )
        .await
    }

    /// External shutdown signal: wakes the read loop, which closes the
    /// socket and releases everyone waiting on the unchoke signal.
    pub fn close(&self) {
        self.state.close();
        self.shutdown.notify_one();
    }

    async fn send(&self, message: Message) -> Result<(), PeerError> {
        if self.state.is_closed() {
            return Err(PeerError::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;
        writer.send(&message).await
    }

    /// Drives the connection until it terminates, returning the terminal
    /// reason. A clean remote close is `Ok(())`.
    pub(crate) async fn run(
        self: Arc<Self>,
        mut reader: FrameReader<OwnedReadHalf>,
    ) -> Result<(), PeerError> {
        let result = tokio::select! {
            res = self.read_loop(&mut reader) => res,
            _ = self.shutdown.notified() => Err(PeerError::ConnectionClosed),
        };

        self.state.close();
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }

        match &result {
            Ok(()) => debug!(peer = %self.addr, "connection closed by remote"),
            Err(e) => {
                if matches!(
                    e,
                    PeerError::ProtocolViolation(_)
                        | PeerError::InvalidBitfield(_)
                        | PeerError::PieceOutOfRange(_)
                        | PeerError::BadBlock { .. }
                        | PeerError::FrameTooLarge(_)
                ) {
                    self.metrics.inc_protocol_violations();
                    warn!(peer = %self.addr, error = %e, "dropping abusive peer");
                } else {
                    debug!(peer = %self.addr, error = %e, "connection terminated");
                }
            }
        }
        result
    }

    async fn read_loop(
        &self,
        reader: &mut FrameReader<OwnedReadHalf>,
    ) -> Result<(), PeerError> {
        let mut first = true;
        loop {
            let message = match reader.read_frame().await {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(()),
                Err(PeerError::UnknownMessageId(id)) => {
                    trace!(peer = %self.addr, id, "ignoring unknown message");
                    self.metrics.inc_unknown_messages();
                    first = false;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match message {
                Message::KeepAlive => {
                    // Only resets the inactivity deadline.
                    trace!(peer = %self.addr, "keep-alive");
                }
                Message::Choke => self.state.on_choke(),
                Message::Unchoke => self.state.on_unchoke(),
                Message::Interested => self.state.on_interested(true),
                Message::NotInterested => self.state.on_interested(false),
                Message::Have { piece } => self.on_have(piece).await?,
                Message::Bitfield(bits) => {
                    if !first {
                        return Err(PeerError::ProtocolViolation(
                            "bitfield only legal as the first message".into(),
                        ));
                    }
                    self.on_bitfield(bits).await?;
                }
                Message::Request { index, begin, length } => {
                    // Accepted but not served until upload is implemented.
                    trace!(peer = %self.addr, index, begin, length, "ignoring request");
                }
                Message::Piece { index, begin, data } => {
                    self.on_piece(index, begin, data).await?;
                }
                Message::Cancel { .. } | Message::Port(_) => {}
            }

            first = false;
        }
    }

    async fn on_have(&self, index: u32) -> Result<(), PeerError> {
        let piece = self
            .transfer
            .piece(index)
            .ok_or_else(|| PeerError::ProtocolViolation(format!("have for piece {}", index)))?
            .clone();

        self.bitfield.lock().set(index)?;
        self.metrics.inc_haves_received();
        trace!(peer = %self.addr, index, "peer has piece");

        self.publish_have(&piece).await;
        Ok(())
    }

    async fn on_bitfield(&self, bits: Bytes) -> Result<(), PeerError> {
        let piece_count = self.transfer.piece_count();
        let bitfield = Bitfield::from_bytes(&bits, piece_count)?;
        debug!(peer = %self.addr, bitfield = %bitfield.hex(), "received bitfield");

        let advertised: Vec<u32> = (0..piece_count)
            .filter(|&i| bitfield.test(i).unwrap_or(false))
            .collect();
        *self.bitfield.lock() = bitfield;

        for index in advertised {
            if let Some(piece) = self.transfer.piece(index) {
                let piece = piece.clone();
                self.publish_have(&piece).await;
            }
        }
        Ok(())
    }

    async fn on_piece(&self, index: u32, begin: u32, data: Bytes) -> Result<(), PeerError> {
        let bad_block = |length: usize| PeerError::BadBlock {
            index,
            begin,
            length,
        };

        let piece = self
            .transfer
            .piece(index)
            .ok_or_else(|| bad_block(data.len()))?
            .clone();
        if begin % BLOCK_SIZE != 0 {
            return Err(bad_block(data.len()));
        }
        let block = begin / BLOCK_SIZE;
        if block >= piece.block_count() || data.len() != piece.block_length(block) as usize {
            return Err(bad_block(data.len()));
        }

        self.metrics.on_block_received(data.len());

        if piece.is_verified() {
            // A verified piece is never re-requested; drop stragglers.
            trace!(peer = %self.addr, index, begin, "late block for verified piece");
            return Ok(());
        }

        let delivery = BlockDelivery {
            index,
            begin,
            data,
            from: self.remote_id,
        };
        let Some(sender) = piece.block_sender() else {
            trace!(peer = %self.addr, index, "block channel closed");
            return Ok(());
        };
        match sender.try_send(delivery) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(delivery)) => {
                // Bounded backpressure; the assembler is draining.
                if sender.send(delivery).await.is_err() {
                    trace!(peer = %self.addr, index, "block channel closed");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!(peer = %self.addr, index, "block channel closed");
            }
        }
        Ok(())
    }

    // Publication must not stall the read loop behind an absent consumer:
    // try first, then fall back to the bounded await; a closed channel
    // means nobody cares about this piece anymore.
    async fn publish_have(&self, piece: &Arc<Piece>) {
        let Some(conn) = self.this.upgrade() else {
            return;
        };
        let Some(sender) = piece.have_sender() else {
            trace!(peer = %self.addr, index = piece.index, "have channel closed");
            return;
        };
        match sender.try_send(conn) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(conn)) => {
                if sender.send(conn).await.is_err() {
                    trace!(peer = %self.addr, index = piece.index, "have channel closed");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!(peer = %self.addr, index = piece.index, "have channel closed");
            }
        }
    }
}

impl std::fmt::Debug for PeerConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConn")
            .field("addr", &self.addr)
            .field("remote_id", &self.remote_id)
            .field("info_hash", &self.transfer.info_hash())
            .finish()
    }
}
