//! Accept and dial drivers.
//!
//! The engine owns the process-wide pieces of the wire protocol: the
//! local peer ID (generated once, immutable), the transfer registry the
//! accept path consults, the exported counters, and the set of live
//! connections.

use crate::constants::{BLOCK_SIZE, FRAME_LENGTH_MARGIN, HANDSHAKE_TIMEOUT};
use crate::metrics::Metrics;
use crate::peer::{
    handshake, Bitfield, FrameReader, FrameWriter, Handshake, HandshakeEvent, PeerConn, PeerError,
    PeerId,
};
use crate::transfer::{Transfer, TransferRegistry};
use dashmap::DashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

/// The peer wire-protocol engine.
pub struct Engine {
    local_id: PeerId,
    transfers: TransferRegistry,
    conns: DashMap<SocketAddr, Arc<PeerConn>>,
    metrics: Arc<Metrics>,
}

impl Engine {
    pub fn new() -> Self {
        Self::with_peer_id(PeerId::generate())
    }

    /// Builds an engine with a fixed local peer ID.
    pub fn with_peer_id(local_id: PeerId) -> Self {
        Self {
            local_id,
            transfers: TransferRegistry::new(),
            conns: DashMap::new(),
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn transfers(&self) -> &TransferRegistry {
        &self.transfers
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Returns the live connection to `addr`, if any. The piece selector
    /// uses this to issue requests.
    pub fn connection(&self, addr: &SocketAddr) -> Option<Arc<PeerConn>> {
        self.conns.get(addr).map(|entry| entry.value().clone())
    }

    /// Returns all live connections.
    pub fn connections(&self) -> Vec<Arc<PeerConn>> {
        self.conns
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Signals every live connection to terminate. Each `serve_incoming`
    /// / `connect_and_serve` call returns once its connection has wound
    /// down.
    pub fn shutdown(&self) {
        info!(connections = self.conns.len(), "shutting down peer connections");
        for entry in self.conns.iter() {
            entry.close();
        }
    }

    /// Serves a connection accepted by the listener, blocking until it
    /// ends.
    ///
    /// Runs the streaming handshake under the 60-second deadline: as soon
    /// as the info hash is in, the transfer is looked up and our own
    /// handshake goes out, before the remote has finished writing its
    /// peer ID. Unknown info hashes are dropped without a response.
    pub async fn serve_incoming(&self, socket: TcpStream) -> Result<(), PeerError> {
        let addr = socket.peer_addr()?;
        debug!(peer = %addr, "serving incoming connection");
        self.metrics.inc_peers_accepted();

        let (transfer, remote_id, read_half, write_half) =
            match self.accept_handshake(socket).await {
                Ok(parts) => parts,
                Err(e) => {
                    self.metrics.inc_handshake_failures();
                    debug!(peer = %addr, error = %e, "accept handshake failed");
                    return Err(e);
                }
            };

        debug!(peer = %addr, remote = %remote_id, "handshake completed");
        self.serve(transfer, remote_id, addr, read_half, write_half)
            .await
    }

    /// Dials a peer for a transfer and serves the connection, blocking
    /// until it ends. IPv4 only.
    pub async fn connect_and_serve(
        &self,
        addr: SocketAddrV4,
        transfer: Arc<Transfer>,
    ) -> Result<(), PeerError> {
        debug!(peer = %addr, "connecting to peer");
        self.metrics.inc_peers_dialed();

        let socket = TcpStream::connect(addr).await?;
        let result = timeout(HANDSHAKE_TIMEOUT, self.dial_handshake(socket, &transfer))
            .await
            .map_err(|_| PeerError::HandshakeTimeout)
            .and_then(|r| r);
        let (remote_id, read_half, write_half) = match result {
            Ok(parts) => parts,
            Err(e) => {
                self.metrics.inc_handshake_failures();
                debug!(peer = %addr, error = %e, "dial handshake failed");
                return Err(e);
            }
        };

        debug!(peer = %addr, remote = %remote_id, "handshake completed");
        self.serve(
            transfer,
            remote_id,
            SocketAddr::V4(addr),
            read_half,
            write_half,
        )
        .await
    }

    async fn accept_handshake(
        &self,
        socket: TcpStream,
    ) -> Result<(Arc<Transfer>, PeerId, OwnedReadHalf, OwnedWriteHalf), PeerError> {
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        let (read_half, write_half) = socket.into_split();
        let (events_tx, events_rx) = mpsc::channel(2);
        let mut reader = Some(tokio::spawn(handshake::read_streaming(
            read_half, events_tx,
        )));

        let result = self
            .drive_accept(deadline, events_rx, write_half, &mut reader)
            .await;

        // The streaming reader is reclaimed on success; reap it on any
        // failure so nothing outlives the handshake.
        if let Some(task) = reader.take() {
            task.abort();
            let _ = task.await;
        }
        result
    }

    async fn drive_accept(
        &self,
        deadline: Instant,
        mut events: mpsc::Receiver<HandshakeEvent>,
        mut write_half: OwnedWriteHalf,
        reader: &mut Option<JoinHandle<OwnedReadHalf>>,
    ) -> Result<(Arc<Transfer>, PeerId, OwnedReadHalf, OwnedWriteHalf), PeerError> {
        // Answer as soon as the info hash is known.
        let transfer = match next_event(deadline, &mut events).await? {
            HandshakeEvent::InfoHash(info_hash) => {
                let Some(transfer) = self.transfers.lookup(&info_hash) else {
                    warn!(%info_hash, "rejecting connection for unknown info hash");
                    return Err(PeerError::UnknownInfoHash(info_hash));
                };
                transfer
            }
            HandshakeEvent::Failed(e) => return Err(e),
            HandshakeEvent::PeerId(_) => return Err(PeerError::ConnectionClosed),
        };

        let ours = Handshake::new(transfer.info_hash(), self.local_id);
        timeout_at(deadline, handshake::send(&mut write_half, &ours))
            .await
            .map_err(|_| PeerError::HandshakeTimeout)??;

        let remote_id = match next_event(deadline, &mut events).await? {
            HandshakeEvent::PeerId(peer_id) => peer_id,
            HandshakeEvent::Failed(e) => return Err(e),
            HandshakeEvent::InfoHash(_) => return Err(PeerError::ConnectionClosed),
        };

        // Both events are in, so the reader task is already returning.
        let read_half = match reader.take() {
            Some(task) => task.await.map_err(|_| PeerError::ConnectionClosed)?,
            None => return Err(PeerError::ConnectionClosed),
        };

        if remote_id == self.local_id {
            debug!("rejected own connection: server side");
            return Err(PeerError::SelfConnection);
        }

        Ok((transfer, remote_id, read_half, write_half))
    }

    async fn dial_handshake(
        &self,
        socket: TcpStream,
        transfer: &Transfer,
    ) -> Result<(PeerId, OwnedReadHalf, OwnedWriteHalf), PeerError> {
        let (mut read_half, mut write_half) = socket.into_split();

        // We write first; the remote answers once it has our info hash.
        let ours = Handshake::new(transfer.info_hash(), self.local_id);
        handshake::send(&mut write_half, &ours).await?;

        let theirs = handshake::read(&mut read_half).await?;
        if theirs.info_hash != transfer.info_hash() {
            return Err(PeerError::InfoHashMismatch);
        }
        if theirs.peer_id == self.local_id {
            debug!("rejected own connection: client side");
            return Err(PeerError::SelfConnection);
        }

        Ok((theirs.peer_id, read_half, write_half))
    }

    async fn serve(
        &self,
        transfer: Arc<Transfer>,
        remote_id: PeerId,
        addr: SocketAddr,
        read_half: OwnedReadHalf,
        write_half: OwnedWriteHalf,
    ) -> Result<(), PeerError> {
        let max_frame_len = frame_cap(transfer.piece_count());
        let reader = FrameReader::new(read_half, max_frame_len);
        let writer = FrameWriter::new(write_half);

        let conn = PeerConn::new(addr, remote_id, transfer, writer, self.metrics.clone());
        self.conns.insert(addr, conn.clone());
        self.metrics.on_peer_connected();

        let result = conn.run(reader).await;

        self.conns.remove(&addr);
        self.metrics.on_peer_disconnected();
        result
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

// The largest legitimate frame is either a full piece frame or the
// transfer's bitfield frame, whichever is bigger.
fn frame_cap(piece_count: u32) -> usize {
    let piece_frame = 9 + BLOCK_SIZE as usize;
    let bitfield_frame = 1 + Bitfield::byte_len_for(piece_count);
    piece_frame.max(bitfield_frame) + FRAME_LENGTH_MARGIN
}

async fn next_event(
    deadline: Instant,
    events: &mut mpsc::Receiver<HandshakeEvent>,
) -> Result<HandshakeEvent, PeerError> {
    match timeout_at(deadline, events.recv()).await {
        Ok(Some(event)) => Ok(event),
        Ok(None) => Err(PeerError::ConnectionClosed),
        Err(_) => Err(PeerError::HandshakeTimeout),
    }
}
