//! Handshake exchange, blocking and streaming forms.
//!
//! The dial side writes first and then reads the full 68 bytes in one go.
//! The accept side cannot wait that long: it needs the info hash to look
//! up the transfer and answer before the remote has finished writing its
//! peer ID, so the streaming reader emits two events as the bytes arrive.

use super::error::PeerError;
use super::message::Handshake;
use super::peer_id::PeerId;
use crate::constants::{HANDSHAKE_LEN, HANDSHAKE_PREFIX_LEN, PROTOCOL_STRING};
use crate::transfer::InfoHash;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Events emitted by the streaming handshake reader, in arrival order.
#[derive(Debug)]
pub enum HandshakeEvent {
    /// The first 48 bytes arrived: header validated, info hash extracted.
    InfoHash(InfoHash),
    /// The final 20 bytes arrived.
    PeerId(PeerId),
    /// Reading or validation failed.
    Failed(PeerError),
}

/// Writes our handshake.
pub async fn send<W>(writer: &mut W, handshake: &Handshake) -> Result<(), PeerError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&handshake.encode()).await?;
    Ok(())
}

/// Blocking form, used on the dial side: reads and validates all 68 bytes.
pub async fn read<R>(reader: &mut R) -> Result<Handshake, PeerError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HANDSHAKE_LEN];
    read_exact(reader, &mut buf).await?;
    Handshake::decode(&buf)
}

/// Streaming form, used on the accept side.
///
/// Emits [`HandshakeEvent::InfoHash`] as soon as the 48-byte prefix is in,
/// then [`HandshakeEvent::PeerId`], then returns the reader so the caller
/// can reclaim it through the task's join handle. Any failure is reported
/// as a final [`HandshakeEvent::Failed`].
pub async fn read_streaming<R>(mut reader: R, events: mpsc::Sender<HandshakeEvent>) -> R
where
    R: AsyncRead + Unpin,
{
    match read_prefix(&mut reader).await {
        Ok(info_hash) => {
            let _ = events.send(HandshakeEvent::InfoHash(info_hash)).await;
        }
        Err(e) => {
            let _ = events.send(HandshakeEvent::Failed(e)).await;
            return reader;
        }
    }

    match read_peer_id(&mut reader).await {
        Ok(peer_id) => {
            let _ = events.send(HandshakeEvent::PeerId(peer_id)).await;
        }
        Err(e) => {
            let _ = events.send(HandshakeEvent::Failed(e)).await;
        }
    }

    reader
}

async fn read_prefix<R>(reader: &mut R) -> Result<InfoHash, PeerError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HANDSHAKE_PREFIX_LEN];
    read_exact(reader, &mut buf).await?;
    if buf[0] as usize != PROTOCOL_STRING.len() || &buf[1..20] != PROTOCOL_STRING {
        return Err(PeerError::BadProtocol);
    }
    // Reserved bytes 20..28 are ignored.
    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&buf[28..48]);
    Ok(InfoHash::from_bytes(info_hash))
}

async fn read_peer_id<R>(reader: &mut R) -> Result<PeerId, PeerError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 20];
    read_exact(reader, &mut buf).await?;
    Ok(PeerId::from_bytes(buf))
}

async fn read_exact<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), PeerError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(PeerError::ConnectionClosed)
        }
        Err(e) => Err(PeerError::Io(e)),
    }
}
