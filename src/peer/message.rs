use super::error::PeerError;
use super::peer_id::PeerId;
use crate::constants::{HANDSHAKE_LEN, PROTOCOL_STRING};
use crate::transfer::InfoHash;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Message type identifiers in the peer wire protocol.
///
/// Each message (except keep-alive) has a one-byte ID following the
/// length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    /// Stop sending data to the peer.
    Choke = 0,
    /// Ready to send data to the peer.
    Unchoke = 1,
    /// Want data from the peer.
    Interested = 2,
    /// Don't want data from the peer.
    NotInterested = 3,
    /// Announce a newly-acquired piece.
    Have = 4,
    /// Announce all available pieces.
    Bitfield = 5,
    /// Request a data block.
    Request = 6,
    /// Send piece data.
    Piece = 7,
    /// Cancel a pending request.
    Cancel = 8,
    /// DHT port announcement.
    Port = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            _ => Err(PeerError::UnknownMessageId(value)),
        }
    }
}

/// The BitTorrent handshake message.
///
/// First thing on the wire in both directions: protocol identifier,
/// 8 reserved bytes, the torrent's info hash, and the sender's peer ID.
/// We write the reserved bytes as zero and ignore them on read.
#[derive(Debug, Clone)]
pub struct Handshake {
    /// The torrent's info hash.
    pub info_hash: InfoHash,
    /// The sender's peer ID.
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self { info_hash, peer_id }
    }

    /// Encodes the handshake to its fixed 68-byte wire form.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_STRING.len() as u8);
        buf.put_slice(PROTOCOL_STRING);
        buf.put_slice(&[0u8; 8]);
        buf.put_slice(self.info_hash.as_bytes());
        buf.put_slice(self.peer_id.as_bytes());
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        if data.len() < HANDSHAKE_LEN {
            return Err(PeerError::BadProtocol);
        }
        if data[0] as usize != PROTOCOL_STRING.len() || &data[1..20] != PROTOCOL_STRING {
            return Err(PeerError::BadProtocol);
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Self {
            info_hash: InfoHash::from_bytes(info_hash),
            peer_id: PeerId::from_bytes(peer_id),
        })
    }
}

/// A peer wire protocol message.
///
/// Messages are length-prefixed: a 4-byte big-endian length followed by a
/// 1-byte message ID (except keep-alive, which has length 0) and payload.
#[derive(Debug, Clone)]
pub enum Message {
    /// Empty message to keep the connection alive.
    KeepAlive,
    /// We are choking the peer (not sending data).
    Choke,
    /// We are unchoking the peer (ready to send data).
    Unchoke,
    /// We are interested in the peer's data.
    Interested,
    /// We are not interested in the peer's data.
    NotInterested,
    /// Announce that we have a piece.
    Have { piece: u32 },
    /// Bitfield of all pieces we have. Legal only as the first message
    /// after the handshake.
    Bitfield(Bytes),
    /// Request a block of data.
    Request { index: u32, begin: u32, length: u32 },
    /// Send piece data.
    Piece { index: u32, begin: u32, data: Bytes },
    /// Cancel a pending request.
    Cancel { index: u32, begin: u32, length: u32 },
    /// DHT port announcement.
    Port(u16),
}

impl Message {
    /// Encodes the message to bytes for transmission, length prefix
    /// included.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Message::Have { piece } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(*piece);
            }
            Message::Bitfield(bits) => {
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(bits);
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Port(port) => {
                buf.put_u32(3);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(*port);
            }
        }

        buf.freeze()
    }

    /// Decodes one complete frame (length prefix included).
    ///
    /// Body lengths are validated exactly per message type; a mismatch is
    /// a protocol violation that terminates the connection.
    pub fn decode(mut data: Bytes) -> Result<Self, PeerError> {
        if data.len() < 4 {
            return Err(PeerError::ProtocolViolation("frame shorter than length prefix".into()));
        }

        let length = data.get_u32() as usize;

        if length == 0 {
            return Ok(Message::KeepAlive);
        }

        if data.remaining() != length {
            return Err(PeerError::ProtocolViolation(format!(
                "declared length {} but {} bytes present",
                length,
                data.remaining()
            )));
        }

        let id = MessageId::try_from(data.get_u8())?;
        let body = data.remaining();

        match id {
            MessageId::Choke => Self::expect_empty(body, Message::Choke),
            MessageId::Unchoke => Self::expect_empty(body, Message::Unchoke),
            MessageId::Interested => Self::expect_empty(body, Message::Interested),
            MessageId::NotInterested => Self::expect_empty(body, Message::NotInterested),
            MessageId::Have => {
                if body != 4 {
                    return Err(PeerError::ProtocolViolation(format!(
                        "have body must be 4 bytes, got {}",
                        body
                    )));
                }
                Ok(Message::Have {
                    piece: data.get_u32(),
                })
            }
            MessageId::Bitfield => Ok(Message::Bitfield(data.copy_to_bytes(body))),
            MessageId::Request => {
                if body != 12 {
                    return Err(PeerError::ProtocolViolation(format!(
                        "request body must be 12 bytes, got {}",
                        body
                    )));
                }
                Ok(Message::Request {
                    index: data.get_u32(),
                    begin: data.get_u32(),
                    length: data.get_u32(),
                })
            }
            MessageId::Piece => {
                if body < 8 {
                    return Err(PeerError::ProtocolViolation(format!(
                        "piece body must be at least 8 bytes, got {}",
                        body
                    )));
                }
                let index = data.get_u32();
                let begin = data.get_u32();
                let block = data.copy_to_bytes(body - 8);
                Ok(Message::Piece {
                    index,
                    begin,
                    data: block,
                })
            }
            MessageId::Cancel => {
                if body != 12 {
                    return Err(PeerError::ProtocolViolation(format!(
                        "cancel body must be 12 bytes, got {}",
                        body
                    )));
                }
                Ok(Message::Cancel {
                    index: data.get_u32(),
                    begin: data.get_u32(),
                    length: data.get_u32(),
                })
            }
            MessageId::Port => {
                if body != 2 {
                    return Err(PeerError::ProtocolViolation(format!(
                        "port body must be 2 bytes, got {}",
                        body
                    )));
                }
                Ok(Message::Port(data.get_u16()))
            }
        }
    }

    fn expect_empty(body: usize, message: Message) -> Result<Self, PeerError> {
        if body != 0 {
            return Err(PeerError::ProtocolViolation(format!(
                "{:?} carries no body, got {} bytes",
                message, body
            )));
        }
        Ok(message)
    }
}
