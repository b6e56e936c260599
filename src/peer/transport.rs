use super::error::PeerError;
use super::message::Message;
use crate::constants::{READ_BUFFER_SIZE, READ_TIMEOUT, WRITE_TIMEOUT};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Reads length-prefixed frames off one half of a peer socket.
///
/// The cap is checked against the declared length before any buffer space
/// is reserved, so a hostile length field cannot trigger a large
/// allocation. Each fill is bounded by the inactivity deadline.
pub struct FrameReader<R> {
    reader: R,
    buf: BytesMut,
    max_frame_len: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_frame_len: usize) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            max_frame_len,
        }
    }

    /// Reads the next complete frame.
    ///
    /// Returns `None` on a clean close (EOF at a frame boundary); EOF in
    /// the middle of a frame is [`PeerError::ConnectionClosed`].
    pub async fn read_frame(&mut self) -> Result<Option<Message>, PeerError> {
        while self.buf.len() < 4 {
            if self.fill().await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(PeerError::ConnectionClosed);
            }
        }

        let length =
            u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;

        if length > self.max_frame_len {
            return Err(PeerError::FrameTooLarge(length));
        }

        let total = 4 + length;
        if self.buf.capacity() < total {
            self.buf.reserve(total - self.buf.len());
        }
        while self.buf.len() < total {
            if self.fill().await? == 0 {
                return Err(PeerError::ConnectionClosed);
            }
        }

        let frame = self.buf.split_to(total).freeze();
        Message::decode(frame).map(Some)
    }

    async fn fill(&mut self) -> Result<usize, PeerError> {
        let n = timeout(READ_TIMEOUT, self.reader.read_buf(&mut self.buf))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Ok(n)
    }
}

/// Writes frames to the other half of a peer socket.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), PeerError> {
        let data = message.encode();
        timeout(WRITE_TIMEOUT, self.writer.write_all(&data))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Ok(())
    }

    /// Shuts down the write direction, signalling the remote that no more
    /// frames follow.
    pub async fn shutdown(&mut self) -> Result<(), PeerError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
