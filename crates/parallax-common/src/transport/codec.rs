use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::error::{ParallelError, Result};

/// Maximum envelope size (100 MB)
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Upper bound on frames per envelope, checked before allocating.
const MAX_FRAMES: usize = 1 << 16;

/// A multipart message: routing identities followed by body frames.
///
/// The identity count is part of the envelope, so an identity frame can hold
/// any bytes at all, including the message delimiter.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Multipart {
    pub ident_count: usize,
    pub frames: Vec<Bytes>,
}

impl Multipart {
    pub fn new(idents: Vec<Bytes>, body: Vec<Bytes>) -> Self {
        let ident_count = idents.len();
        let mut frames = idents;
        frames.extend(body);
        Self { ident_count, frames }
    }

    pub fn idents(&self) -> &[Bytes] {
        &self.frames[..self.ident_count]
    }

    pub fn body(&self) -> &[Bytes] {
        &self.frames[self.ident_count..]
    }

    pub fn push_ident_front(&mut self, ident: Bytes) {
        self.frames.insert(0, ident);
        self.ident_count += 1;
    }

    pub fn pop_ident_front(&mut self) -> Option<Bytes> {
        if self.ident_count == 0 {
            return None;
        }
        self.ident_count -= 1;
        Some(self.frames.remove(0))
    }

    /// Total payload bytes across all frames.
    pub fn byte_len(&self) -> usize {
        self.frames.iter().map(Bytes::len).sum()
    }
}

/// Length-prefixed multipart framing.
///
/// Wire format:
///
/// ```text
/// [u32 ident_count] [u32 frame_count] ([u32 len] [bytes])*
/// ```
pub struct MultipartCodec;

impl MultipartCodec {
    /// Encodes a message into a single contiguous buffer.
    pub fn encode(msg: &Multipart) -> Result<Bytes> {
        let payload = msg.byte_len();
        if payload > MAX_MESSAGE_SIZE {
            return Err(ParallelError::Transport(format!(
                "Message too large: {} bytes (max {} bytes)",
                payload, MAX_MESSAGE_SIZE
            )));
        }

        let mut buf = BytesMut::with_capacity(8 + 4 * msg.frames.len() + payload);
        buf.put_u32(msg.ident_count as u32);
        buf.put_u32(msg.frames.len() as u32);
        for frame in &msg.frames {
            buf.put_u32(frame.len() as u32);
            buf.put_slice(frame);
        }
        Ok(buf.freeze())
    }

    /// Writes one message and flushes.
    pub async fn write<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Multipart) -> Result<()> {
        let encoded = Self::encode(msg)?;
        writer
            .write_all(&encoded)
            .await
            .map_err(|e| Self::map_io_error(e, "writing message"))?;
        writer
            .flush()
            .await
            .map_err(|e| Self::map_io_error(e, "flushing stream"))?;
        Ok(())
    }

    /// Reads one message.
    ///
    /// Returns `Ok(None)` when the peer closed the connection cleanly
    /// between messages.
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Multipart>> {
        let mut head = [0u8; 8];
        match reader.read_exact(&mut head).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(Self::map_io_error(e, "reading envelope")),
        }

        let ident_count = u32::from_be_bytes([head[0], head[1], head[2], head[3]]) as usize;
        let frame_count = u32::from_be_bytes([head[4], head[5], head[6], head[7]]) as usize;

        if frame_count > MAX_FRAMES {
            return Err(ParallelError::Transport(format!(
                "Too many frames: {} (max {})",
                frame_count, MAX_FRAMES
            )));
        }
        if ident_count > frame_count {
            return Err(ParallelError::Transport(format!(
                "Identity count {} exceeds frame count {}",
                ident_count, frame_count
            )));
        }

        let mut total = 0usize;
        let mut frames = Vec::with_capacity(frame_count);
        for _ in 0..frame_count {
            let mut len_buf = [0u8; 4];
            reader
                .read_exact(&mut len_buf)
                .await
                .map_err(|e| Self::map_io_error(e, "reading frame length"))?;
            let len = u32::from_be_bytes(len_buf) as usize;

            total += len;
            if total > MAX_MESSAGE_SIZE {
                return Err(ParallelError::Transport(format!(
                    "Message too large: {} bytes (max {} bytes)",
                    total, MAX_MESSAGE_SIZE
                )));
            }

            let mut frame = vec![0u8; len];
            reader
                .read_exact(&mut frame)
                .await
                .map_err(|e| Self::map_io_error(e, "reading frame"))?;
            frames.push(Bytes::from(frame));
        }

        Ok(Some(Multipart { ident_count, frames }))
    }

    /// Map IO errors to appropriate ParallelError variants
    fn map_io_error(err: std::io::Error, context: &str) -> ParallelError {
        match err.kind() {
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof => {
                ParallelError::Connection(format!("{}: Connection lost", context))
            }
            _ => ParallelError::Io(err),
        }
    }
}
