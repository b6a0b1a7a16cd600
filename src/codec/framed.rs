use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::connection::Role;
use crate::deadline::{Deadlines, with_deadline};
use crate::error::{Error, Result};
use crate::pool::PooledBuffer;
use crate::protocol::frame::{Frame, FrameHeader, MAX_HEADER_LEN};
use crate::protocol::mask::{MaskGenerator, apply_mask_at};
use crate::protocol::validation::FrameValidator;

#[derive(Debug, Clone, Copy)]
struct InFrame {
    mask: Option<[u8; 4]>,
    remaining: u64,
    mask_pos: usize,
}

/// Reads frame headers and payload from the read half of a stream.
///
/// A frame is consumed in two steps: [`FrameReader::read_header`] decodes
/// and validates the header, then the payload is pulled with
/// [`FrameReader::read_payload_chunk`] or [`FrameReader::read_payload`].
/// Payload is unmasked on the way out, chunk by chunk.
pub struct FrameReader<R> {
    io: R,
    buf: BytesMut,
    buffer_size: usize,
    validator: FrameValidator,
    deadlines: Arc<Deadlines>,
    current: Option<InFrame>,
}

impl<R> FrameReader<R> {
    /// `buf` may already hold bytes read past the handshake.
    pub fn new(
        io: R,
        buf: BytesMut,
        buffer_size: usize,
        validator: FrameValidator,
        deadlines: Arc<Deadlines>,
    ) -> Self {
        Self {
            io,
            buf,
            buffer_size: buffer_size.max(MAX_HEADER_LEN),
            validator,
            deadlines,
            current: None,
        }
    }

    #[must_use]
    pub fn validator(&self) -> &FrameValidator {
        &self.validator
    }

    /// Payload bytes of the current frame not yet read.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.current.map_or(0, |f| f.remaining)
    }

    /// Bytes received but not yet decoded.
    #[must_use]
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> R {
        self.io
    }
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    async fn fill(&mut self) -> Result<()> {
        self.buf.reserve(self.buffer_size);
        let n = with_deadline(self.deadlines.read(), self.io.read_buf(&mut self.buf)).await?;
        if n == 0 {
            return Err(Error::AbnormalClosure);
        }
        Ok(())
    }

    /// Decode and validate the next frame header.
    ///
    /// Unread payload of the previous frame is skipped first.
    ///
    /// # Errors
    ///
    /// Validation errors, `Error::AbnormalClosure` on EOF, `Error::Timeout`
    /// once the read deadline passes, or `Error::Io`.
    pub async fn read_header(&mut self) -> Result<FrameHeader> {
        while self.read_payload_chunk().await?.is_some() {}

        loop {
            match FrameHeader::parse(&self.buf) {
                Ok((header, len)) => {
                    self.buf.advance(len);
                    self.validator.validate(&header)?;
                    if header.payload_len > 0 {
                        self.current = Some(InFrame {
                            mask: header.mask,
                            remaining: header.payload_len,
                            mask_pos: 0,
                        });
                    }
                    return Ok(header);
                }
                Err(Error::IncompleteFrame { .. }) => self.fill().await?,
                Err(e) => return Err(e),
            }
        }
    }

    /// Next unmasked piece of the current frame's payload, or `None` once it
    /// has been read completely.
    ///
    /// # Errors
    ///
    /// As for [`FrameReader::read_header`].
    pub async fn read_payload_chunk(&mut self) -> Result<Option<Bytes>> {
        let Some(frame) = self.current else {
            return Ok(None);
        };
        if self.buf.is_empty() {
            self.fill().await?;
        }
        let n = usize::try_from(frame.remaining)
            .unwrap_or(usize::MAX)
            .min(self.buf.len());
        let mut chunk = self.buf.split_to(n);
        let mask_pos = match frame.mask {
            Some(key) => apply_mask_at(&mut chunk, key, frame.mask_pos),
            None => frame.mask_pos,
        };
        let remaining = frame.remaining - n as u64;
        self.current = (remaining > 0).then_some(InFrame {
            remaining,
            mask_pos,
            ..frame
        });
        Ok(Some(chunk.freeze()))
    }

    /// The rest of the current frame's payload in one buffer.
    ///
    /// Callers bound the frame size before calling this.
    ///
    /// # Errors
    ///
    /// As for [`FrameReader::read_header`].
    pub async fn read_payload(&mut self) -> Result<Bytes> {
        let Some(first) = self.read_payload_chunk().await? else {
            return Ok(Bytes::new());
        };
        if self.current.is_none() {
            return Ok(first);
        }
        let capacity = usize::try_from(self.remaining()).unwrap_or(0) + first.len();
        let mut payload = BytesMut::with_capacity(capacity);
        payload.extend_from_slice(&first);
        while let Some(chunk) = self.read_payload_chunk().await? {
            payload.extend_from_slice(&chunk);
        }
        Ok(payload.freeze())
    }

    /// Read one complete frame.
    ///
    /// # Errors
    ///
    /// As for [`FrameReader::read_header`].
    pub async fn read_frame(&mut self) -> Result<Frame> {
        let header = self.read_header().await?;
        let payload = self.read_payload().await?;
        Ok(Frame::from_parts(header, payload))
    }
}

impl<R> std::fmt::Debug for FrameReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReader")
            .field("buffered", &self.buf.len())
            .field("remaining", &self.remaining())
            .field("role", &self.validator.role())
            .finish()
    }
}

/// Encodes frames into a write buffer and flushes it to the write half.
///
/// Client writers mask every frame with a fresh key. Payloads larger than
/// the buffer are copied, masked and flushed piece by piece.
pub struct FrameWriter<W> {
    io: W,
    buf: PooledBuffer,
    capacity: usize,
    role: Role,
    masks: MaskGenerator,
    deadlines: Arc<Deadlines>,
}

impl<W> FrameWriter<W> {
    pub fn new(io: W, buf: PooledBuffer, role: Role, deadlines: Arc<Deadlines>) -> Self {
        let capacity = buf.size().max(MAX_HEADER_LEN * 2);
        Self {
            io,
            buf,
            capacity,
            role,
            masks: MaskGenerator::new(),
            deadlines,
        }
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn into_inner(self) -> W {
        self.io
    }
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    async fn flush_buf(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            with_deadline(self.deadlines.write(), self.io.write_all(&self.buf)).await?;
            self.buf.clear();
        }
        Ok(())
    }

    /// Write one frame and flush it to the stream.
    ///
    /// The mask is chosen by the role; any key on `frame` is ignored.
    ///
    /// # Errors
    ///
    /// `Error::Timeout` once the write deadline passes, or `Error::Io`.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let mut header = frame.header();
        header.mask = if self.role.must_mask() {
            Some(self.masks.next_key()?)
        } else {
            None
        };
        if self.buf.len() + MAX_HEADER_LEN > self.capacity {
            self.flush_buf().await?;
        }
        header.encode(&mut self.buf);

        let mut payload = frame.payload();
        let mut mask_pos = 0;
        while !payload.is_empty() {
            let space = self.capacity.saturating_sub(self.buf.len());
            if space == 0 {
                self.flush_buf().await?;
                continue;
            }
            let (now, later) = payload.split_at(space.min(payload.len()));
            let start = self.buf.len();
            self.buf.extend_from_slice(now);
            if let Some(key) = header.mask {
                mask_pos = apply_mask_at(&mut self.buf[start..], key, mask_pos);
            }
            payload = later;
        }

        self.flush_buf().await?;
        with_deadline(self.deadlines.write(), self.io.flush()).await
    }

    /// Flush and shut down the write half.
    ///
    /// # Errors
    ///
    /// As for [`FrameWriter::write_frame`].
    pub async fn shutdown(&mut self) -> Result<()> {
        self.flush_buf().await?;
        with_deadline(self.deadlines.write(), self.io.shutdown()).await
    }
}

impl<W> std::fmt::Debug for FrameWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriter")
            .field("capacity", &self.capacity)
            .field("pending", &self.buf.len())
            .field("role", &self.role)
            .finish()
    }
}
