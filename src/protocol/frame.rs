//! Frame header encoding and decoding (RFC 6455 Section 5.2).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |                   Masking key (if MASK set)                   |
//! +---------------------------------------------------------------+
//! |                          Payload data                         |
//! +---------------------------------------------------------------+
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::message::CloseFrame;
use crate::protocol::OpCode;
use crate::protocol::mask::apply_mask;

/// Maximum payload size for control frames.
pub const MAX_CONTROL_FRAME_PAYLOAD: usize = 125;

/// Longest possible header: 2 + 8 byte length + 4 byte mask.
pub const MAX_HEADER_LEN: usize = 14;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: OpCode,
    /// Masking key, present iff the MASK bit is set.
    pub mask: Option<[u8; 4]>,
    pub payload_len: u64,
}

impl FrameHeader {
    /// Decode a header from the front of `buf`.
    ///
    /// Returns the header and the number of bytes it occupies.
    ///
    /// # Errors
    ///
    /// - `Error::IncompleteFrame` if `buf` ends inside the header
    /// - `Error::ReservedOpcode` for reserved opcodes
    /// - `Error::InvalidPayloadLength` if the 64-bit length has its high bit set
    pub fn parse(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < 2 {
            return Err(Error::IncompleteFrame {
                needed: 2 - buf.len(),
            });
        }

        let byte0 = buf[0];
        let byte1 = buf[1];
        let opcode = OpCode::from_u8(byte0 & 0x0F)?;
        let masked = byte1 & 0x80 != 0;

        let (payload_len, len_end) = match byte1 & 0x7F {
            126 => {
                need(buf, 4)?;
                (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
            }
            127 => {
                need(buf, 10)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&buf[2..10]);
                let len = u64::from_be_bytes(raw);
                if len & (1 << 63) != 0 {
                    return Err(Error::InvalidPayloadLength(len));
                }
                (len, 10)
            }
            short => (u64::from(short), 2),
        };

        let (mask, header_len) = if masked {
            need(buf, len_end + 4)?;
            let mut key = [0u8; 4];
            key.copy_from_slice(&buf[len_end..len_end + 4]);
            (Some(key), len_end + 4)
        } else {
            (None, len_end)
        };

        let header = FrameHeader {
            fin: byte0 & 0x80 != 0,
            rsv1: byte0 & 0x40 != 0,
            rsv2: byte0 & 0x20 != 0,
            rsv3: byte0 & 0x10 != 0,
            opcode,
            mask,
            payload_len,
        };
        Ok((header, header_len))
    }

    /// Encoded size of this header.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let ext = match self.payload_len {
            0..=125 => 0,
            126..=0xFFFF => 2,
            _ => 8,
        };
        2 + ext + if self.mask.is_some() { 4 } else { 0 }
    }

    /// Append the header to `dst`, using the shortest length encoding.
    pub fn encode(&self, dst: &mut BytesMut) {
        let mut byte0 = self.opcode.as_u8();
        if self.fin {
            byte0 |= 0x80;
        }
        if self.rsv1 {
            byte0 |= 0x40;
        }
        if self.rsv2 {
            byte0 |= 0x20;
        }
        if self.rsv3 {
            byte0 |= 0x10;
        }
        let mask_bit = if self.mask.is_some() { 0x80 } else { 0 };

        dst.reserve(self.encoded_len());
        dst.put_u8(byte0);
        match self.payload_len {
            len @ 0..=125 => dst.put_u8(mask_bit | len as u8),
            len @ 126..=0xFFFF => {
                dst.put_u8(mask_bit | 126);
                dst.put_u16(len as u16);
            }
            len => {
                dst.put_u8(mask_bit | 127);
                dst.put_u64(len);
            }
        }
        if let Some(key) = self.mask {
            dst.put_slice(&key);
        }
    }
}

#[inline]
fn need(buf: &[u8], len: usize) -> Result<()> {
    if buf.len() < len {
        return Err(Error::IncompleteFrame {
            needed: len - buf.len(),
        });
    }
    Ok(())
}

/// A complete frame.
///
/// The payload is always held unmasked. `mask` records the key used (or to
/// be used) on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: OpCode,
    pub mask: Option<[u8; 4]>,
    payload: Bytes,
}

impl Frame {
    #[must_use]
    pub fn new(fin: bool, opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Final text frame.
    #[must_use]
    pub fn text(data: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Text, data)
    }

    /// Final binary frame.
    #[must_use]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Binary, data)
    }

    /// Close frame; `None` sends an empty payload.
    #[must_use]
    pub fn close(status: Option<&CloseFrame>) -> Self {
        let payload = status.map(CloseFrame::encode).unwrap_or_default();
        Self::new(true, OpCode::Close, payload)
    }

    #[must_use]
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Ping, data)
    }

    #[must_use]
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Pong, data)
    }

    /// Rebuild a frame from a header and its unmasked payload.
    #[must_use]
    pub fn from_parts(header: FrameHeader, payload: Bytes) -> Self {
        Self {
            fin: header.fin,
            rsv1: header.rsv1,
            rsv2: header.rsv2,
            rsv3: header.rsv3,
            opcode: header.opcode,
            mask: header.mask,
            payload,
        }
    }

    #[must_use]
    pub fn with_mask(mut self, key: Option<[u8; 4]>) -> Self {
        self.mask = key;
        self
    }

    #[must_use]
    pub fn with_rsv1(mut self, rsv1: bool) -> Self {
        self.rsv1 = rsv1;
        self
    }

    /// Header describing this frame on the wire.
    #[must_use]
    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            fin: self.fin,
            rsv1: self.rsv1,
            rsv2: self.rsv2,
            rsv3: self.rsv3,
            opcode: self.opcode,
            mask: self.mask,
            payload_len: self.payload.len() as u64,
        }
    }

    #[inline]
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[must_use]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Parse one frame from the front of `buf`, unmasking its payload.
    ///
    /// Returns the frame and the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Header errors from [`FrameHeader::parse`], and `Error::IncompleteFrame`
    /// while the payload is still short.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize)> {
        let (header, header_len) = FrameHeader::parse(buf)?;
        let payload_len = usize::try_from(header.payload_len).map_err(|_| Error::MessageTooLarge {
            size: header.payload_len,
            max: usize::MAX,
        })?;
        let total = header_len
            .checked_add(payload_len)
            .ok_or(Error::InvalidPayloadLength(header.payload_len))?;
        need(buf, total)?;

        let mut payload = BytesMut::from(&buf[header_len..total]);
        if let Some(key) = header.mask {
            apply_mask(&mut payload, key);
        }
        Ok((Self::from_parts(header, payload.freeze()), total))
    }

    /// Check the structural rules that do not depend on connection state.
    ///
    /// # Errors
    ///
    /// - `Error::ReservedBitsSet` for RSV2/RSV3, or RSV1 outside a
    ///   message-initiating data frame
    /// - `Error::FragmentedControlFrame` if a control frame has FIN=0
    /// - `Error::ControlFrameTooLarge` if a control payload exceeds 125 bytes
    pub fn validate(&self) -> Result<()> {
        if self.rsv2 || self.rsv3 {
            return Err(Error::ReservedBitsSet);
        }
        if self.rsv1 && !matches!(self.opcode, OpCode::Text | OpCode::Binary) {
            return Err(Error::ReservedBitsSet);
        }
        if self.opcode.is_control() {
            if !self.fin {
                return Err(Error::FragmentedControlFrame);
            }
            if self.payload.len() > MAX_CONTROL_FRAME_PAYLOAD {
                return Err(Error::ControlFrameTooLarge(self.payload.len()));
            }
        }
        Ok(())
    }

    /// Append the encoded frame to `dst`, masking the payload if `mask` is set.
    pub fn encode(&self, dst: &mut BytesMut) {
        self.header().encode(dst);
        let start = dst.len();
        dst.extend_from_slice(&self.payload);
        if let Some(key) = self.mask {
            apply_mask(&mut dst[start..], key);
        }
    }

    /// Encoded size of this frame.
    #[must_use]
    pub fn wire_size(&self) -> usize {
        self.header().encoded_len() + self.payload.len()
    }
}
