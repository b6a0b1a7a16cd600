//! Message reassembly (RFC 6455 Section 5.4).
//!
//! The assembler sits between frame headers and the caller. It tracks which
//! message is in progress, rejects out-of-order data frames, enforces the
//! message size limit before payload is read, inflates compressed messages
//! and validates text as it streams past.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::extensions::deflate::MessageInflater;
use crate::message::{Message, MessageKind};
use crate::protocol::frame::{Frame, FrameHeader};
use crate::protocol::utf8::Utf8Validator;
use crate::protocol::OpCode;

#[derive(Debug)]
struct InProgress {
    kind: MessageKind,
    compressed: bool,
    /// Payload bytes received on the wire so far.
    received: u64,
    utf8: Option<Utf8Validator>,
}

/// Reassembles fragmented data frames into messages.
#[derive(Debug)]
pub struct MessageAssembler {
    max_message_size: usize,
    current: Option<InProgress>,
    inflater: MessageInflater,
    /// Buffer for [`MessageAssembler::push`].
    buffer: Vec<u8>,
}

impl MessageAssembler {
    #[must_use]
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            current: None,
            inflater: MessageInflater::new(),
            buffer: Vec::new(),
        }
    }

    /// True while a message has started but its final frame has not arrived.
    #[must_use]
    pub fn is_assembling(&self) -> bool {
        self.current.is_some()
    }

    /// Kind of the message in progress.
    #[must_use]
    pub fn kind(&self) -> Option<MessageKind> {
        self.current.as_ref().map(|m| m.kind)
    }

    /// Account for the header of a data frame.
    ///
    /// Returns the message kind when the frame starts a new message.
    ///
    /// # Errors
    ///
    /// - `Error::ProtocolViolation` for a continuation with no message in
    ///   progress, or a new message while one is in progress
    /// - `Error::MessageTooLarge` if the frame would push the message over
    ///   the limit. For compressed messages this bounds the wire bytes; the
    ///   inflated output is bounded separately as it is decoded.
    pub fn on_header(&mut self, header: &FrameHeader) -> Result<Option<MessageKind>> {
        let started = match header.opcode {
            OpCode::Continuation => {
                if self.current.is_none() {
                    return Err(Error::ProtocolViolation(
                        "continuation frame without a message in progress".into(),
                    ));
                }
                None
            }
            OpCode::Text | OpCode::Binary => {
                if self.current.is_some() {
                    return Err(Error::ProtocolViolation(
                        "new data frame while a message is in progress".into(),
                    ));
                }
                let kind = if header.opcode == OpCode::Text {
                    MessageKind::Text
                } else {
                    MessageKind::Binary
                };
                self.current = Some(InProgress {
                    kind,
                    compressed: header.rsv1,
                    received: 0,
                    utf8: (kind == MessageKind::Text).then(Utf8Validator::new),
                });
                Some(kind)
            }
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "{} frame passed to the message assembler",
                    other.name()
                )));
            }
        };

        if let Some(current) = self.current.as_mut() {
            let received = current.received.saturating_add(header.payload_len);
            if received > self.max_message_size as u64 {
                return Err(self.fail(Error::MessageTooLarge {
                    size: received,
                    max: self.max_message_size,
                }));
            }
            current.received = received;
        }
        Ok(started)
    }

    /// Decode a chunk of (unmasked) payload belonging to the message in
    /// progress, appending the message bytes to `out`.
    ///
    /// # Errors
    ///
    /// `Error::Decompression`, `Error::MessageTooLarge` or
    /// `Error::InvalidUtf8`. The message is abandoned on error.
    pub fn decode(&mut self, chunk: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let Some(current) = self.current.as_mut() else {
            return Err(Error::ProtocolViolation("payload without a message".into()));
        };
        let start = out.len();
        let result = if current.compressed {
            self.inflater.write(chunk, out, self.max_message_size)
        } else {
            out.extend_from_slice(chunk);
            Ok(())
        };
        let result = result.and_then(|()| match current.utf8.as_mut() {
            Some(v) => v.feed(&out[start..]),
            None => Ok(()),
        });
        result.map_err(|e| self.fail(e))
    }

    /// Like [`MessageAssembler::decode`] for an owned chunk. Uncompressed
    /// chunks are validated and handed back without copying.
    ///
    /// # Errors
    ///
    /// As for [`MessageAssembler::decode`].
    pub fn decode_chunk(&mut self, chunk: Bytes) -> Result<Bytes> {
        let Some(current) = self.current.as_mut() else {
            return Err(Error::ProtocolViolation("payload without a message".into()));
        };
        if current.compressed {
            let mut out = Vec::with_capacity(chunk.len().saturating_mul(2));
            self.decode(&chunk, &mut out)?;
            return Ok(Bytes::from(out));
        }
        if let Some(validator) = current.utf8.as_mut() {
            if let Err(err) = validator.feed(&chunk) {
                return Err(self.fail(err));
            }
        }
        Ok(chunk)
    }

    /// Complete the message after its final frame has been decoded.
    ///
    /// Flushes the inflater into `out` and checks that text ended on a
    /// character boundary.
    ///
    /// # Errors
    ///
    /// As for [`MessageAssembler::decode`].
    pub fn finish(&mut self, out: &mut Vec<u8>) -> Result<MessageKind> {
        let Some(mut current) = self.current.take() else {
            return Err(Error::ProtocolViolation("no message to finish".into()));
        };
        let start = out.len();
        let result = if current.compressed {
            self.inflater.finish(out, self.max_message_size)
        } else {
            Ok(())
        };
        let result = result.and_then(|()| match current.utf8.as_mut() {
            Some(v) => v.feed(&out[start..]).and_then(|()| v.finish()),
            None => Ok(()),
        });
        result.map(|()| current.kind).map_err(|e| self.fail(e))
    }

    /// Drop the message in progress.
    pub fn reset(&mut self) {
        self.current = None;
        self.inflater.reset();
        self.buffer.clear();
    }

    /// Feed a whole data frame. Returns the message once its final frame
    /// has arrived.
    ///
    /// # Errors
    ///
    /// Any of the errors of [`MessageAssembler::on_header`],
    /// [`MessageAssembler::decode`] and [`MessageAssembler::finish`].
    pub fn push(&mut self, frame: &Frame) -> Result<Option<Message>> {
        self.on_header(&frame.header())?;
        let mut buffer = std::mem::take(&mut self.buffer);
        self.decode(frame.payload(), &mut buffer)?;
        if !frame.fin {
            self.buffer = buffer;
            return Ok(None);
        }
        let kind = self.finish(&mut buffer)?;
        Message::from_parts(kind, buffer).map(Some)
    }

    fn fail(&mut self, err: Error) -> Error {
        self.reset();
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::deflate::MessageDeflater;

    const LIMIT: usize = 1 << 20;

    fn push_all(assembler: &mut MessageAssembler, frames: &[Frame]) -> Result<Option<Message>> {
        let mut last = None;
        for frame in frames {
            last = assembler.push(frame)?;
        }
        Ok(last)
    }

    #[test]
    fn test_single_frame_message() {
        let mut assembler = MessageAssembler::new(LIMIT);
        let msg = assembler.push(&Frame::text("Hello")).unwrap().unwrap();
        assert_eq!(msg, Message::text("Hello"));
        assert!(!assembler.is_assembling());
    }

    #[test]
    fn test_fragmented_message() {
        let mut assembler = MessageAssembler::new(LIMIT);
        assert!(assembler.push(&Frame::new(false, OpCode::Binary, vec![1, 2])).unwrap().is_none());
        assert_eq!(assembler.kind(), Some(MessageKind::Binary));
        assert!(assembler.push(&Frame::new(false, OpCode::Continuation, vec![3])).unwrap().is_none());
        let msg = assembler
            .push(&Frame::new(true, OpCode::Continuation, vec![4, 5]))
            .unwrap()
            .unwrap();
        assert_eq!(msg, Message::binary(vec![1, 2, 3, 4, 5]));
    }

    #[test]
    fn test_continuation_without_start() {
        let mut assembler = MessageAssembler::new(LIMIT);
        let err = assembler
            .push(&Frame::new(true, OpCode::Continuation, "x"))
            .unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }

    #[test]
    fn test_new_message_while_in_progress() {
        let mut assembler = MessageAssembler::new(LIMIT);
        assembler.push(&Frame::new(false, OpCode::Text, "first")).unwrap();
        let err = assembler.push(&Frame::text("second")).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }

    #[test]
    fn test_control_frame_rejected() {
        let mut assembler = MessageAssembler::new(LIMIT);
        assert!(assembler.push(&Frame::ping("p")).is_err());
    }

    #[test]
    fn test_size_checked_from_header() {
        let mut assembler = MessageAssembler::new(100);
        assembler.push(&Frame::new(false, OpCode::Binary, vec![0u8; 60])).unwrap();
        let header = Frame::new(true, OpCode::Continuation, vec![0u8; 41]).header();
        let err = assembler.on_header(&header).unwrap_err();
        assert_eq!(err, Error::MessageTooLarge { size: 101, max: 100 });
        assert!(!assembler.is_assembling());
    }

    #[test]
    fn test_utf8_split_across_fragments() {
        let mut assembler = MessageAssembler::new(LIMIT);
        let msg = push_all(
            &mut assembler,
            &[
                Frame::new(false, OpCode::Text, vec![0xf0, 0x9f]),
                Frame::new(true, OpCode::Continuation, vec![0x8e, 0x89]),
            ],
        )
        .unwrap()
        .unwrap();
        assert_eq!(msg.as_text(), Some("\u{1f389}"));
    }

    #[test]
    fn test_invalid_utf8_fails_early() {
        let mut assembler = MessageAssembler::new(LIMIT);
        let err = assembler
            .push(&Frame::new(false, OpCode::Text, vec![0xc3, 0x28]))
            .unwrap_err();
        assert_eq!(err, Error::InvalidUtf8);
    }

    #[test]
    fn test_truncated_utf8_at_end() {
        let mut assembler = MessageAssembler::new(LIMIT);
        let err = assembler
            .push(&Frame::new(true, OpCode::Text, vec![b'a', 0xe2, 0x82]))
            .unwrap_err();
        assert_eq!(err, Error::InvalidUtf8);
    }

    #[test]
    fn test_binary_skips_utf8() {
        let mut assembler = MessageAssembler::new(LIMIT);
        let msg = assembler
            .push(&Frame::binary(vec![0x80, 0xff]))
            .unwrap()
            .unwrap();
        assert_eq!(msg.as_bytes(), &[0x80, 0xff]);
    }

    #[test]
    fn test_compressed_fragments() {
        let compressed = MessageDeflater::new(6).compress(b"compressed text message").unwrap();
        let (a, b) = compressed.split_at(compressed.len() / 2);
        let mut assembler = MessageAssembler::new(LIMIT);
        let msg = push_all(
            &mut assembler,
            &[
                Frame::new(false, OpCode::Text, a.to_vec()).with_rsv1(true),
                Frame::new(true, OpCode::Continuation, b.to_vec()),
            ],
        )
        .unwrap()
        .unwrap();
        assert_eq!(msg, Message::text("compressed text message"));
    }

    #[test]
    fn test_compressed_limit_applies_to_inflated_size() {
        let compressed = MessageDeflater::new(9).compress(&[b'a'; 4096]).unwrap();
        assert!(compressed.len() < 100);
        let mut assembler = MessageAssembler::new(100);
        let err = assembler
            .push(&Frame::binary(compressed).with_rsv1(true))
            .unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge { max: 100, .. }));
    }

    #[test]
    fn test_compressed_wire_size_is_limited() {
        let mut assembler = MessageAssembler::new(100);
        let first = Frame::new(false, OpCode::Binary, vec![0u8; 60]).with_rsv1(true);
        assert_eq!(
            assembler.on_header(&first.header()).unwrap(),
            Some(MessageKind::Binary)
        );
        let next = Frame::new(false, OpCode::Continuation, vec![0u8; 60]);
        let err = assembler.on_header(&next.header()).unwrap_err();
        assert_eq!(err, Error::MessageTooLarge { size: 120, max: 100 });
        assert!(!assembler.is_assembling());
    }

    #[test]
    fn test_decode_chunk_streams_uncompressed_payload() {
        let mut assembler = MessageAssembler::new(LIMIT);
        let header = Frame::new(true, OpCode::Text, "héllo").header();
        assert_eq!(assembler.on_header(&header).unwrap(), Some(MessageKind::Text));
        let bytes = "héllo".as_bytes();
        let first = assembler.decode_chunk(Bytes::copy_from_slice(&bytes[..2])).unwrap();
        let second = assembler.decode_chunk(Bytes::copy_from_slice(&bytes[2..])).unwrap();
        assert_eq!([&first[..], &second[..]].concat(), bytes);
        assert_eq!(assembler.finish(&mut Vec::new()).unwrap(), MessageKind::Text);
    }

    #[test]
    fn test_reset_allows_new_message() {
        let mut assembler = MessageAssembler::new(LIMIT);
        assembler.push(&Frame::new(false, OpCode::Text, "partial")).unwrap();
        assembler.reset();
        assert!(assembler.push(&Frame::text("fresh")).unwrap().is_some());
    }
}
