//! Splits a whole outgoing message payload into frames.

use bytes::Bytes;

use crate::message::MessageKind;
use crate::protocol::{Frame, OpCode};

/// Iterator over the frames of one message.
///
/// The first frame carries the message opcode (and RSV1 when the payload is
/// compressed); the rest are continuations. An empty payload still yields
/// one final frame. Slices share the payload buffer.
pub struct MessageFragmenter {
    payload: Bytes,
    kind: MessageKind,
    compressed: bool,
    fragment_size: usize,
    first: bool,
    done: bool,
}

impl MessageFragmenter {
    #[must_use]
    pub fn new(payload: Bytes, kind: MessageKind, fragment_size: usize) -> Self {
        Self {
            payload,
            kind,
            compressed: false,
            fragment_size: fragment_size.max(1),
            first: true,
            done: false,
        }
    }

    /// Mark the payload as deflated; sets RSV1 on the first frame.
    #[must_use]
    pub fn compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.payload.len()
    }
}

impl Iterator for MessageFragmenter {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        if self.done {
            return None;
        }
        let take = self.payload.len().min(self.fragment_size);
        let chunk = self.payload.split_to(take);
        let fin = self.payload.is_empty();
        self.done = fin;

        let frame = if self.first {
            self.first = false;
            Frame::new(fin, self.kind.opcode(), chunk).with_rsv1(self.compressed)
        } else {
            Frame::new(fin, OpCode::Continuation, chunk)
        };
        Some(frame)
    }
}
