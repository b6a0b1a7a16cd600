//! permessage-deflate (RFC 7692), no-context-takeover mode only.
//!
//! Every message is compressed with a fresh raw deflate stream, finished
//! with a sync flush whose `00 00 ff ff` tail is stripped before framing.
//! The receiver puts the tail back, adds an empty final block and requires
//! the inflater to reach end of stream.

use bytes::{Bytes, BytesMut};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{Error, Result};
use crate::extensions::ExtensionOffer;

/// Extension token.
pub const PERMESSAGE_DEFLATE: &str = "permessage-deflate";

/// Value sent by a client offering compression, and by a server accepting it.
pub const NO_CONTEXT_TAKEOVER: &str =
    "permessage-deflate; server_no_context_takeover; client_no_context_takeover";

/// Tail of a sync-flushed deflate block.
pub const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Empty stored block with BFINAL set; terminates the raw stream.
const FINAL_BLOCK: [u8; 5] = [0x01, 0x00, 0x00, 0xff, 0xff];

const CHUNK: usize = 4096;
const MIN_SPARE: usize = 64;

/// Whether an offer can be served without context takeover.
///
/// Unknown or repeated parameters, valued flags, and any
/// `server_max_window_bits` other than 15 make the offer unusable.
pub fn accepts_offer(offer: &ExtensionOffer) -> bool {
    if !offer.is(PERMESSAGE_DEFLATE) {
        return false;
    }
    let mut seen: Vec<String> = Vec::with_capacity(offer.params.len());
    for param in &offer.params {
        let name = param.name.to_ascii_lowercase();
        if seen.contains(&name) {
            return false;
        }
        let ok = match name.as_str() {
            "server_no_context_takeover" | "client_no_context_takeover" => param.value.is_none(),
            "client_max_window_bits" => match param.value.as_deref() {
                None => true,
                Some(v) => matches!(v.parse::<u8>(), Ok(8..=15)),
            },
            "server_max_window_bits" => param.value.as_deref() == Some("15"),
            _ => false,
        };
        if !ok {
            return false;
        }
        seen.push(name);
    }
    true
}

/// Server side: true if any offer is acceptable.
pub fn negotiate(offers: &[ExtensionOffer]) -> bool {
    offers.iter().any(accepts_offer)
}

/// Client side: true if the server's response enabled the extension.
pub fn response_enables(responses: &[ExtensionOffer]) -> bool {
    responses.iter().any(|r| r.is(PERMESSAGE_DEFLATE))
}

/// Per-message compressor.
pub struct MessageDeflater {
    compress: Compress,
    out: Vec<u8>,
}

impl MessageDeflater {
    /// `level` is a zlib level, 0-9.
    #[must_use]
    pub fn new(level: u32) -> Self {
        Self {
            compress: Compress::new(Compression::new(level.min(9)), false),
            out: Vec::with_capacity(CHUNK),
        }
    }

    /// Compress the next chunk of the current message.
    ///
    /// Output is appended to `dst`, except for the last four bytes which
    /// are held back in case they turn out to be the stripped trailer.
    pub fn write(&mut self, input: &[u8], dst: &mut BytesMut) -> Result<()> {
        self.run(input, FlushCompress::None)?;
        if self.out.len() > DEFLATE_TRAILER.len() {
            let ready = self.out.len() - DEFLATE_TRAILER.len();
            dst.extend_from_slice(&self.out[..ready]);
            self.out.drain(..ready);
        }
        Ok(())
    }

    /// Flush the current message, strip the trailer, and reset for the next.
    pub fn finish(&mut self, dst: &mut BytesMut) -> Result<()> {
        self.run(&[], FlushCompress::Sync)?;
        if self.out.ends_with(&DEFLATE_TRAILER) {
            self.out.truncate(self.out.len() - DEFLATE_TRAILER.len());
        }
        dst.extend_from_slice(&self.out);
        self.out.clear();
        self.compress.reset();
        Ok(())
    }

    /// Compress a whole message.
    pub fn compress(&mut self, payload: &[u8]) -> Result<Bytes> {
        let mut dst = BytesMut::with_capacity(payload.len() / 2 + MIN_SPARE);
        self.write(payload, &mut dst)?;
        self.finish(&mut dst)?;
        Ok(dst.freeze())
    }

    fn run(&mut self, mut input: &[u8], flush: FlushCompress) -> Result<()> {
        loop {
            if self.out.capacity() - self.out.len() < MIN_SPARE {
                self.out.reserve(CHUNK.max(input.len() / 2));
            }
            let before = self.compress.total_in();
            self.compress
                .compress_vec(input, &mut self.out, flush)
                .map_err(|e| Error::Io(format!("deflate: {e}")))?;
            let consumed = (self.compress.total_in() - before) as usize;
            input = &input[consumed..];
            if input.is_empty() && self.out.len() < self.out.capacity() {
                return Ok(());
            }
        }
    }
}

impl std::fmt::Debug for MessageDeflater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageDeflater")
            .field("total_in", &self.compress.total_in())
            .finish()
    }
}

/// Per-message decompressor.
pub struct MessageInflater {
    decompress: Decompress,
    ended: bool,
}

impl MessageInflater {
    #[must_use]
    pub fn new() -> Self {
        Self {
            decompress: Decompress::new(false),
            ended: false,
        }
    }

    /// Bytes inflated so far for the current message.
    #[must_use]
    pub fn total_out(&self) -> u64 {
        self.decompress.total_out()
    }

    /// Inflate the next chunk of compressed message data into `dst`.
    ///
    /// # Errors
    ///
    /// `Error::Decompression` for a corrupt stream, `Error::MessageTooLarge`
    /// once the inflated message exceeds `limit`.
    pub fn write(&mut self, input: &[u8], dst: &mut Vec<u8>, limit: usize) -> Result<()> {
        if self.ended {
            if input.is_empty() {
                return Ok(());
            }
            return Err(Error::Decompression("data after end of stream".into()));
        }
        self.run(input, dst, FlushDecompress::None, limit).map(|_| ())
    }

    /// Complete the current message and reset for the next.
    ///
    /// # Errors
    ///
    /// `Error::Decompression` if the stream does not terminate cleanly.
    pub fn finish(&mut self, dst: &mut Vec<u8>, limit: usize) -> Result<()> {
        let result = if self.ended {
            Ok(())
        } else {
            let mut tail = [0u8; 9];
            tail[..4].copy_from_slice(&DEFLATE_TRAILER);
            tail[4..].copy_from_slice(&FINAL_BLOCK);
            match self.run(&tail, dst, FlushDecompress::Finish, limit) {
                Ok(Status::StreamEnd) => Ok(()),
                Ok(_) => Err(Error::Decompression(
                    "compressed stream did not terminate".into(),
                )),
                Err(e) => Err(e),
            }
        };
        self.reset();
        result
    }

    /// Inflate a whole message payload.
    pub fn decompress(&mut self, payload: &[u8], limit: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity((payload.len() * 2).min(limit).max(MIN_SPARE));
        let result = self
            .write(payload, &mut out, limit)
            .and_then(|()| self.finish(&mut out, limit));
        if result.is_err() {
            self.reset();
        }
        result.map(|()| out)
    }

    pub fn reset(&mut self) {
        self.decompress.reset(false);
        self.ended = false;
    }

    fn run(
        &mut self,
        mut input: &[u8],
        dst: &mut Vec<u8>,
        flush: FlushDecompress,
        limit: usize,
    ) -> Result<Status> {
        loop {
            if dst.capacity() - dst.len() < MIN_SPARE {
                dst.reserve(CHUNK);
            }
            let (in_before, out_before) = (self.decompress.total_in(), self.decompress.total_out());
            let status = self
                .decompress
                .decompress_vec(input, dst, flush)
                .map_err(|e| Error::Decompression(e.to_string()))?;
            let consumed = (self.decompress.total_in() - in_before) as usize;
            let produced = self.decompress.total_out() - out_before;
            input = &input[consumed..];

            if self.decompress.total_out() > limit as u64 {
                return Err(Error::MessageTooLarge {
                    size: self.decompress.total_out(),
                    max: limit,
                });
            }

            if status == Status::StreamEnd {
                self.ended = true;
                if !input.is_empty() {
                    return Err(Error::Decompression("data after end of stream".into()));
                }
                return Ok(status);
            }
            let spare = dst.len() < dst.capacity();
            if input.is_empty() && spare {
                return Ok(status);
            }
            if consumed == 0 && produced == 0 && spare {
                return Err(Error::Decompression("inflater made no progress".into()));
            }
        }
    }
}

impl Default for MessageInflater {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MessageInflater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageInflater")
            .field("total_out", &self.decompress.total_out())
            .field("ended", &self.ended)
            .finish()
    }
}
