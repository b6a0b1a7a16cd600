//! Payload masking (RFC 6455 Section 5.3).
//!
//! Masking is an XOR with a repeating four byte key, so the same call
//! both masks and unmasks.

use std::fmt;

use crate::error::{Error, Result};

/// Byte-by-byte XOR of `data` with `key`, starting at key offset 0.
#[inline]
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// XOR `data` with `key`, starting at key offset `pos`.
///
/// Returns the key offset for the byte following `data`, so a payload can be
/// masked in pieces as it streams through a fixed-size buffer.
#[inline]
pub fn apply_mask_at(data: &mut [u8], key: [u8; 4], pos: usize) -> usize {
    let pos = pos & 3;
    let rotated = [
        key[pos],
        key[(pos + 1) & 3],
        key[(pos + 2) & 3],
        key[(pos + 3) & 3],
    ];
    let word = u32::from_ne_bytes(rotated);

    let mut chunks = data.chunks_exact_mut(4);
    for chunk in &mut chunks {
        let val = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) ^ word;
        chunk.copy_from_slice(&val.to_ne_bytes());
    }
    let tail = chunks.into_remainder();
    for (i, byte) in tail.iter_mut().enumerate() {
        *byte ^= rotated[i];
    }

    (pos + data.len()) & 3
}

/// Keys drawn from one call to the OS RNG.
const KEYS_PER_REFILL: usize = 64;

/// Source of client masking keys.
///
/// Every key is read from the OS RNG. Keys are fetched in batches and each
/// one is handed out once, so no key depends on an earlier one.
#[derive(Clone)]
pub struct MaskGenerator {
    batch: [u8; KEYS_PER_REFILL * 4],
    next: usize,
}

impl MaskGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            batch: [0; KEYS_PER_REFILL * 4],
            next: KEYS_PER_REFILL,
        }
    }

    /// Next masking key.
    ///
    /// # Errors
    ///
    /// `Error::Io` if the OS RNG is unavailable.
    pub fn next_key(&mut self) -> Result<[u8; 4]> {
        if self.next == KEYS_PER_REFILL {
            getrandom::getrandom(&mut self.batch)
                .map_err(|e| Error::Io(format!("random source: {e}")))?;
            self.next = 0;
        }
        let at = self.next * 4;
        self.next += 1;
        let key = [
            self.batch[at],
            self.batch[at + 1],
            self.batch[at + 2],
            self.batch[at + 3],
        ];
        self.batch[at..at + 4].fill(0);
        Ok(key)
    }
}

impl fmt::Debug for MaskGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaskGenerator")
            .field("remaining", &(KEYS_PER_REFILL - self.next))
            .finish_non_exhaustive()
    }
}

impl Default for MaskGenerator {
    fn default() -> Self {
        Self::new()
    }
}
