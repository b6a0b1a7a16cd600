//! Incremental UTF-8 validation for text messages.
//!
//! Text messages arrive in fragments (and, when compressed, in inflated
//! chunks) whose boundaries can split a multi-byte sequence, so the tail of
//! one chunk is carried into the next.

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct Utf8Validator {
    pending: [u8; 4],
    pending_len: usize,
}

impl Utf8Validator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the next chunk of a message.
    ///
    /// A multi-byte sequence cut off at the end of `data` is kept for the
    /// next call.
    ///
    /// # Errors
    ///
    /// `Error::InvalidUtf8` as soon as an invalid sequence is seen.
    pub fn feed(&mut self, mut data: &[u8]) -> Result<()> {
        while self.pending_len > 0 {
            let Some((&byte, rest)) = data.split_first() else {
                return Ok(());
            };
            data = rest;
            self.pending[self.pending_len] = byte;
            self.pending_len += 1;
            match std::str::from_utf8(&self.pending[..self.pending_len]) {
                Ok(_) => self.pending_len = 0,
                Err(e) if e.error_len().is_none() && self.pending_len < 4 => {}
                Err(_) => return Err(self.fail()),
            }
        }

        match std::str::from_utf8(data) {
            Ok(_) => Ok(()),
            Err(e) if e.error_len().is_none() => {
                let tail = &data[e.valid_up_to()..];
                self.pending[..tail.len()].copy_from_slice(tail);
                self.pending_len = tail.len();
                Ok(())
            }
            Err(_) => Err(self.fail()),
        }
    }

    /// Declare the message complete.
    ///
    /// # Errors
    ///
    /// `Error::InvalidUtf8` if a sequence is still incomplete.
    pub fn finish(&mut self) -> Result<()> {
        if self.pending_len > 0 {
            return Err(self.fail());
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        self.pending_len = 0;
    }

    fn fail(&mut self) -> Error {
        self.reset();
        Error::InvalidUtf8
    }
}

/// Validate a complete payload.
///
/// # Errors
///
/// `Error::InvalidUtf8` if the data is not valid UTF-8.
pub fn validate_utf8(data: &[u8]) -> Result<()> {
    std::str::from_utf8(data)
        .map(|_| ())
        .map_err(|_| Error::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_split(data: &[u8], cuts: &[usize]) -> Result<()> {
        let mut v = Utf8Validator::new();
        let mut start = 0;
        for &cut in cuts {
            v.feed(&data[start..cut])?;
            start = cut;
        }
        v.feed(&data[start..])?;
        v.finish()
    }

    #[test]
    fn test_ascii_and_multibyte() {
        assert!(feed_split(b"hello", &[]).is_ok());
        assert!(feed_split("héllo wörld".as_bytes(), &[]).is_ok());
        assert!(feed_split("日本語".as_bytes(), &[]).is_ok());
        assert!(feed_split("🦀".as_bytes(), &[]).is_ok());
    }

    #[test]
    fn test_sequence_split_across_chunks() {
        let crab = "a🦀b".as_bytes();
        for cut in 1..crab.len() {
            assert!(feed_split(crab, &[cut]).is_ok(), "cut at {cut}");
        }
        // One byte per chunk.
        let cuts: Vec<usize> = (1..crab.len()).collect();
        assert!(feed_split(crab, &cuts).is_ok());
    }

    #[test]
    fn test_invalid_sequences() {
        assert_eq!(feed_split(&[0xFF], &[]), Err(Error::InvalidUtf8));
        assert_eq!(feed_split(&[0xC0, 0x80], &[]), Err(Error::InvalidUtf8));
        // Surrogate half.
        assert_eq!(feed_split(&[0xED, 0xA0, 0x80], &[1]), Err(Error::InvalidUtf8));
        // Continuation byte breaks a carried sequence.
        assert_eq!(feed_split(&[0xE6, 0x41, 0x41], &[1]), Err(Error::InvalidUtf8));
    }

    #[test]
    fn test_truncated_at_end() {
        let crab = "🦀".as_bytes();
        let mut v = Utf8Validator::new();
        v.feed(&crab[..2]).unwrap();
        assert_eq!(v.finish(), Err(Error::InvalidUtf8));
        // Validator is reusable after failure.
        v.feed(b"ok").unwrap();
        assert!(v.finish().is_ok());
    }

    #[test]
    fn test_validate_utf8() {
        assert!(validate_utf8(b"plain").is_ok());
        assert_eq!(validate_utf8(&[0x80]), Err(Error::InvalidUtf8));
    }
}
