//! Connection configuration and resource limits.

use std::time::Duration;

use crate::error::Error;
use crate::pool::BufferPool;

/// Default read and write buffer size.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Smallest write buffer that still holds a full frame header plus payload.
pub const MIN_WRITE_BUFFER_SIZE: usize = 256;

/// Resource limits.
///
/// These bound memory use per connection against hostile peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    /// Maximum size of a reassembled (and inflated) message.
    ///
    /// Default: 64 MB
    pub max_message_size: usize,

    /// Maximum size of an HTTP head read by the raw-stream handshakes.
    ///
    /// Default: 8 KB
    pub max_handshake_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024 * 1024,
            max_handshake_size: 8192,
        }
    }
}

impl Limits {
    #[must_use]
    pub const fn new(max_message_size: usize, max_handshake_size: usize) -> Self {
        Self {
            max_message_size,
            max_handshake_size,
        }
    }

    /// Limits for small devices: 256 KB messages, 4 KB handshakes.
    #[must_use]
    pub const fn embedded() -> Self {
        Self {
            max_message_size: 256 * 1024,
            max_handshake_size: 4096,
        }
    }

    /// # Errors
    ///
    /// [`Error::MessageTooLarge`] if `size` exceeds the configured maximum.
    pub const fn check_message_size(&self, size: u64) -> Result<(), Error> {
        if size > self.max_message_size as u64 {
            Err(Error::MessageTooLarge {
                size,
                max: self.max_message_size,
            })
        } else {
            Ok(())
        }
    }

    /// # Errors
    ///
    /// [`Error::HandshakeTooLarge`] if `size` exceeds the configured maximum.
    pub const fn check_handshake_size(&self, size: usize) -> Result<(), Error> {
        if size > self.max_handshake_size {
            Err(Error::HandshakeTooLarge {
                size,
                max: self.max_handshake_size,
            })
        } else {
            Ok(())
        }
    }
}

/// Connection configuration, shared by both roles.
///
/// Server and client specific options (subprotocols, origin policy,
/// compression offer) live on the upgraders.
#[derive(Debug, Clone)]
pub struct Config {
    pub limits: Limits,

    /// Largest payload per outgoing data frame; longer messages are fragmented.
    ///
    /// Default: 16 KB
    pub fragment_size: usize,

    /// Read buffer size. `0` reuses the buffer handed over by the host
    /// together with the hijacked stream.
    ///
    /// Default: 8 KB
    pub read_buffer_size: usize,

    /// Write buffer size. `0` selects the default.
    ///
    /// Default: 8 KB
    pub write_buffer_size: usize,

    /// Pool to borrow the write buffer from.
    pub write_buffer_pool: Option<BufferPool>,

    /// Bound on the handshake exchange on the raw stream.
    ///
    /// Default: none
    pub handshake_timeout: Option<Duration>,

    /// zlib level (0-9) used when permessage-deflate is negotiated.
    ///
    /// Default: 6
    pub compression_level: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            fragment_size: 16 * 1024,
            read_buffer_size: DEFAULT_BUFFER_SIZE,
            write_buffer_size: DEFAULT_BUFFER_SIZE,
            write_buffer_pool: None,
            handshake_timeout: None,
            compression_level: 6,
        }
    }
}

impl Config {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults for accepting connections: 30 second handshake timeout.
    #[must_use]
    pub fn server() -> Self {
        Self::default().with_handshake_timeout(Duration::from_secs(30))
    }

    /// Defaults for outgoing connections.
    #[must_use]
    pub fn client() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    #[must_use]
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.limits.max_message_size = size;
        self
    }

    #[must_use]
    pub fn with_fragment_size(mut self, size: usize) -> Self {
        self.fragment_size = size.max(1);
        self
    }

    #[must_use]
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    #[must_use]
    pub fn with_write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    #[must_use]
    pub fn with_write_buffer_pool(mut self, pool: BufferPool) -> Self {
        self.write_buffer_pool = Some(pool);
        self
    }

    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression_level = level.min(9);
        self
    }

    /// Write buffer size after applying the default and the minimum.
    #[must_use]
    pub fn effective_write_buffer_size(&self) -> usize {
        match self.write_buffer_size {
            0 => DEFAULT_BUFFER_SIZE,
            n => n.max(MIN_WRITE_BUFFER_SIZE),
        }
    }
}
