//! Absolute read/write deadlines.
//!
//! A deadline bounds every I/O call made in one direction until it is
//! changed or cleared. Handlers hold an `Arc<Deadlines>` so that a pong
//! handler can push the read deadline forward.

use std::future::Future;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct Deadlines {
    read: Mutex<Option<Instant>>,
    write: Mutex<Option<Instant>>,
}

impl Deadlines {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set both deadlines. `None` clears them.
    pub fn set(&self, at: Option<Instant>) {
        self.set_read(at);
        self.set_write(at);
    }

    pub fn set_read(&self, at: Option<Instant>) {
        *self.read.lock() = at;
    }

    pub fn set_write(&self, at: Option<Instant>) {
        *self.write.lock() = at;
    }

    #[must_use]
    pub fn read(&self) -> Option<Instant> {
        *self.read.lock()
    }

    #[must_use]
    pub fn write(&self) -> Option<Instant> {
        *self.write.lock()
    }
}

/// Run an I/O future, failing with `Error::Timeout` once `deadline` passes.
pub(crate) async fn with_deadline<F, T>(deadline: Option<Instant>, io: F) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match deadline {
        Some(at) => Ok(tokio::time::timeout_at(at, io).await??),
        None => Ok(io.await?),
    }
}

/// Like [`with_deadline`] but for a relative timeout on a crate future.
pub(crate) async fn with_timeout<F, T>(timeout: Option<std::time::Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(Error::from)?,
        None => fut.await,
    }
}
