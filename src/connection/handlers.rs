//! Control frame callbacks.
//!
//! Handlers run on the reading task, inline with the frame that triggered
//! them, so they must not block. A handler that needs to act on the
//! connection later (for example to move the read deadline) should capture
//! what it needs, such as [`Connection::deadlines`](super::Connection::deadlines).

use std::fmt;
use std::sync::Arc;

use crate::message::{CloseCode, CloseFrame};

/// Called with each Ping payload. The returned payload, if any, is sent
/// back in a Pong.
pub type PingHandler = Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

/// Called with each Pong payload.
pub type PongHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Called with the peer's close status. The returned status, if any, is
/// sent back in the closing handshake.
pub type CloseHandler = Arc<dyn Fn(&CloseFrame) -> Option<CloseFrame> + Send + Sync>;

/// The set of control frame handlers installed on a connection.
///
/// Missing handlers fall back to the protocol defaults: answer a Ping with
/// an identical Pong, ignore Pongs, echo the peer's Close.
#[derive(Clone, Default)]
pub struct Handlers {
    ping: Option<PingHandler>,
    pong: Option<PongHandler>,
    close: Option<CloseHandler>,
}

impl Handlers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_ping<F>(mut self, f: F) -> Self
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.ping = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_pong<F>(mut self, f: F) -> Self
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.pong = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&CloseFrame) -> Option<CloseFrame> + Send + Sync + 'static,
    {
        self.close = Some(Arc::new(f));
        self
    }

    pub(crate) fn set_ping(&mut self, handler: Option<PingHandler>) {
        self.ping = handler;
    }

    pub(crate) fn set_pong(&mut self, handler: Option<PongHandler>) {
        self.pong = handler;
    }

    pub(crate) fn set_close(&mut self, handler: Option<CloseHandler>) {
        self.close = handler;
    }

    pub(crate) fn ping_reply(&self, payload: &[u8]) -> Option<Vec<u8>> {
        match &self.ping {
            Some(handler) => handler(payload),
            None => Some(payload.to_vec()),
        }
    }

    pub(crate) fn pong(&self, payload: &[u8]) {
        if let Some(handler) = &self.pong {
            handler(payload);
        }
    }

    pub(crate) fn close_reply(&self, status: &CloseFrame) -> Option<CloseFrame> {
        match &self.close {
            Some(handler) => handler(status),
            None => Some(default_close_reply(status)),
        }
    }
}

/// Echo the peer's status; a Close without a status is answered with 1000.
#[must_use]
pub fn default_close_reply(status: &CloseFrame) -> CloseFrame {
    if status.code == CloseCode::NoStatusReceived {
        CloseFrame::new(CloseCode::Normal, "")
    } else {
        status.clone()
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("ping", &self.ping.is_some())
            .field("pong", &self.pong.is_some())
            .field("close", &self.close.is_some())
            .finish()
    }
}
