//! Close handshake state (RFC 6455 Section 7).

use std::fmt;

/// Lifecycle of an upgraded connection.
///
/// ```text
///          write_close              peer Close
///   Open ──────────────▶ CloseSent ────────────▶ Closed
///     │
///     │ peer Close (reply sent)
///     ▼
///   CloseReceived
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Messages flow in both directions.
    #[default]
    Open,
    /// We sent Close and are waiting for the peer's.
    CloseSent,
    /// The peer sent Close first.
    CloseReceived,
    /// Both Close frames were exchanged, or the connection failed.
    Closed,
}

impl ConnectionState {
    /// Data and control frames may still be written.
    #[must_use]
    #[inline]
    pub const fn can_send(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    /// Frames may still arrive from the peer.
    #[must_use]
    #[inline]
    pub const fn can_receive(&self) -> bool {
        matches!(self, ConnectionState::Open | ConnectionState::CloseSent)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Open => "open",
            ConnectionState::CloseSent => "close-sent",
            ConnectionState::CloseReceived => "close-received",
            ConnectionState::Closed => "closed",
        })
    }
}
