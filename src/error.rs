//! Error types for the WebSocket engine.
//!
//! Errors fall into four groups:
//!
//! - handshake failures, which carry an HTTP status for the host to render;
//! - protocol failures, which are fatal to the connection and map to the
//!   close code sent to the peer (see [`Error::protocol_close_code`]);
//! - the terminal close signal ([`Error::Closed`]) once a Close frame arrived;
//! - I/O failures and deadline expiry from the underlying stream.

use http::StatusCode;
use thiserror::Error;

use crate::message::{CloseCode, CloseFrame};

/// Result type alias for WebSocket operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A rejected server-side upgrade request.
///
/// Non-fatal: the host framework is still in charge of the HTTP exchange
/// and should render this as an ordinary error response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} ({status})")]
pub struct HandshakeError {
    /// Status code to answer the upgrade request with.
    pub status: StatusCode,
    /// Human readable reason.
    pub message: String,
}

impl HandshakeError {
    pub(crate) fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

/// Errors that can occur during WebSocket operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Frame sequencing or payload rule broken by the peer.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Invalid UTF-8 in a text message or close reason.
    #[error("Invalid UTF-8 in text payload")]
    InvalidUtf8,

    /// Compressed message could not be inflated.
    #[error("Malformed compressed payload: {0}")]
    Decompression(String),

    /// Message size exceeds configured maximum.
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge {
        /// Size seen so far.
        size: u64,
        /// Maximum allowed size.
        max: usize,
    },

    /// 64-bit payload length with the most significant bit set.
    #[error("Invalid payload length: {0:#x}")]
    InvalidPayloadLength(u64),

    /// Invalid close code, received or requested.
    #[error("Invalid close code: {0}")]
    InvalidCloseCode(u16),

    /// Reserved opcode used.
    #[error("Reserved opcode: {0:#x}")]
    ReservedOpcode(u8),

    /// Control frame without FIN.
    #[error("Control frames cannot be fragmented")]
    FragmentedControlFrame,

    /// Control frame payload too large (>125 bytes).
    #[error("Control frame payload too large: {0} bytes (max: 125)")]
    ControlFrameTooLarge(usize),

    /// Unmasked frame received by a server.
    #[error("Client frame must be masked")]
    UnmaskedClientFrame,

    /// Masked frame received by a client.
    #[error("Server frame must not be masked")]
    MaskedServerFrame,

    /// Reserved bits set without a negotiated extension.
    #[error("Reserved bits set without negotiated extension")]
    ReservedBitsSet,

    /// Incomplete frame data.
    #[error("Incomplete frame: need {needed} more bytes")]
    IncompleteFrame {
        /// Number of additional bytes needed.
        needed: usize,
    },

    /// The peer sent a Close frame. Terminal for reads and writes.
    #[error("Connection closed: {0}")]
    Closed(CloseFrame),

    /// A Close frame was already sent; no further writes are accepted.
    #[error("Connection is closing")]
    Closing,

    /// Stream ended without a Close frame.
    #[error("Connection closed abnormally (no close frame)")]
    AbnormalClosure,

    /// Server rejected the upgrade request.
    #[error("Handshake rejected: {0}")]
    Handshake(#[from] HandshakeError),

    /// Client-side upgrade response did not validate.
    #[error("websocket: bad handshake")]
    BadHandshake,

    /// HTTP head exceeded the configured size.
    #[error("Handshake too large: {size} bytes (max: {max})")]
    HandshakeTooLarge {
        /// Bytes buffered so far.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Read or write deadline expired. The connection is unusable afterwards.
    #[error("Deadline exceeded")]
    Timeout,

    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Close code to send to the peer when this error terminates the
    /// connection, or `None` when it is not a protocol failure.
    ///
    /// Nothing here maps to 1003 (`CloseCode::UnsupportedData`): both text
    /// and binary messages are always accepted, and a reserved opcode is a
    /// framing error (1002). An application that rejects a message kind
    /// sends 1003 itself with [`Connection::close`](crate::Connection::close).
    #[must_use]
    pub fn protocol_close_code(&self) -> Option<CloseCode> {
        match self {
            Error::ProtocolViolation(_)
            | Error::InvalidPayloadLength(_)
            | Error::InvalidCloseCode(_)
            | Error::ReservedOpcode(_)
            | Error::FragmentedControlFrame
            | Error::ControlFrameTooLarge(_)
            | Error::UnmaskedClientFrame
            | Error::MaskedServerFrame
            | Error::ReservedBitsSet => Some(CloseCode::ProtocolError),
            Error::InvalidUtf8 | Error::Decompression(_) => Some(CloseCode::InvalidPayload),
            Error::MessageTooLarge { .. } => Some(CloseCode::MessageTooBig),
            _ => None,
        }
    }

    /// True for errors raised by a misbehaving peer.
    #[must_use]
    pub fn is_protocol_error(&self) -> bool {
        self.protocol_close_code().is_some()
    }

    /// Close code carried by the terminal close signal, if this is one.
    #[must_use]
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            Error::Closed(frame) => Some(frame.code),
            Error::AbnormalClosure => Some(CloseCode::Abnormal),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::AbnormalClosure,
            std::io::ErrorKind::TimedOut => Error::Timeout,
            _ => Error::Io(err.to_string()),
        }
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(_: std::str::Utf8Error) -> Self {
        Error::InvalidUtf8
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}
