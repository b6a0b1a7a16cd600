//! # wsconn - WebSocket protocol engine for hijacked HTTP/1.1 streams
//!
//! `wsconn` turns an upgraded byte stream into WebSocket messages and back,
//! per RFC 6455, with permessage-deflate (RFC 7692) in no-context-takeover
//! mode.
//!
//! ## Features
//!
//! - **Server and client handshakes** over a host's parsed request, or
//!   directly on a raw stream
//! - **Full duplex connections**: one task reads while another writes
//! - **Streaming messages** in both directions, with control frames
//!   interleaved between fragments
//! - **Strict validation** with the matching close code sent on failure
//! - **Resource limits** on message and handshake size, plus deadlines
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use wsconn::{Config, Upgrader};
//!
//! let upgrader = Upgrader::new(Config::server()).with_compression(true);
//! let conn = upgrader.accept(tcp_stream).await?;
//! while let Ok(msg) = conn.read_message().await {
//!     conn.write_message(msg).await?;
//! }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod deadline;
pub mod error;
pub mod extensions;
pub mod handshake;
pub mod message;
pub mod pool;
pub mod protocol;

pub use config::{Config, Limits};
pub use connection::{
    Connection, ConnectionState, Handlers, MessageReader, MessageWriter, Negotiated, Role,
};
pub use deadline::Deadlines;
pub use error::{Error, HandshakeError, Result};
pub use handshake::{ClientUpgrader, HandshakeResult, Hijacked, Upgrader};
pub use message::{CloseCode, CloseFrame, Message, MessageKind};
pub use pool::BufferPool;
pub use protocol::{OpCode, WS_GUID, compute_accept_key};

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn test_public_types_are_send() {
        assert_send::<Error>();
        assert_send::<Config>();
        assert_send::<Limits>();
        assert_send::<Message>();
        assert_send::<CloseCode>();
        assert_send::<CloseFrame>();
        assert_send::<ConnectionState>();
        assert_send::<Role>();
        assert_send::<Upgrader>();
        assert_send::<ClientUpgrader>();
        assert_send::<Connection<DuplexStream>>();
    }

    #[test]
    fn test_public_types_are_sync() {
        assert_sync::<Error>();
        assert_sync::<Config>();
        assert_sync::<Limits>();
        assert_sync::<Message>();
        assert_sync::<CloseCode>();
        assert_sync::<CloseFrame>();
        assert_sync::<ConnectionState>();
        assert_sync::<Role>();
        assert_sync::<Upgrader>();
        assert_sync::<Connection<DuplexStream>>();
    }
}
