//! WebSocket connection over an upgraded stream.
//!
//! A [`Connection`] owns both halves of the stream after the handshake. It
//! reads data messages whole ([`Connection::read_message`]) or as a stream
//! of chunks ([`Connection::next_reader`]), writes them the same two ways,
//! answers control frames through its [`Handlers`], and runs the closing
//! handshake.
//!
//! ## Lifecycle
//!
//! 1. **Open** after the handshake
//! 2. **CloseSent** or **CloseReceived** once one side has sent a Close
//! 3. **Closed** when both Close frames were exchanged, or after a failure
//!
//! ## Example
//!
//! ```rust,ignore
//! use wsconn::{CloseCode, Config, Connection, Message, Role};
//!
//! let conn = Connection::new(stream, Role::Client, Config::client());
//! conn.write_message("Hello").await?;
//! let reply = conn.read_message().await?;
//! conn.close(CloseCode::Normal, "done").await?;
//! ```

#[allow(clippy::module_inception)]
mod connection;
mod fragmenter;
mod handlers;
mod reader;
mod role;
mod state;
mod writer;

pub use connection::{Connection, Negotiated};
pub use fragmenter::MessageFragmenter;
pub use handlers::{default_close_reply, CloseHandler, Handlers, PingHandler, PongHandler};
pub use reader::MessageReader;
pub use role::Role;
pub use state::ConnectionState;
pub use writer::MessageWriter;
