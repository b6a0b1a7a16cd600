//! Opening handshake for both roles.
//!
//! [`Upgrader`] validates an upgrade request and takes over the hijacked
//! stream; [`ClientUpgrader`] builds the request and checks the server's
//! answer. Both can also run the whole HTTP exchange themselves on a raw
//! stream ([`Upgrader::accept`], [`ClientUpgrader::connect`]).

mod client;
mod server;

pub use client::ClientUpgrader;
pub use server::{ErrorFormatter, HandshakeResult, OriginCheck, Upgrader, default_check_origin};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::Limits;
use crate::error::{Error, Result};

/// A stream taken over from the host's HTTP server.
#[derive(Debug)]
pub struct Hijacked<T> {
    pub io: T,
    /// Bytes the host read past the end of the HTTP head.
    pub read_buf: BytesMut,
}

impl<T> Hijacked<T> {
    pub fn new(io: T) -> Self {
        Self::with_buffered(io, BytesMut::new())
    }

    pub fn with_buffered(io: T, read_buf: BytesMut) -> Self {
        Self { io, read_buf }
    }
}

/// Read until `parse` recognizes a complete HTTP head, then drop the head
/// from `buf`.
///
/// `parse` returns `None` while the head is incomplete, or the parsed head
/// and its length. Whatever follows the head stays in `buf`.
pub(crate) async fn read_head<T, H, F>(
    io: &mut T,
    buf: &mut BytesMut,
    limits: &Limits,
    mut parse: F,
) -> Result<H>
where
    T: AsyncRead + Unpin,
    F: FnMut(&[u8]) -> Result<Option<(H, usize)>>,
{
    loop {
        if let Some((head, len)) = parse(buf)? {
            limits.check_handshake_size(len)?;
            let _ = buf.split_to(len);
            return Ok(head);
        }
        limits.check_handshake_size(buf.len())?;
        buf.reserve(1024);
        if io.read_buf(buf).await? == 0 {
            return Err(Error::Io("connection closed during handshake".into()));
        }
    }
}
