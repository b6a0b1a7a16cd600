//! Streaming writes of one outgoing message.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::MutexGuard;

use crate::connection::connection::Connection;
use crate::error::Result;
use crate::extensions::deflate::MessageDeflater;
use crate::message::MessageKind;
use crate::protocol::{Frame, OpCode};

#[derive(Debug, Clone, Copy)]
struct OpenMessage {
    kind: MessageKind,
    /// The first frame (with the message opcode) has been sent.
    started: bool,
}

/// Write-side message state, guarded by the connection's data lock.
#[derive(Debug)]
pub(crate) struct DataWriter {
    deflater: Option<MessageDeflater>,
    pending: BytesMut,
    open: Option<OpenMessage>,
}

impl DataWriter {
    pub(crate) fn new(deflater: Option<MessageDeflater>) -> Self {
        Self {
            deflater,
            pending: BytesMut::new(),
            open: None,
        }
    }

    pub(crate) fn deflater_mut(&mut self) -> Option<&mut MessageDeflater> {
        self.deflater.as_mut()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.is_some()
    }

    pub(crate) fn begin(&mut self, kind: MessageKind) {
        self.pending.clear();
        self.open = Some(OpenMessage {
            kind,
            started: false,
        });
    }

    fn next_frame(&mut self, len: usize, fin: bool) -> Frame {
        let payload = self.pending.split_to(len).freeze();
        let compressed = self.deflater.is_some();
        match self.open.as_mut() {
            Some(open) if !open.started => {
                open.started = true;
                Frame::new(fin, open.kind.opcode(), payload).with_rsv1(compressed)
            }
            _ => Frame::new(fin, OpCode::Continuation, payload),
        }
    }
}

/// Writer for the message opened by [`Connection::next_writer`].
///
/// Bytes are buffered (and compressed, when negotiated) until a full
/// fragment is available, which is then sent as a non-final frame.
/// [`MessageWriter::close`] sends the final frame. A writer dropped without
/// `close` leaves the message open; the next writer terminates it.
pub struct MessageWriter<'a, T> {
    conn: &'a Connection<T>,
    data: MutexGuard<'a, DataWriter>,
}

impl<'a, T> MessageWriter<'a, T> {
    pub(crate) fn new(conn: &'a Connection<T>, data: MutexGuard<'a, DataWriter>) -> Self {
        Self { conn, data }
    }

    /// Kind of the message being written.
    #[must_use]
    pub fn kind(&self) -> Option<MessageKind> {
        self.data.open.map(|open| open.kind)
    }
}

impl<T: AsyncRead + AsyncWrite> MessageWriter<'_, T> {
    /// Append `chunk` to the message.
    ///
    /// # Errors
    ///
    /// `Error::Closing` once a Close was sent, or a write error. The
    /// message cannot be completed after an error.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.conn.check_writable()?;
        let data = &mut *self.data;
        match data.deflater.as_mut() {
            Some(deflater) => deflater.write(chunk, &mut data.pending)?,
            None => data.pending.extend_from_slice(chunk),
        }
        let fragment_size = self.conn.fragment_size();
        while self.data.pending.len() > fragment_size {
            let frame = self.data.next_frame(fragment_size, false);
            self.conn.send_frame(&frame).await?;
        }
        Ok(())
    }

    /// Send the final frame.
    ///
    /// # Errors
    ///
    /// As for [`MessageWriter::write`].
    pub async fn close(mut self) -> Result<()> {
        Self::finish_message(self.conn, &mut self.data).await
    }

    pub(crate) async fn finish_message(conn: &Connection<T>, data: &mut DataWriter) -> Result<()> {
        let result = Self::flush_final(conn, data).await;
        data.open = None;
        data.pending.clear();
        result
    }

    async fn flush_final(conn: &Connection<T>, data: &mut DataWriter) -> Result<()> {
        if data.open.is_none() {
            return Ok(());
        }
        if let Some(deflater) = data.deflater.as_mut() {
            deflater.finish(&mut data.pending)?;
        }
        let fragment_size = conn.fragment_size();
        while data.pending.len() > fragment_size {
            let frame = data.next_frame(fragment_size, false);
            conn.send_frame(&frame).await?;
        }
        let frame = data.next_frame(data.pending.len(), true);
        conn.send_frame(&frame).await
    }
}

impl<T> std::fmt::Debug for MessageWriter<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageWriter")
            .field("kind", &self.kind())
            .field("pending", &self.data.pending.len())
            .finish()
    }
}
