//! Streaming access to one incoming message.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::MutexGuard;

use crate::connection::connection::{Connection, ReadSide, Step};
use crate::error::{Error, Result};
use crate::message::MessageKind;

/// Reader for the message returned by [`Connection::next_reader`].
///
/// Holds the read side of the connection until dropped. Chunks are the
/// message bytes as they arrive, already unmasked, inflated and (for text)
/// checked to be valid UTF-8 so far. The message is complete when
/// [`MessageReader::next_chunk`] returns `None`.
pub struct MessageReader<'a, T> {
    conn: &'a Connection<T>,
    side: MutexGuard<'a, ReadSide<T>>,
    kind: MessageKind,
    done: bool,
}

impl<'a, T> MessageReader<'a, T> {
    pub(crate) fn new(
        conn: &'a Connection<T>,
        side: MutexGuard<'a, ReadSide<T>>,
        kind: MessageKind,
    ) -> Self {
        Self {
            conn,
            side,
            kind,
            done: false,
        }
    }

    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// True once the final chunk has been returned.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }
}

impl<T: AsyncRead + AsyncWrite> MessageReader<'_, T> {
    /// Next piece of the message, or `None` at its end.
    ///
    /// # Errors
    ///
    /// Any error of [`Connection::next_reader`]; the reader is finished
    /// afterwards.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        while !self.done {
            match self.conn.step(&mut self.side).await {
                Ok(Step::Data(chunk)) if chunk.is_empty() => {}
                Ok(Step::Data(chunk)) => return Ok(Some(chunk)),
                Ok(Step::Finished(tail)) => {
                    self.done = true;
                    if !tail.is_empty() {
                        return Ok(Some(tail));
                    }
                }
                Ok(Step::Started(_)) => {
                    self.done = true;
                    return Err(Error::ProtocolViolation(
                        "message started inside another".into(),
                    ));
                }
                Err(err) => {
                    self.done = true;
                    return Err(err);
                }
            }
        }
        Ok(None)
    }

    /// Collect the rest of the message.
    ///
    /// # Errors
    ///
    /// As for [`MessageReader::next_chunk`].
    pub async fn read_to_end(mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            payload.extend_from_slice(&chunk);
        }
        Ok(payload)
    }

    /// Skip the rest of the message.
    ///
    /// # Errors
    ///
    /// As for [`MessageReader::next_chunk`].
    pub async fn discard(mut self) -> Result<()> {
        while self.next_chunk().await?.is_some() {}
        Ok(())
    }
}

impl<T> std::fmt::Debug for MessageReader<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageReader")
            .field("kind", &self.kind)
            .field("done", &self.done)
            .finish()
    }
}
