use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, trace, warn};

use crate::codec::{FrameReader, FrameWriter};
use crate::config::{Config, DEFAULT_BUFFER_SIZE};
use crate::connection::fragmenter::MessageFragmenter;
use crate::connection::handlers::{CloseHandler, Handlers, PingHandler, PongHandler};
use crate::connection::reader::MessageReader;
use crate::connection::writer::{DataWriter, MessageWriter};
use crate::connection::{ConnectionState, Role};
use crate::deadline::Deadlines;
use crate::error::{Error, Result};
use crate::extensions::deflate::MessageDeflater;
use crate::message::{CloseCode, CloseFrame, Message, MessageKind};
use crate::pool::PooledBuffer;
use crate::protocol::assembler::MessageAssembler;
use crate::protocol::frame::{Frame, FrameHeader, MAX_CONTROL_FRAME_PAYLOAD};
use crate::protocol::validation::FrameValidator;
use crate::protocol::OpCode;

/// Outcome of the handshake that a connection is built with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Negotiated {
    /// Selected subprotocol, if any.
    pub subprotocol: Option<String>,
    /// Whether permessage-deflate is in effect.
    pub compression: bool,
}

pub(crate) struct ReadSide<T> {
    pub(crate) frames: FrameReader<ReadHalf<T>>,
    pub(crate) assembler: MessageAssembler,
    /// Payload of a data frame is being read.
    in_frame: bool,
    /// That data frame ends its message.
    frame_fin: bool,
}

/// One decoding step inside the read loop.
pub(crate) enum Step {
    Started(MessageKind),
    Data(Bytes),
    Finished(Bytes),
}

#[derive(Debug, Default)]
struct Shared {
    close_sent: bool,
    close_received: Option<CloseFrame>,
    failure: Option<Error>,
    closed: bool,
}

/// A WebSocket connection over an upgraded byte stream.
///
/// All methods take `&self`: the read and write directions can be driven
/// from two tasks at once (full duplex). Calls on the same direction are
/// serialized by an internal lock, so a second [`Connection::next_reader`]
/// waits until the first [`MessageReader`] is dropped, and a second
/// [`Connection::next_writer`] waits for the first [`MessageWriter`].
/// Control frames (`ping`, `pong`, `close`) may be written while a
/// streaming message is open; they go out between its frames.
///
/// Once a protocol error, I/O error or deadline expiry has been returned,
/// every later call fails with the same error.
///
/// ## Example
///
/// ```rust,ignore
/// use wsconn::{Connection, Config, Message, Role};
///
/// let conn = Connection::new(stream, Role::Server, Config::server());
/// while let Ok(msg) = conn.read_message().await {
///     conn.write_message(msg).await?;
/// }
/// ```
pub struct Connection<T> {
    read: AsyncMutex<ReadSide<T>>,
    write: AsyncMutex<FrameWriter<WriteHalf<T>>>,
    data: AsyncMutex<DataWriter>,
    shared: parking_lot::Mutex<Shared>,
    handlers: parking_lot::Mutex<Handlers>,
    deadlines: Arc<Deadlines>,
    role: Role,
    negotiated: Negotiated,
    fragment_size: usize,
}

impl<T: AsyncRead + AsyncWrite> Connection<T> {
    /// Wrap a stream on which the handshake has already completed, without
    /// subprotocol or compression.
    pub fn new(io: T, role: Role, config: Config) -> Self {
        Self::from_parts(io, role, &config, Negotiated::default(), BytesMut::new())
    }

    /// Build a connection from a hijacked stream.
    ///
    /// `read_buf` holds bytes that were read past the end of the handshake.
    /// With `read_buffer_size == 0` it also becomes the connection's read
    /// buffer.
    pub fn from_parts(
        io: T,
        role: Role,
        config: &Config,
        negotiated: Negotiated,
        read_buf: BytesMut,
    ) -> Self {
        let (reader, writer) = tokio::io::split(io);
        let deadlines = Arc::new(Deadlines::new());

        let (read_buf, read_size) = match config.read_buffer_size {
            0 => {
                let size = match read_buf.capacity() {
                    0 => DEFAULT_BUFFER_SIZE,
                    n => n,
                };
                (read_buf, size)
            }
            size => {
                let mut buf = BytesMut::with_capacity(size.max(read_buf.len()));
                buf.extend_from_slice(&read_buf);
                (buf, size)
            }
        };

        let write_size = config.effective_write_buffer_size();
        let write_buf = match &config.write_buffer_pool {
            Some(pool) => pool.acquire(write_size),
            None => PooledBuffer::unpooled(write_size),
        };

        let validator = FrameValidator::new(role).with_compression(negotiated.compression);
        let frames = FrameReader::new(reader, read_buf, read_size, validator, Arc::clone(&deadlines));
        let deflater = negotiated
            .compression
            .then(|| MessageDeflater::new(config.compression_level));

        debug!(
            %role,
            subprotocol = negotiated.subprotocol.as_deref().unwrap_or(""),
            compression = negotiated.compression,
            "websocket connection established"
        );

        Self {
            read: AsyncMutex::new(ReadSide {
                frames,
                assembler: MessageAssembler::new(config.limits.max_message_size),
                in_frame: false,
                frame_fin: false,
            }),
            write: AsyncMutex::new(FrameWriter::new(
                writer,
                write_buf,
                role,
                Arc::clone(&deadlines),
            )),
            data: AsyncMutex::new(DataWriter::new(deflater)),
            shared: parking_lot::Mutex::new(Shared::default()),
            handlers: parking_lot::Mutex::new(Handlers::default()),
            deadlines,
            role,
            negotiated,
            fragment_size: config.fragment_size.max(1),
        }
    }
}

impl<T> Connection<T> {
    /// Replace all control frame handlers.
    #[must_use]
    pub fn with_handlers(self, handlers: Handlers) -> Self {
        *self.handlers.lock() = handlers;
        self
    }

    /// Install a Ping handler; `None` restores the automatic Pong.
    pub fn set_ping_handler(&self, handler: Option<PingHandler>) {
        self.handlers.lock().set_ping(handler);
    }

    /// Install a Pong handler; `None` ignores Pongs.
    pub fn set_pong_handler(&self, handler: Option<PongHandler>) {
        self.handlers.lock().set_pong(handler);
    }

    /// Install a Close handler; `None` restores echoing the peer's status.
    pub fn set_close_handler(&self, handler: Option<CloseHandler>) {
        self.handlers.lock().set_close(handler);
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Negotiated subprotocol.
    #[must_use]
    pub fn subprotocol(&self) -> Option<&str> {
        self.negotiated.subprotocol.as_deref()
    }

    /// Whether permessage-deflate is in effect.
    #[must_use]
    pub fn compression(&self) -> bool {
        self.negotiated.compression
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        let shared = self.shared.lock();
        if shared.closed || shared.failure.is_some() {
            return ConnectionState::Closed;
        }
        match (shared.close_sent, shared.close_received.is_some()) {
            (false, false) => ConnectionState::Open,
            (true, false) => ConnectionState::CloseSent,
            (false, true) => ConnectionState::CloseReceived,
            (true, true) => ConnectionState::Closed,
        }
    }

    /// Deadlines shared with the reader and writer.
    #[must_use]
    pub fn deadlines(&self) -> Arc<Deadlines> {
        Arc::clone(&self.deadlines)
    }

    /// Set both the read and the write deadline. `None` clears them.
    pub fn set_deadline(&self, at: Option<tokio::time::Instant>) {
        self.deadlines.set(at);
    }

    pub fn set_read_deadline(&self, at: Option<tokio::time::Instant>) {
        self.deadlines.set_read(at);
    }

    pub fn set_write_deadline(&self, at: Option<tokio::time::Instant>) {
        self.deadlines.set_write(at);
    }

    pub(crate) fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    fn check_readable(&self) -> Result<()> {
        let shared = self.shared.lock();
        if let Some(err) = &shared.failure {
            return Err(err.clone());
        }
        if let Some(status) = &shared.close_received {
            return Err(Error::Closed(status.clone()));
        }
        Ok(())
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        let shared = self.shared.lock();
        if let Some(err) = &shared.failure {
            return Err(err.clone());
        }
        if let Some(status) = &shared.close_received {
            return Err(Error::Closed(status.clone()));
        }
        if shared.close_sent || shared.closed {
            return Err(Error::Closing);
        }
        Ok(())
    }

    /// Remember `err` as the reason the connection is unusable.
    fn record(&self, err: Error) -> Error {
        if !matches!(err, Error::Closed(_) | Error::Closing) {
            self.shared.lock().failure.get_or_insert_with(|| err.clone());
        }
        err
    }
}

impl<T: AsyncRead + AsyncWrite> Connection<T> {
    /// Wait for the next data message and return a reader positioned at its
    /// first byte.
    ///
    /// Control frames that arrive first are handled on the way. If the
    /// previous message was not read to the end, its rest is discarded.
    ///
    /// # Errors
    ///
    /// `Error::Closed` once the peer's Close has arrived, protocol errors
    /// (after a best-effort Close with the matching code was sent), I/O
    /// errors and `Error::Timeout`.
    pub async fn next_reader(&self) -> Result<MessageReader<'_, T>> {
        self.check_readable()?;
        let mut side = self.read.lock().await;
        self.check_readable()?;

        while side.assembler.is_assembling() {
            if let Step::Finished(_) = self.step(&mut side).await? {
                break;
            }
        }
        loop {
            if let Step::Started(kind) = self.step(&mut side).await? {
                return Ok(MessageReader::new(self, side, kind));
            }
        }
    }

    /// Read the next data message into memory.
    ///
    /// # Errors
    ///
    /// As for [`Connection::next_reader`].
    pub async fn read_message(&self) -> Result<Message> {
        let reader = self.next_reader().await?;
        let kind = reader.kind();
        let payload = reader.read_to_end().await?;
        Message::from_parts(kind, payload)
    }

    /// Advance the read state machine by one event, failing the connection
    /// on error.
    pub(crate) async fn step(&self, side: &mut ReadSide<T>) -> Result<Step> {
        match self.try_step(side).await {
            Ok(step) => Ok(step),
            Err(err) => {
                side.assembler.reset();
                side.in_frame = false;
                Err(self.fail(err).await)
            }
        }
    }

    async fn try_step(&self, side: &mut ReadSide<T>) -> Result<Step> {
        loop {
            if side.in_frame {
                if let Some(chunk) = side.frames.read_payload_chunk().await? {
                    return side.assembler.decode_chunk(chunk).map(Step::Data);
                }
                side.in_frame = false;
                if side.frame_fin {
                    let mut tail = Vec::new();
                    side.assembler.finish(&mut tail)?;
                    return Ok(Step::Finished(Bytes::from(tail)));
                }
                continue;
            }

            let header = side.frames.read_header().await?;
            if header.opcode.is_control() {
                self.handle_control(side, &header).await?;
                continue;
            }
            let started = side.assembler.on_header(&header)?;
            side.in_frame = true;
            side.frame_fin = header.fin;
            if let Some(kind) = started {
                return Ok(Step::Started(kind));
            }
        }
    }

    async fn handle_control(&self, side: &mut ReadSide<T>, header: &FrameHeader) -> Result<()> {
        let payload = side.frames.read_payload().await?;
        let handlers = self.handlers.lock().clone();
        match header.opcode {
            OpCode::Ping => {
                trace!(len = payload.len(), "ping received");
                if let Some(reply) = handlers.ping_reply(&payload) {
                    match self.pong(reply).await {
                        Ok(()) | Err(Error::Closing) => {}
                        Err(err) => return Err(err),
                    }
                }
                Ok(())
            }
            OpCode::Pong => {
                trace!(len = payload.len(), "pong received");
                handlers.pong(&payload);
                Ok(())
            }
            OpCode::Close => {
                let status = CloseFrame::parse(&payload)?;
                let already_sent = {
                    let mut shared = self.shared.lock();
                    shared.close_received = Some(status.clone());
                    shared.close_sent
                };
                debug!(code = status.code.as_u16(), reason = %status.reason, "close received");
                let reply = if already_sent {
                    None
                } else {
                    handlers.close_reply(&status)
                };
                let mut writer = self.write.lock().await;
                // A local close may have gone out while we waited for the writer.
                let reply = {
                    let mut shared = self.shared.lock();
                    let reply = reply.filter(|_| !shared.close_sent);
                    shared.close_sent |= reply.is_some();
                    reply
                };
                if let Some(reply) = reply {
                    if let Err(err) = writer.write_frame(&Frame::close(Some(&reply))).await {
                        debug!(error = %err, "failed to answer close");
                    }
                }
                if self.shared.lock().close_sent {
                    let _ = writer.shutdown().await;
                    self.shared.lock().closed = true;
                }
                Err(Error::Closed(status))
            }
            other => Err(Error::ProtocolViolation(format!(
                "unexpected {} control frame",
                other.name()
            ))),
        }
    }

    /// Tear down after an error: send a best-effort Close for protocol
    /// errors, then remember the error.
    async fn fail(&self, err: Error) -> Error {
        if let Error::Closed(_) = err {
            return err;
        }
        if let Some(code) = err.protocol_close_code() {
            warn!(error = %err, code = code.as_u16(), "protocol error, closing connection");
            let mut writer = self.write.lock().await;
            let send = {
                let mut shared = self.shared.lock();
                let send = !shared.close_sent && shared.failure.is_none();
                shared.close_sent = true;
                send
            };
            if send {
                let _ = writer
                    .write_frame(&Frame::close(Some(&CloseFrame::new(code, ""))))
                    .await;
            }
            let _ = writer.shutdown().await;
            self.shared.lock().closed = true;
        } else {
            debug!(error = %err, "connection failed");
        }
        self.record(err)
    }

    /// Write one frame under the write lock, checking state first.
    pub(crate) async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let result = {
            let mut writer = self.write.lock().await;
            self.check_writable()?;
            writer.write_frame(frame).await
        };
        result.map_err(|err| self.record(err))
    }

    async fn send_control(&self, opcode: OpCode, payload: Vec<u8>) -> Result<()> {
        if payload.len() > MAX_CONTROL_FRAME_PAYLOAD {
            return Err(Error::ControlFrameTooLarge(payload.len()));
        }
        self.send_frame(&Frame::new(true, opcode, payload)).await
    }

    /// Send a Ping.
    ///
    /// # Errors
    ///
    /// `Error::ControlFrameTooLarge` for payloads over 125 bytes,
    /// `Error::Closing` after a Close was sent, or a write error.
    pub async fn ping(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.send_control(OpCode::Ping, payload.into()).await
    }

    /// Send an unsolicited Pong.
    ///
    /// # Errors
    ///
    /// As for [`Connection::ping`].
    pub async fn pong(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.send_control(OpCode::Pong, payload.into()).await
    }

    /// Start the closing handshake.
    ///
    /// Reading should continue until `Error::Closed` reports the peer's
    /// answer; the stream is shut down then.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidCloseCode` for codes that may not be sent (1005, 1006, ...)
    /// - `Error::ControlFrameTooLarge` for reasons over 123 bytes
    /// - `Error::Closing` if a Close was already sent
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<()> {
        let status = CloseFrame::new(code, reason);
        status.validate()?;

        let mut writer = self.write.lock().await;
        let peer_closed = {
            let mut shared = self.shared.lock();
            if let Some(err) = &shared.failure {
                return Err(err.clone());
            }
            if shared.close_sent {
                return Err(Error::Closing);
            }
            shared.close_sent = true;
            shared.close_received.is_some()
        };
        debug!(code = code.as_u16(), reason, "sending close");
        let result = writer.write_frame(&Frame::close(Some(&status))).await;
        if peer_closed {
            let _ = writer.shutdown().await;
            self.shared.lock().closed = true;
        }
        result.map_err(|err| self.record(err))
    }

    /// Shut down the write half of the stream without a closing handshake.
    ///
    /// # Errors
    ///
    /// I/O errors from the shutdown.
    pub async fn shutdown(&self) -> Result<()> {
        let mut writer = self.write.lock().await;
        self.shared.lock().closed = true;
        writer.shutdown().await
    }

    /// Open a streaming writer for a message of `kind`.
    ///
    /// If a previous writer was dropped without [`MessageWriter::close`],
    /// its message is terminated first.
    ///
    /// # Errors
    ///
    /// `Error::Closing` after a Close was sent, or the error that made the
    /// connection unusable.
    pub async fn next_writer(&self, kind: MessageKind) -> Result<MessageWriter<'_, T>> {
        let mut data = self.data.lock().await;
        self.terminate_abandoned(&mut data).await?;
        self.check_writable()?;
        data.begin(kind);
        Ok(MessageWriter::new(self, data))
    }

    /// Write a whole message, compressing and fragmenting as configured.
    ///
    /// # Errors
    ///
    /// As for [`Connection::next_writer`], plus write errors.
    pub async fn write_message(&self, message: impl Into<Message>) -> Result<()> {
        let message = message.into();
        let kind = message.kind();
        let mut data = self.data.lock().await;
        self.terminate_abandoned(&mut data).await?;
        self.check_writable()?;

        let (payload, compressed) = match data.deflater_mut() {
            Some(deflater) => (
                deflater.compress(message.as_bytes()).map_err(|e| self.record(e))?,
                true,
            ),
            None => (Bytes::from(message.into_payload()), false),
        };
        trace!(?kind, len = payload.len(), compressed, "writing message");
        for frame in MessageFragmenter::new(payload, kind, self.fragment_size).compressed(compressed) {
            self.send_frame(&frame).await?;
        }
        Ok(())
    }

    async fn terminate_abandoned(&self, data: &mut DataWriter) -> Result<()> {
        if data.is_open() {
            debug!("terminating abandoned message");
            MessageWriter::finish_message(self, data).await?;
        }
        Ok(())
    }
}

impl<T> std::fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.role)
            .field("state", &self.state())
            .field("subprotocol", &self.negotiated.subprotocol)
            .field("compression", &self.negotiated.compression)
            .finish()
    }
}
