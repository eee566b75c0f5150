//! Live WebSocket connections.
//!
//! Each connection is owned by a single task (the actor) that reads frames
//! from the transport and serves commands sent through cloned
//! [`WebSocketHandle`]s. Complete incoming messages are handed to a second
//! task that runs the message callback, so a callback may send on its own
//! connection without blocking the reader.
//!
//! Teardown runs in a fixed order once the read loop exits: the status
//! becomes `Closed`, pending commands are refused, the dispatch and manager
//! tasks are joined, the close callback runs, and finally the connection
//! leaves the registry.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::WebSocketConfig;
use crate::error::{CloseCode, WsError, WsResult};
use crate::extension::ExtensionSet;
use crate::frame::{fragment, generate_mask, Frame, FrameCodec, OpCode, Role, MAX_CONTROL_PAYLOAD};
use crate::message::{CloseFrame, Message};
use crate::registry::{ConnectionSlot, Registration};
use crate::upgrade::Callbacks;

/// Unique identifier for a connection.
pub type ConnectionId = Uuid;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Frames flow both ways.
    Open,
    /// A close frame has been sent or received; no more data is sent.
    Closing,
    /// The read loop has exited.
    Closed,
}

enum Command {
    Send {
        opcode: OpCode,
        payload: Bytes,
        fragment_size: usize,
        ack: oneshot::Sender<WsResult<()>>,
    },
    Close {
        payload: Bytes,
        ack: oneshot::Sender<WsResult<()>>,
    },
}

impl Command {
    fn refuse(self) {
        let ack = match self {
            Self::Send { ack, .. } | Self::Close { ack, .. } => ack,
        };
        let _ = ack.send(Err(WsError::connection_closed(None, "connection closed")));
    }
}

struct Shared {
    id: ConnectionId,
    role: Role,
    protocol: Option<String>,
    extensions: Vec<String>,
    config: WebSocketConfig,
    status: watch::Sender<ConnectionStatus>,
    incoming: Mutex<VecDeque<Message>>,
    outgoing: Mutex<VecDeque<Message>>,
}

impl Shared {
    fn archive_incoming(&self, message: Message) {
        if self.config.keep_incoming {
            self.incoming.lock().push_back(message);
        }
    }

    fn archive_outgoing(&self, message: Message) {
        if self.config.keep_outgoing {
            self.outgoing.lock().push_back(message);
        }
    }

    fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
    }
}

/// A cloneable handle to a live connection.
#[derive(Clone)]
pub struct WebSocketHandle {
    shared: Arc<Shared>,
    commands: mpsc::Sender<Command>,
}

impl fmt::Debug for WebSocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketHandle")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .field("status", &self.shared.status())
            .finish()
    }
}

impl WebSocketHandle {
    /// Returns the connection ID.
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Returns whether this end is the server or the client.
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Returns the negotiated sub-protocol.
    pub fn protocol(&self) -> Option<&str> {
        self.shared.protocol.as_deref()
    }

    /// Returns the names of the negotiated extensions.
    pub fn extensions(&self) -> &[String] {
        &self.shared.extensions
    }

    /// Returns the current status.
    pub fn status(&self) -> ConnectionStatus {
        self.shared.status()
    }

    /// Returns true while data can be sent.
    pub fn is_open(&self) -> bool {
        self.status() == ConnectionStatus::Open
    }

    async fn request(&self, build: impl FnOnce(oneshot::Sender<WsResult<()>>) -> Command) -> WsResult<()> {
        if !self.is_open() {
            return Err(WsError::connection_closed(None, "connection is not open"));
        }
        let (ack, done) = oneshot::channel();
        self.commands
            .send(build(ack))
            .await
            .map_err(|_| WsError::connection_closed(None, "connection closed"))?;
        done.await
            .map_err(|_| WsError::connection_closed(None, "connection closed"))?
    }

    /// Queues a normal close without waiting for it. Used on a fresh
    /// connection whose command queue is known to have room.
    pub(crate) fn start_close(&self) {
        let (ack, _) = oneshot::channel();
        let payload = CloseFrame::new(CloseCode::Normal, "").encode();
        if self.commands.try_send(Command::Close { payload, ack }).is_err() {
            tracing::debug!(connection_id = %self.id(), "close could not be queued");
        }
    }

    /// Sends a message, fragmenting it by the configured fragment size.
    pub async fn send_message(&self, opcode: OpCode, payload: impl Into<Bytes>) -> WsResult<()> {
        let fragment_size = self.shared.config.fragment_size;
        self.send_inner(opcode, payload.into(), fragment_size).await
    }

    /// Sends a message split into frames of at most `fragment_size` bytes.
    pub async fn send_fragmented(
        &self,
        opcode: OpCode,
        payload: impl Into<Bytes>,
        fragment_size: usize,
    ) -> WsResult<()> {
        if fragment_size == 0 {
            return Err(WsError::invalid_parameter("fragment size must be positive"));
        }
        self.send_inner(opcode, payload.into(), fragment_size).await
    }

    async fn send_inner(&self, opcode: OpCode, payload: Bytes, fragment_size: usize) -> WsResult<()> {
        match opcode {
            OpCode::Continuation => Err(WsError::invalid_parameter(
                "continuation frames are produced by fragmentation",
            )),
            OpCode::Close => self.close_with_payload(payload).await,
            op if op.is_control() && payload.len() > MAX_CONTROL_PAYLOAD => Err(
                WsError::invalid_parameter("control frame payload over 125 bytes"),
            ),
            _ => {
                self.request(|ack| Command::Send {
                    opcode,
                    payload,
                    fragment_size,
                    ack,
                })
                .await
            }
        }
    }

    /// Sends a text message.
    pub async fn send_text(&self, text: impl Into<String>) -> WsResult<()> {
        self.send_message(OpCode::Text, text.into()).await
    }

    /// Sends a binary message.
    pub async fn send_binary(&self, data: impl Into<Bytes>) -> WsResult<()> {
        self.send_message(OpCode::Binary, data).await
    }

    /// Serializes `value` as JSON and sends it as text.
    pub async fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> WsResult<()> {
        let body = serde_json::to_vec(value).map_err(|e| WsError::EncodeFailed(e.to_string()))?;
        self.send_message(OpCode::Text, body).await
    }

    /// Sends a ping.
    pub async fn ping(&self, payload: impl Into<Bytes>) -> WsResult<()> {
        self.send_message(OpCode::Ping, payload).await
    }

    /// Starts a normal close.
    pub async fn close(&self) -> WsResult<()> {
        self.close_with(CloseCode::Normal, "").await
    }

    /// Starts a close with a status code and reason.
    pub async fn close_with(&self, code: CloseCode, reason: &str) -> WsResult<()> {
        if reason.len() > MAX_CONTROL_PAYLOAD - 2 {
            return Err(WsError::invalid_parameter("close reason over 123 bytes"));
        }
        self.close_with_payload(CloseFrame::new(code, reason).encode())
            .await
    }

    async fn close_with_payload(&self, payload: Bytes) -> WsResult<()> {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WsError::invalid_parameter("close payload over 125 bytes"));
        }
        self.request(|ack| Command::Close { payload, ack }).await
    }

    /// Waits until the connection is closed, or until `timeout` elapses.
    /// Returns the status at that point.
    pub async fn wait_closed(&self, timeout: Option<Duration>) -> ConnectionStatus {
        let mut status = self.shared.status.subscribe();
        let wait = async move {
            loop {
                if *status.borrow_and_update() == ConnectionStatus::Closed {
                    return;
                }
                if status.changed().await.is_err() {
                    return;
                }
            }
        };
        match timeout {
            Some(limit) => {
                let _ = tokio::time::timeout(limit, wait).await;
            }
            None => wait.await,
        }
        self.status()
    }

    /// Takes every archived incoming message.
    pub fn drain_incoming(&self) -> Vec<Message> {
        self.shared.incoming.lock().drain(..).collect()
    }

    /// Takes every archived outgoing message.
    pub fn drain_outgoing(&self) -> Vec<Message> {
        self.shared.outgoing.lock().drain(..).collect()
    }

    /// Number of archived incoming messages.
    pub fn incoming_len(&self) -> usize {
        self.shared.incoming.lock().len()
    }

    /// Number of archived outgoing messages.
    pub fn outgoing_len(&self) -> usize {
        self.shared.outgoing.lock().len()
    }
}

/// Everything needed to start a connection after a successful handshake.
pub(crate) struct ConnectionParts {
    pub role: Role,
    pub protocol: Option<String>,
    pub extensions: ExtensionSet,
    pub callbacks: Callbacks,
    pub config: WebSocketConfig,
    pub slot: Option<ConnectionSlot>,
    /// Bytes already read past the end of the handshake.
    pub leftover: BytesMut,
}

/// Registers and starts a connection on `stream`.
pub(crate) fn spawn_connection<S>(stream: S, parts: ConnectionParts) -> WebSocketHandle
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (status, _) = watch::channel(ConnectionStatus::Open);
    let (commands_tx, commands_rx) = mpsc::channel(parts.config.command_capacity.max(1));

    let shared = Arc::new(Shared {
        id: Uuid::now_v7(),
        role: parts.role,
        protocol: parts.protocol,
        extensions: parts.extensions.names(),
        config: parts.config,
        status,
        incoming: Mutex::new(VecDeque::new()),
        outgoing: Mutex::new(VecDeque::new()),
    });
    let handle = WebSocketHandle {
        shared: Arc::clone(&shared),
        commands: commands_tx,
    };

    let registration = parts.slot.map(|slot| slot.fill(handle.clone()));

    tracing::info!(
        connection_id = %shared.id,
        role = ?shared.role,
        protocol = shared.protocol.as_deref(),
        "websocket connection opened"
    );

    let (reader, writer) = tokio::io::split(stream);
    let actor = Actor {
        codec: FrameCodec::new(shared.role, shared.config.max_frame_size),
        shared,
        writer,
        extensions: parts.extensions,
        partial: None,
        dispatch: None,
        close_deadline: None,
        write_buf: BytesMut::new(),
    };

    tokio::spawn(actor.run(
        reader,
        parts.leftover,
        commands_rx,
        handle.clone(),
        parts.callbacks,
        registration,
    ));

    handle
}

async fn join_callback(id: ConnectionId, name: &'static str, task: Option<JoinHandle<()>>) {
    if let Some(task) = task {
        if let Err(e) = task.await {
            tracing::warn!(connection_id = %id, task = name, error = %e, "callback task failed");
        }
    }
}

/// A data message being reassembled.
struct Partial {
    opcode: OpCode,
    rsv: u8,
    mask: Option<[u8; 4]>,
    payload: BytesMut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct Actor<S> {
    shared: Arc<Shared>,
    codec: FrameCodec,
    writer: WriteHalf<S>,
    extensions: ExtensionSet,
    partial: Option<Partial>,
    dispatch: Option<mpsc::UnboundedSender<Message>>,
    close_deadline: Option<Instant>,
    write_buf: BytesMut,
}

impl<S> Actor<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn run(
        mut self,
        mut reader: ReadHalf<S>,
        mut buf: BytesMut,
        mut commands: mpsc::Receiver<Command>,
        handle: WebSocketHandle,
        callbacks: Callbacks,
        registration: Option<Registration>,
    ) {
        let id = self.shared.id;

        let dispatch_task = callbacks.incoming.clone().map(|(callback, data)| {
            let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
            self.dispatch = Some(tx);
            let handle = handle.clone();
            tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    callback(handle.clone(), message.clone(), data.clone()).await;
                    handle.shared.archive_incoming(message);
                }
            })
        });

        let manager_task: Option<JoinHandle<()>> = callbacks
            .manager
            .clone()
            .map(|(callback, data)| tokio::spawn(callback(handle.clone(), data)));

        self.read_loop(&mut reader, &mut buf, &mut commands).await;

        let _ = self.writer.shutdown().await;
        self.shared.set_status(ConnectionStatus::Closed);
        tracing::debug!(connection_id = %id, "websocket read loop exited");

        commands.close();
        while let Ok(command) = commands.try_recv() {
            command.refuse();
        }

        self.dispatch = None;
        for (name, task) in [("dispatch", dispatch_task), ("manager", manager_task)] {
            join_callback(id, name, task).await;
        }

        let close_task = callbacks
            .on_close
            .map(|(callback, data)| tokio::spawn(callback(handle.clone(), data)));
        join_callback(id, "close", close_task).await;

        drop(registration);
        tracing::info!(connection_id = %id, "websocket connection closed");
    }

    async fn read_loop(
        &mut self,
        reader: &mut ReadHalf<S>,
        buf: &mut BytesMut,
        commands: &mut mpsc::Receiver<Command>,
    ) {
        let mut commands_open = true;

        loop {
            match self.codec.decode(buf) {
                Ok(Some(frame)) => {
                    match self.on_frame(frame).await {
                        Ok(Flow::Continue) => continue,
                        Ok(Flow::Stop) => return,
                        Err(e) => return self.fail(e).await,
                    }
                }
                Ok(None) => {}
                Err(e) => return self.fail(e).await,
            }

            let deadline = self.close_deadline;
            tokio::select! {
                command = commands.recv(), if commands_open => match command {
                    Some(command) => {
                        if self.on_command(command).await == Flow::Stop {
                            return;
                        }
                    }
                    None => commands_open = false,
                },
                read = reader.read_buf(buf) => match read {
                    Ok(0) => {
                        tracing::debug!(connection_id = %self.shared.id, "transport closed by peer");
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(connection_id = %self.shared.id, error = %e, "transport read failed");
                        return;
                    }
                },
                () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    tracing::debug!(connection_id = %self.shared.id, "close handshake timed out");
                    return;
                }
            }
        }
    }

    /// Ends the connection after a protocol violation.
    async fn fail(&mut self, error: WsError) {
        tracing::warn!(connection_id = %self.shared.id, error = %error, "websocket protocol error");
        if self.shared.status() == ConnectionStatus::Open {
            self.shared.set_status(ConnectionStatus::Closing);
            let frame = CloseFrame::new(error.to_close_code(), "");
            let _ = self.write_control(OpCode::Close, frame.encode()).await;
        }
    }

    async fn on_frame(&mut self, frame: Frame) -> WsResult<Flow> {
        if frame.opcode.is_control() {
            if frame.rsv != 0 {
                return Err(WsError::protocol_error("reserved bits set on a control frame"));
            }
            return match frame.opcode {
                OpCode::Ping => {
                    if self.shared.status() == ConnectionStatus::Open {
                        self.write_control(OpCode::Pong, Bytes::new()).await?;
                    }
                    Ok(Flow::Continue)
                }
                OpCode::Close => self.on_close_frame(&frame.payload).await,
                _ => {
                    let message = Message::new(frame.opcode, frame.payload).with_mask(frame.mask);
                    self.deliver(message);
                    Ok(Flow::Continue)
                }
            };
        }

        let mut partial = match (frame.opcode, self.partial.take()) {
            (OpCode::Continuation, None) => {
                return Err(WsError::protocol_error("continuation without a message in progress"));
            }
            (OpCode::Continuation, Some(partial)) => {
                if frame.rsv & !self.extensions.continuation_bits() != 0 {
                    return Err(WsError::protocol_error("unexpected reserved bits on continuation"));
                }
                partial
            }
            (_, Some(_)) => {
                return Err(WsError::protocol_error("new data frame inside a fragmented message"));
            }
            (opcode, None) => {
                if frame.rsv & !self.extensions.first_frame_bits() != 0 {
                    return Err(WsError::protocol_error("reserved bits not owned by an extension"));
                }
                Partial {
                    opcode,
                    rsv: frame.rsv,
                    mask: frame.mask,
                    payload: BytesMut::new(),
                }
            }
        };

        let chunk = self
            .extensions
            .decode_frame(partial.opcode, frame.rsv, frame.payload)?;
        let limit = self.shared.config.max_message_size;
        if partial.payload.len() + chunk.len() > limit {
            return Err(WsError::MessageTooBig {
                size: partial.payload.len() + chunk.len(),
                limit,
            });
        }
        partial.payload.extend_from_slice(&chunk);

        if !frame.fin {
            self.partial = Some(partial);
            return Ok(Flow::Continue);
        }

        let payload = self
            .extensions
            .decode_message(partial.opcode, partial.rsv, partial.payload.freeze())?;
        if payload.len() > limit {
            return Err(WsError::MessageTooBig {
                size: payload.len(),
                limit,
            });
        }
        self.deliver(Message::new(partial.opcode, payload).with_mask(partial.mask));
        Ok(Flow::Continue)
    }

    async fn on_close_frame(&mut self, payload: &Bytes) -> WsResult<Flow> {
        let frame = CloseFrame::parse(payload)?;
        tracing::debug!(
            connection_id = %self.shared.id,
            code = frame.as_ref().map(|f| f.code),
            "close frame received"
        );

        if self.shared.status() == ConnectionStatus::Open {
            self.shared.set_status(ConnectionStatus::Closing);
            let echo = frame.map(|f| CloseFrame { reason: String::new(), ..f });
            let payload = echo.map(|f| f.encode()).unwrap_or_default();
            self.write_control(OpCode::Close, payload).await?;
        }
        Ok(Flow::Stop)
    }

    fn deliver(&self, message: Message) {
        match &self.dispatch {
            Some(tx) => {
                if let Err(mpsc::error::SendError(message)) = tx.send(message) {
                    self.shared.archive_incoming(message);
                }
            }
            None => self.shared.archive_incoming(message),
        }
    }

    async fn on_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Send {
                opcode,
                payload,
                fragment_size,
                ack,
            } => {
                if self.shared.status() != ConnectionStatus::Open {
                    let _ = ack.send(Err(WsError::connection_closed(None, "connection is closing")));
                    return Flow::Continue;
                }
                let result = self.write_message(opcode, payload, fragment_size).await;
                let flow = match &result {
                    Err(WsError::Io(_)) => Flow::Stop,
                    _ => Flow::Continue,
                };
                let _ = ack.send(result);
                flow
            }
            Command::Close { payload, ack } => {
                if self.shared.status() != ConnectionStatus::Open {
                    let _ = ack.send(Ok(()));
                    return Flow::Continue;
                }
                self.shared.set_status(ConnectionStatus::Closing);
                let result = self.write_control(OpCode::Close, payload).await;
                self.close_deadline = Some(Instant::now() + self.shared.config.close_timeout);
                let flow = if result.is_err() { Flow::Stop } else { Flow::Continue };
                let _ = ack.send(result);
                flow
            }
        }
    }

    fn mask(&self) -> Option<[u8; 4]> {
        self.shared.role.masks_outgoing().then(generate_mask)
    }

    async fn write_control(&mut self, opcode: OpCode, payload: Bytes) -> WsResult<()> {
        let mut frame = Frame::new(opcode, payload);
        frame.mask = self.mask();
        self.write_buf.clear();
        frame.encode(&mut self.write_buf);
        self.flush_buf().await
    }

    async fn write_message(&mut self, opcode: OpCode, payload: Bytes, fragment_size: usize) -> WsResult<()> {
        self.write_buf.clear();
        let mut first_mask = None;

        if opcode.is_control() {
            let mut frame = Frame::new(opcode, payload.clone());
            frame.mask = self.mask();
            first_mask = frame.mask;
            frame.encode(&mut self.write_buf);
        } else {
            let (encoded, message_rsv) = self.extensions.encode_message(opcode, payload.clone())?;
            for (index, mut frame) in fragment(opcode, &encoded, fragment_size).into_iter().enumerate() {
                let (chunk, frame_rsv) = self.extensions.encode_frame(opcode, frame.payload)?;
                frame.payload = chunk;
                frame.rsv = frame_rsv | if index == 0 { message_rsv } else { 0 };
                frame.mask = self.mask();
                if index == 0 {
                    first_mask = frame.mask;
                }
                frame.encode(&mut self.write_buf);
            }
        }

        self.flush_buf().await?;
        tracing::trace!(connection_id = %self.shared.id, ?opcode, len = payload.len(), "message sent");
        self.shared
            .archive_outgoing(Message::new(opcode, payload).with_mask(first_mask));
        Ok(())
    }

    async fn flush_buf(&mut self) -> WsResult<()> {
        self.writer.write_all(&self.write_buf).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
