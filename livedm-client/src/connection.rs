//! One WebSocket session against one edge server.
//!
//! A session connects, authenticates, runs the heartbeat timer and feeds
//! every inbound message through the frame codec into the handler until the
//! socket dies, the resolver invalidates it, or the client is stopped.

use crate::client::{ClientState, Inner};
use crate::dispatcher::panic_message;
use crate::error::ClientError;
use crate::heartbeat::{heartbeat_frame, FrameSink, HeartbeatScheduler};
use crate::resolver::{EdgeServer, RoomInfo};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use livedm_protocol::{
    decompress, heartbeat_command, parse_command, AuthReply, Frame, Operation, Unpacker,
};
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, USER_AGENT};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write half of a socket, shared with the heartbeat timer.
pub(crate) struct SocketWriter {
    sink: Mutex<SplitSink<WsStream, Message>>,
    closed: AtomicBool,
}

impl SocketWriter {
    fn new(sink: SplitSink<WsStream, Message>) -> Self {
        Self {
            sink: Mutex::new(sink),
            closed: AtomicBool::new(false),
        }
    }

    /// Marks the socket closed and sends a close frame, best effort.
    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            tracing::debug!("Error closing socket: {}", e);
        }
    }
}

#[async_trait]
impl FrameSink for SocketWriter {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn send_frame(&self, frame: Bytes) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::ConnectionClosed);
        }
        let mut sink = self.sink.lock().await;
        sink.send(Message::Binary(frame)).await?;
        Ok(())
    }
}

pub(crate) struct Session<'a> {
    inner: &'a Inner,
    room: &'a RoomInfo,
    cancel: &'a CancellationToken,
}

impl<'a> Session<'a> {
    pub(crate) fn new(inner: &'a Inner, room: &'a RoomInfo, cancel: &'a CancellationToken) -> Self {
        Self {
            inner,
            room,
            cancel,
        }
    }

    fn room_id(&self) -> u64 {
        self.room.room_id
    }

    /// Runs the session to completion.
    ///
    /// Returns `Ok(())` only when cancelled. `retry_count` is reset after
    /// every processed inbound message.
    pub(crate) async fn run(
        &self,
        server: &EdgeServer,
        retry_count: &mut u32,
    ) -> Result<(), ClientError> {
        self.inner.handle.set_state(ClientState::Connecting);
        let url = server.ws_url();
        tracing::debug!(room_id = self.room_id(), "Connecting to {}", url);

        let socket = tokio::select! {
            () = self.cancel.cancelled() => return Ok(()),
            socket = self.connect(&url) => socket?,
        };
        tracing::debug!(room_id = self.room_id(), "Connected to {}", url);

        let (sink, stream) = socket.split();
        let writer = Arc::new(SocketWriter::new(sink));
        let result = self.serve(&writer, stream, retry_count).await;
        writer.close().await;
        result
    }

    async fn connect(&self, url: &str) -> Result<WsStream, ClientError> {
        let mut request = url.into_client_request()?;
        match HeaderValue::from_str(&self.inner.config.user_agent) {
            Ok(user_agent) => {
                request.headers_mut().insert(USER_AGENT, user_agent);
            }
            Err(e) => tracing::warn!(room_id = self.room_id(), "Invalid user agent: {}", e),
        }

        let (socket, _response) =
            tokio::time::timeout(self.inner.config.connect_timeout, connect_async(request))
                .await
                .map_err(|_| {
                    tracing::debug!(room_id = self.room_id(), "Connect timeout");
                    ClientError::Timeout
                })??;
        Ok(socket)
    }

    async fn serve(
        &self,
        writer: &Arc<SocketWriter>,
        mut stream: SplitStream<WsStream>,
        retry_count: &mut u32,
    ) -> Result<(), ClientError> {
        let room_id = self.room_id();
        let config = &self.inner.config;

        self.inner.handle.set_state(ClientState::Authenticating);
        let body = self.inner.auth.build_auth_body(self.room)?.to_bytes()?;
        writer.send_frame(Frame::encode(&body, Operation::Auth)?).await?;
        tracing::debug!(room_id, "Sent auth ({} bytes)", body.len());

        let sink: Arc<dyn FrameSink> = writer.clone();
        let _heartbeat = HeartbeatScheduler::start(
            sink,
            config.heartbeat_interval,
            self.cancel.child_token(),
            room_id,
        )?;

        let receive_timeout = config.receive_timeout();
        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(()),
                () = self.inner.resolver.invalidated() => {
                    return Err(ClientError::SessionInvalidated);
                }
                next = tokio::time::timeout(receive_timeout, stream.next()) => next,
            };

            let message = match next {
                Err(_) => return Err(ClientError::Timeout),
                Ok(None) => return Err(ClientError::ConnectionClosed),
                Ok(Some(message)) => message?,
            };

            match message {
                Message::Binary(data) => {
                    if let Err(e) = self.process_message(writer, data).await {
                        if e.is_session_fatal() {
                            return Err(e);
                        }
                        tracing::warn!(room_id, "Failed to process message: {}", e);
                    }
                    *retry_count = 0;
                }
                Message::Close(frame) => {
                    tracing::debug!(room_id, "Server closed the socket: {:?}", frame);
                    return Err(ClientError::ConnectionClosed);
                }
                Message::Ping(_) | Message::Pong(_) => {}
                other => {
                    tracing::warn!(room_id, "Unexpected WebSocket message: {:?}", other);
                }
            }
        }
    }

    /// Unpacks one WebSocket message and handles its frames in order.
    async fn process_message(&self, writer: &SocketWriter, data: Bytes) -> Result<(), ClientError> {
        let room_id = self.room_id();
        let mut unpacker = Unpacker::new(data);

        while let Some(frame) = unpacker.next_frame() {
            if let Some(version) = frame.compression() {
                let body = frame.body;
                let inner = tokio::task::spawn_blocking(move || decompress(version, &body))
                    .await
                    .map_err(|e| ClientError::Worker(e.to_string()))?;
                match inner {
                    Ok(buf) => unpacker.push(Bytes::from(buf))?,
                    Err(e) => tracing::warn!(room_id, "Dropping compressed frame: {}", e),
                }
                continue;
            }

            if let Err(e) = self.handle_frame(writer, frame).await {
                if e.is_session_fatal() {
                    return Err(e);
                }
                tracing::warn!(room_id, "Failed to handle frame: {}", e);
            }
        }
        Ok(())
    }

    async fn handle_frame(&self, writer: &SocketWriter, frame: Frame) -> Result<(), ClientError> {
        let room_id = self.room_id();

        match frame.header.op() {
            Some(Operation::HeartbeatReply) => {
                if let Some(popularity) = frame.popularity() {
                    self.dispatch(&heartbeat_command(popularity));
                }
            }
            Some(Operation::AuthReply) => {
                let reply: AuthReply = serde_json::from_slice(&frame.body)?;
                if !reply.is_ok() {
                    let body = String::from_utf8_lossy(&frame.body).into_owned();
                    tracing::error!(room_id, code = reply.code, "Auth failed: {}", body);
                    return Err(ClientError::Auth {
                        code: reply.code,
                        body,
                    });
                }
                writer.send_frame(heartbeat_frame()?).await?;
                self.inner.handle.set_state(ClientState::Streaming);
                tracing::info!(room_id, "Authenticated");
            }
            Some(op) if op.is_business() => match frame.header.protocol_version() {
                Ok(_) => {
                    if let Some(command) = parse_command(&frame.body)? {
                        self.dispatch(&command);
                    }
                }
                Err(e) => tracing::warn!(room_id, "Skipping business frame: {}", e),
            },
            _ => {
                tracing::warn!(
                    room_id,
                    operation = frame.header.operation,
                    "Unknown operation, body: {}",
                    String::from_utf8_lossy(&frame.body)
                );
            }
        }
        Ok(())
    }

    /// Hands a command to the handler. Handler failures never reach the
    /// receive loop.
    fn dispatch(&self, command: &Value) {
        let handle = &self.inner.handle;
        let handled = catch_unwind(AssertUnwindSafe(|| self.inner.handler.handle(handle, command)));
        match handled {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(room_id = self.room_id(), %command, "Handler failed: {}", e);
            }
            Err(panic) => {
                tracing::error!(
                    room_id = self.room_id(),
                    %command,
                    "Handler panicked: {}",
                    panic_message(&*panic)
                );
            }
        }
    }
}
