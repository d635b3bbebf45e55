//! Live room client: configuration, lifecycle and the reconnecting network loop.

use crate::connection::Session;
use crate::dispatcher::{panic_message, Handler};
use crate::error::ClientError;
use crate::resolver::{default_edge_servers, AuthBodyBuilder, EdgeServer, RoomInfo, RoomResolver};
use crate::retry::RetryPolicy;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// User agent sent on the WebSocket upgrade request. Web tokens are bound to it.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/102.0.0.0 Safari/537.36";

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Room to join, long or short id.
    pub room_id: u64,
    /// Period of client heartbeats.
    pub heartbeat_interval: Duration,
    /// Added to the heartbeat interval to get the receive timeout.
    pub receive_timeout_margin: Duration,
    /// WebSocket connect (TCP + TLS + upgrade) timeout.
    pub connect_timeout: Duration,
    /// Edge servers used when the resolver provides none.
    pub fallback_servers: Vec<EdgeServer>,
    /// Room id used when resolution fails. Defaults to `room_id`.
    pub fallback_room_id: Option<u64>,
    pub user_agent: String,
    pub retry_policy: RetryPolicy,
}

impl ClientConfig {
    pub fn new(room_id: u64) -> Self {
        Self {
            room_id,
            heartbeat_interval: Duration::from_secs(30),
            receive_timeout_margin: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            fallback_servers: default_edge_servers(),
            fallback_room_id: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_receive_timeout_margin(mut self, margin: Duration) -> Self {
        self.receive_timeout_margin = margin;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_fallback_servers(mut self, servers: Vec<EdgeServer>) -> Self {
        self.fallback_servers = servers;
        self
    }

    pub fn with_fallback_room_id(mut self, room_id: u64) -> Self {
        self.fallback_room_id = Some(room_id);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Time without any inbound message after which the socket is
    /// considered dead.
    pub fn receive_timeout(&self) -> Duration {
        self.heartbeat_interval + self.receive_timeout_margin
    }
}

/// Lifecycle state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Connecting,
    Authenticating,
    Streaming,
    Reconnecting,
    Closing,
}

impl ClientState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientState::Idle => "idle",
            ClientState::Connecting => "connecting",
            ClientState::Authenticating => "authenticating",
            ClientState::Streaming => "streaming",
            ClientState::Reconnecting => "reconnecting",
            ClientState::Closing => "closing",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RoomSnapshot {
    room_id: u64,
    owner_uid: u64,
    degraded: bool,
}

#[derive(Debug)]
struct HandleInner {
    room: RwLock<RoomSnapshot>,
    state: watch::Sender<ClientState>,
    cancel: Mutex<CancellationToken>,
}

/// Cheap, cloneable view of a client, passed to handlers.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    inner: Arc<HandleInner>,
}

impl ClientHandle {
    fn new(room_id: u64) -> Self {
        let (state, _) = watch::channel(ClientState::Idle);
        Self {
            inner: Arc::new(HandleInner {
                room: RwLock::new(RoomSnapshot {
                    room_id,
                    owner_uid: 0,
                    degraded: false,
                }),
                state,
                cancel: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// A handle not attached to any running client, for exercising
    /// handlers directly.
    pub fn detached(room_id: u64) -> Self {
        Self::new(room_id)
    }

    /// Real room id once resolved, the configured id before that.
    pub fn room_id(&self) -> u64 {
        self.inner.room.read().room_id
    }

    /// Uid of the room owner, 0 if unknown.
    pub fn owner_uid(&self) -> u64 {
        self.inner.room.read().owner_uid
    }

    /// Returns whether the current room info comes from fallback defaults.
    pub fn is_degraded(&self) -> bool {
        self.inner.room.read().degraded
    }

    pub fn state(&self) -> ClientState {
        *self.inner.state.borrow()
    }

    /// Requests the client to stop. Safe to call from any task.
    pub fn stop(&self) {
        self.inner.cancel.lock().cancel();
    }

    pub(crate) fn set_state(&self, state: ClientState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            tracing::debug!(
                room_id = self.room_id(),
                "State {} -> {}",
                previous.as_str(),
                state.as_str()
            );
        }
    }

    fn set_room(&self, info: &RoomInfo) {
        *self.inner.room.write() = RoomSnapshot {
            room_id: info.room_id,
            owner_uid: info.owner_uid,
            degraded: info.degraded,
        };
    }

    fn subscribe_state(&self) -> watch::Receiver<ClientState> {
        self.inner.state.subscribe()
    }

    /// Installs a fresh cancellation token for a new run.
    fn reset_cancel(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.inner.cancel.lock() = token.clone();
        token
    }
}

/// State shared between a [`LiveClient`] and its network task.
pub(crate) struct Inner {
    pub(crate) config: ClientConfig,
    pub(crate) handle: ClientHandle,
    pub(crate) resolver: Arc<dyn RoomResolver>,
    pub(crate) auth: Arc<dyn AuthBodyBuilder>,
    pub(crate) handler: Arc<dyn Handler>,
    retry_policy: Mutex<RetryPolicy>,
}

impl Inner {
    /// Resolves room info, falling back to configured defaults.
    async fn resolve_room(&self) -> RoomInfo {
        let requested = self.config.room_id;
        let mut info = match self.resolver.resolve(requested).await {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(
                    room_id = requested,
                    "Failed to resolve room info, using defaults: {}",
                    e
                );
                RoomInfo {
                    room_id: self.config.fallback_room_id.unwrap_or(requested),
                    degraded: true,
                    ..RoomInfo::default()
                }
            }
        };

        if info.servers.is_empty() {
            info.servers = self.config.fallback_servers.clone();
            info.degraded = true;
        }
        if info.degraded {
            tracing::warn!(room_id = info.room_id, "Running in degraded mode");
        } else {
            tracing::debug!(
                room_id = info.room_id,
                owner_uid = info.owner_uid,
                servers = info.servers.len(),
                "Resolved room info"
            );
        }

        self.handle.set_room(&info);
        info
    }

    fn notify_stopped(&self, error: Option<&ClientError>) {
        let handle = &self.handle;
        let notified = catch_unwind(AssertUnwindSafe(|| {
            self.handler.on_client_stopped(handle, error)
        }));
        if let Err(panic) = notified {
            tracing::error!(
                room_id = handle.room_id(),
                "on_client_stopped panicked: {}",
                panic_message(&*panic)
            );
        }
    }
}

/// Edge server for the given attempt; retries rotate through the list.
pub fn select_server(servers: &[EdgeServer], retry_count: u32) -> Option<&EdgeServer> {
    if servers.is_empty() {
        return None;
    }
    servers.get(retry_count as usize % servers.len())
}

/// A client keeping one connection to one live room alive.
pub struct LiveClient {
    inner: Arc<Inner>,
}

impl LiveClient {
    pub fn new(
        config: ClientConfig,
        resolver: Arc<dyn RoomResolver>,
        auth: Arc<dyn AuthBodyBuilder>,
        handler: Arc<dyn Handler>,
    ) -> Self {
        let handle = ClientHandle::new(config.room_id);
        let retry_policy = Mutex::new(config.retry_policy.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                handle,
                resolver,
                auth,
                handler,
                retry_policy,
            }),
        }
    }

    /// Creates a client whose resolver also builds the auth body.
    pub fn with_resolver<R>(config: ClientConfig, resolver: Arc<R>, handler: Arc<dyn Handler>) -> Self
    where
        R: RoomResolver + AuthBodyBuilder + 'static,
    {
        let auth: Arc<dyn AuthBodyBuilder> = resolver.clone();
        Self::new(config, resolver, auth, handler)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn handle(&self) -> ClientHandle {
        self.inner.handle.clone()
    }

    pub fn room_id(&self) -> u64 {
        self.inner.handle.room_id()
    }

    pub fn state(&self) -> ClientState {
        self.inner.handle.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ClientState> {
        self.inner.handle.subscribe_state()
    }

    /// Returns whether the network loop is running. A stopped client that
    /// has not finished shutting down still counts as running.
    pub fn is_running(&self) -> bool {
        self.state() != ClientState::Idle
    }

    /// Replaces the reconnect backoff policy, effective at the next retry.
    pub fn set_retry_policy(&self, policy: RetryPolicy) {
        *self.inner.retry_policy.lock() = policy;
    }

    /// Starts the network loop in the background. Must be called inside a
    /// tokio runtime.
    pub fn start(&self) {
        if self.is_running() {
            tracing::warn!(
                room_id = self.room_id(),
                "Client is already running, ignoring start()"
            );
            return;
        }

        let cancel = self.inner.handle.reset_cancel();
        self.inner.handle.set_state(ClientState::Connecting);
        tokio::spawn(run(self.inner.clone(), cancel));
    }

    /// Requests the network loop to stop. Use [`LiveClient::join`] to wait
    /// for it.
    pub fn stop(&self) {
        if !self.is_running() {
            tracing::warn!(room_id = self.room_id(), "Client is not running");
            return;
        }
        self.inner.handle.stop();
    }

    /// Waits for the network loop to exit, without stopping it.
    pub async fn join(&self) {
        if !self.is_running() {
            tracing::warn!(room_id = self.room_id(), "Client is not running");
            return;
        }
        let mut state = self.subscribe_state();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = state.wait_for(|s| *s == ClientState::Idle).await;
    }

    /// Releases resources held by the resolver. The client must be stopped
    /// first.
    pub async fn close(&self) {
        if self.is_running() {
            tracing::error!(
                room_id = self.room_id(),
                "close() called while the client is still running"
            );
        }
        self.inner.resolver.close().await;
    }

    /// Stops the client, waits for it to exit and closes it.
    pub async fn stop_and_close(&self) {
        if self.is_running() {
            self.stop();
            self.join().await;
        }
        self.close().await;
    }
}

impl std::fmt::Debug for LiveClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveClient")
            .field("room_id", &self.room_id())
            .field("state", &self.state())
            .finish()
    }
}

async fn run(inner: Arc<Inner>, cancel: CancellationToken) {
    let outcome = AssertUnwindSafe(network_loop(&inner, &cancel))
        .catch_unwind()
        .await;

    inner.handle.set_state(ClientState::Closing);
    let error = match outcome {
        Ok(()) => None,
        Err(panic) => {
            let message = panic_message(&*panic);
            tracing::error!(
                room_id = inner.handle.room_id(),
                "Network loop panicked: {}",
                message
            );
            Some(ClientError::Worker(message))
        }
    };

    inner.notify_stopped(error.as_ref());
    inner.handle.set_state(ClientState::Idle);
}

async fn network_loop(inner: &Inner, cancel: &CancellationToken) {
    let mut room: Option<RoomInfo> = None;
    let mut retry_count: u32 = 0;

    while !cancel.is_cancelled() {
        let info = match room.take() {
            Some(info) if !inner.resolver.should_reresolve(retry_count, info.servers.len()) => info,
            _ => {
                inner.handle.set_state(ClientState::Connecting);
                tokio::select! {
                    () = cancel.cancelled() => break,
                    info = inner.resolve_room() => info,
                }
            }
        };
        let room_id = info.room_id;

        let result = match select_server(&info.servers, retry_count) {
            Some(server) => {
                Session::new(inner, &info, cancel)
                    .run(server, &mut retry_count)
                    .await
            }
            None => Err(ClientError::NoEdgeServers),
        };

        if cancel.is_cancelled() {
            break;
        }
        match result {
            // Sessions only end cleanly on cancellation.
            Ok(()) => break,
            Err(e) if e.requires_reresolve() || matches!(e, ClientError::NoEdgeServers) => {
                tracing::warn!(room_id, "Connection lost, re-resolving room info: {}", e);
            }
            Err(e) => {
                tracing::debug!(room_id, "Connection lost: {}", e);
                room = Some(info);
            }
        }

        inner.handle.set_state(ClientState::Reconnecting);
        retry_count = retry_count.saturating_add(1);
        let interval = inner.retry_policy.lock().interval(retry_count);
        tracing::warn!(
            room_id,
            retry_count,
            "Reconnecting in {:?}",
            interval
        );

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
    }
}
