//! Client side of a hub connection.
//!
//! # Architecture
//!
//! ```text
//! HubConnection (caller handle, cloneable)
//!     │  invoke / send ──▶ Channel (outbound middleware) ──▶ transport
//!     │
//!     └── receive loop (spawned by start)
//!           ├── ConnectionEvent   ─▶ handshake: records the connection id
//!           ├── InvocationResult  ─▶ PendingCalls::complete (resolve once)
//!           ├── ClientMethodInvocation ─▶ HandlerTable, reply when Id set
//!           └── Text              ─▶ on_text handler
//! ```
//!
//! Call correlation uses oneshot channels keyed by a monotonically increasing
//! id. When the receive loop ends, for any reason, every pending call fails
//! with [`ClientError::ConnectionClosed`].

// Rust guideline compliant 2026-02

mod handlers;
pub mod pending;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::{
    websocket, Channel, ChannelError, ChannelReader, CloseStatus, FrameSink, FrameSource,
};
use crate::config::{ClientConfig, Config, UnknownHandlerPolicy};
use crate::connection::ConnectionId;
use crate::middleware::MiddlewarePipeline;
use crate::protocol::{
    FromArguments, IntoArguments, InvocationDescriptor, InvocationResultDescriptor, Message,
    MessageType, ProtocolError,
};

use handlers::HandlerTable;
use pending::{CallFailure, PendingCalls};

/// Errors surfaced by [`HubConnection`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// `start` was called twice.
    #[error("connection already started")]
    AlreadyStarted,

    /// The connection was disposed.
    #[error("connection disposed")]
    Disposed,

    /// The connection has not been started.
    #[error("connection not started")]
    NotStarted,

    /// The server never sent its connection event.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The connection closed before the call completed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The caller cancelled the call.
    #[error("invocation of '{method}' was cancelled")]
    Cancelled {
        /// Invoked method.
        method: String,
    },

    /// The server reported an error.
    #[error("'{method}' failed: {message}")]
    Remote {
        /// Invoked method.
        method: String,
        /// Error text from the server.
        message: String,
    },

    /// The result did not decode into the requested type.
    #[error("result of '{method}' is not a {expected}")]
    ResultType {
        /// Invoked method.
        method: String,
        /// Requested type.
        expected: &'static str,
        /// Decode failure.
        #[source]
        source: serde_json::Error,
    },

    /// Transport or middleware failure.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Encoding failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Started,
    Disposed,
}

/// Parts the receive loop needs. Held separately so the loop never keeps the
/// caller-facing handle alive.
#[derive(Debug)]
struct Shared {
    channel: Arc<Channel>,
    pending: PendingCalls,
    handlers: HandlerTable,
    connection_id: OnceLock<ConnectionId>,
    unknown_handler: UnknownHandlerPolicy,
    shutdown: CancellationToken,
    closed: CancellationToken,
}

#[derive(Debug)]
struct Inner {
    shared: Arc<Shared>,
    state: Mutex<State>,
    reader: Mutex<Option<ChannelReader>>,
    task: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
    handshake_timeout: Duration,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builder for [`HubConnection`].
#[derive(Debug, Default)]
pub struct HubConnectionBuilder {
    pipeline: MiddlewarePipeline,
    config: ClientConfig,
}

impl HubConnectionBuilder {
    /// Middleware applied to every message. Must mirror the server's chain.
    #[must_use]
    pub fn middleware(mut self, pipeline: MiddlewarePipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Client settings.
    #[must_use]
    pub fn client_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Take client settings and the default middleware from `config`.
    #[must_use]
    pub fn config(self, config: &Config) -> Self {
        self.client_config(config.client).middleware(config.middleware())
    }

    /// Wrap an established transport. Nothing is read until
    /// [`HubConnection::start`].
    pub fn build(self, sink: impl FrameSink, source: impl FrameSource) -> HubConnection {
        let (channel, reader) = Channel::open(sink, source, self.pipeline);
        HubConnection {
            inner: Arc::new(Inner {
                shared: Arc::new(Shared {
                    channel,
                    pending: PendingCalls::new(),
                    handlers: HandlerTable::default(),
                    connection_id: OnceLock::new(),
                    unknown_handler: self.config.unknown_handler,
                    shutdown: CancellationToken::new(),
                    closed: CancellationToken::new(),
                }),
                state: Mutex::new(State::Created),
                reader: Mutex::new(Some(reader)),
                task: Mutex::new(None),
                next_id: AtomicU64::new(1),
                handshake_timeout: self.config.handshake_timeout(),
            }),
        }
    }

    /// Open a WebSocket to `url` and wrap it.
    pub async fn connect(self, url: &str) -> Result<HubConnection, ClientError> {
        let (sink, source) = websocket::connect(url).await?;
        Ok(self.build(sink, source))
    }
}

/// A client connection to a hub.
///
/// Cheap to clone; clones share the connection.
#[derive(Debug, Clone)]
pub struct HubConnection {
    inner: Arc<Inner>,
}

impl HubConnection {
    /// Start configuring a connection.
    pub fn builder() -> HubConnectionBuilder {
        HubConnectionBuilder::default()
    }

    /// Start the receive loop and wait for the server's connection id.
    ///
    /// One-shot: a second call fails with [`ClientError::AlreadyStarted`].
    /// A handshake timeout disposes the connection.
    pub async fn start(&self) -> Result<ConnectionId, ClientError> {
        let reader = {
            let mut state = lock(&self.inner.state);
            match *state {
                State::Started => return Err(ClientError::AlreadyStarted),
                State::Disposed => return Err(ClientError::Disposed),
                State::Created => {}
            }
            *state = State::Started;
            lock(&self.inner.reader).take()
        };
        let Some(reader) = reader else {
            return Err(ClientError::AlreadyStarted);
        };

        let (handshake_tx, handshake_rx) = oneshot::channel();
        let task = tokio::spawn(receive_loop(
            Arc::clone(&self.inner.shared),
            reader,
            handshake_tx,
        ));
        *lock(&self.inner.task) = Some(task);

        match tokio::time::timeout(self.inner.handshake_timeout, handshake_rx).await {
            Ok(Ok(id)) => {
                log::info!("[Client] connected as {id}");
                Ok(id)
            }
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                log::error!(
                    "[Client] no connection event within {:?}",
                    self.inner.handshake_timeout
                );
                self.dispose().await;
                Err(ClientError::Handshake(format!(
                    "no connection event within {:?}",
                    self.inner.handshake_timeout
                )))
            }
        }
    }

    fn ensure_started(&self) -> Result<(), ClientError> {
        match *lock(&self.inner.state) {
            State::Started => Ok(()),
            State::Created => Err(ClientError::NotStarted),
            State::Disposed => Err(ClientError::Disposed),
        }
    }

    /// Invoke `method` and wait for its result.
    pub async fn invoke<R>(&self, method: &str, args: impl IntoArguments) -> Result<R, ClientError>
    where
        R: DeserializeOwned,
    {
        self.invoke_with_cancellation(method, args, CancellationToken::new())
            .await
    }

    /// Invoke `method`, failing locally with [`ClientError::Cancelled`] as soon
    /// as `cancel` fires. The server is not told.
    pub async fn invoke_with_cancellation<R>(
        &self,
        method: &str,
        args: impl IntoArguments,
        cancel: CancellationToken,
    ) -> Result<R, ClientError>
    where
        R: DeserializeOwned,
    {
        self.ensure_started()?;
        let shared = &self.inner.shared;
        let arguments = args.into_arguments()?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let mut rx = shared
            .pending
            .register(id, method)
            .ok_or(ClientError::ConnectionClosed)?;
        let descriptor = InvocationDescriptor::call(id.to_string(), method, arguments);
        let sent = match Message::invocation(&descriptor) {
            Ok(message) => shared.channel.send(&message).await.map_err(ClientError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            shared.pending.cancel(id);
            return Err(e);
        }
        log::trace!("[Client] invoked '{method}' as {id}");

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            outcome = &mut rx => Some(outcome),
        };
        let outcome = match outcome {
            Some(outcome) => outcome,
            None if shared.pending.cancel(id) => {
                return Err(ClientError::Cancelled {
                    method: method.to_string(),
                });
            }
            // The result won the race; it is already in the receiver.
            None => rx.await,
        };

        match outcome {
            Ok(Ok(value)) => {
                serde_json::from_value(value).map_err(|source| ClientError::ResultType {
                    method: method.to_string(),
                    expected: std::any::type_name::<R>(),
                    source,
                })
            }
            Ok(Err(CallFailure::Remote(message))) => Err(ClientError::Remote {
                method: method.to_string(),
                message,
            }),
            Ok(Err(CallFailure::ConnectionClosed)) | Err(_) => Err(ClientError::ConnectionClosed),
        }
    }

    /// Fire-and-forget invocation.
    pub async fn send(&self, method: &str, args: impl IntoArguments) -> Result<(), ClientError> {
        self.ensure_started()?;
        let descriptor = InvocationDescriptor::notification(method, args.into_arguments()?);
        self.inner
            .shared
            .channel
            .send(&Message::invocation(&descriptor)?)
            .await?;
        Ok(())
    }

    /// Send free-form text to the hub.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), ClientError> {
        self.ensure_started()?;
        self.inner.shared.channel.send(&Message::text(text)).await?;
        Ok(())
    }

    /// Handle server invocations of `method`. Arguments decode into the
    /// handler's parameter tuple; a later registration replaces an earlier one.
    pub fn on<A, R, F, Fut>(&self, method: &str, handler: F) -> &Self
    where
        A: FromArguments,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        self.inner.shared.handlers.insert(method, handler);
        self
    }

    /// Handle text pushed by the server.
    pub fn on_text<F>(&self, handler: F) -> &Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.inner.shared.handlers.set_text(handler);
        self
    }

    /// Close the connection and fail every pending call. Idempotent.
    pub async fn dispose(&self) {
        let previous = std::mem::replace(&mut *lock(&self.inner.state), State::Disposed);
        if previous == State::Disposed {
            return;
        }

        let shared = &self.inner.shared;
        shared.shutdown.cancel();
        shared.channel.close(CloseStatus::Normal, "disposed").await;
        shared.pending.fail_all();

        let task = lock(&self.inner.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("[Client] receive loop ended abnormally: {e}");
            }
        }
        shared.closed.cancel();
        log::info!("[Client] disposed");
    }

    /// Id assigned by the server, once the handshake completed.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.inner.shared.connection_id.get().cloned()
    }

    /// Whether the connection is started and still receiving.
    pub fn is_connected(&self) -> bool {
        *lock(&self.inner.state) == State::Started
            && self.inner.shared.channel.is_open()
            && !self.inner.shared.closed.is_cancelled()
    }

    /// Number of calls awaiting a result.
    pub fn pending_calls(&self) -> usize {
        self.inner.shared.pending.len()
    }

    /// Resolves once the receive loop has ended.
    pub async fn closed(&self) {
        self.inner.shared.closed.cancelled().await;
    }
}

async fn receive_loop(
    shared: Arc<Shared>,
    mut reader: ChannelReader,
    handshake: oneshot::Sender<ConnectionId>,
) {
    let cleanup = Arc::clone(&shared);
    scopeguard::defer! {
        cleanup.pending.fail_all();
        cleanup.closed.cancel();
    }

    let mut handshake = Some(handshake);
    loop {
        let next = tokio::select! {
            () = shared.shutdown.cancelled() => break,
            next = reader.recv() => next,
        };
        match next {
            None => {
                log::info!("[Client] server closed the connection");
                break;
            }
            Some(Ok(message)) => shared.dispatch(message, &mut handshake),
            Some(Err(e)) if e.is_fatal() => {
                log::error!("[Client] transport failed: {e}");
                break;
            }
            Some(Err(e)) => log::warn!("[Client] dropping unreadable message: {e}"),
        }
    }
}

impl Shared {
    fn dispatch(
        self: &Arc<Self>,
        message: Message,
        handshake: &mut Option<oneshot::Sender<ConnectionId>>,
    ) {
        match message.message_type() {
            MessageType::ConnectionEvent => {
                let id = ConnectionId::from(message.into_data());
                match handshake.take() {
                    Some(tx) => {
                        let _ = self.connection_id.set(id.clone());
                        let _ = tx.send(id);
                    }
                    None => log::debug!("[Client] ignoring repeated connection event {id}"),
                }
            }
            MessageType::InvocationResult => self.on_result(message.data()),
            MessageType::ClientMethodInvocation => self.on_invocation(message.data()),
            MessageType::Text => match self.handlers.text() {
                Some(handler) => {
                    let text = message.into_data();
                    if std::panic::catch_unwind(AssertUnwindSafe(|| handler(text))).is_err() {
                        log::error!("[Client] text handler panicked");
                    }
                }
                None => log::debug!("[Client] no text handler; dropping text"),
            },
        }
    }

    fn on_result(&self, data: &str) {
        let result = match InvocationResultDescriptor::parse(data) {
            Ok(result) => result,
            Err(e) => {
                log::warn!("[Client] dropping unreadable result: {e}");
                return;
            }
        };
        let Ok(id) = result.id.parse::<u64>() else {
            log::warn!("[Client] dropping result with foreign id '{}'", result.id);
            return;
        };
        let outcome = result.into_outcome().map_err(CallFailure::Remote);
        if !self.pending.complete(id, outcome) {
            log::warn!("[Client] dropping result for unknown call {id}");
        }
    }

    fn on_invocation(self: &Arc<Self>, data: &str) {
        let descriptor = match InvocationDescriptor::parse(data) {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => {
                log::warn!("[Client] dropping invalid invocation");
                return;
            }
            Err(e) => {
                log::warn!("[Client] dropping unparseable invocation: {e}");
                return;
            }
        };
        let InvocationDescriptor {
            id,
            method_name,
            arguments,
        } = descriptor;

        let bind = AssertUnwindSafe(|| self.handlers.bind(&method_name, arguments));
        let bound = std::panic::catch_unwind(bind);
        let call = match bound {
            Err(_) => {
                log::error!("[Client] handler for '{method_name}' panicked");
                self.reply(
                    id,
                    Err(format!("An unexpected error occurred invoking '{method_name}'")),
                );
                return;
            }
            Ok(Some(Ok(call))) => call,
            Ok(Some(Err(e))) => {
                log::warn!("[Client] bad arguments for '{method_name}': {e}");
                self.reply(id, Err(format!("'{method_name}': {e}")));
                return;
            }
            Ok(None) => {
                match self.unknown_handler {
                    UnknownHandlerPolicy::Report => {
                        log::error!("[Client] no handler for '{method_name}'");
                        self.reply(id, Err(format!("No client method '{method_name}'")));
                    }
                    UnknownHandlerPolicy::Ignore => {
                        log::debug!("[Client] ignoring '{method_name}': no handler");
                    }
                }
                return;
            }
        };

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(call).catch_unwind().await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(format!("An error occurred invoking '{method_name}': {e}")),
                Err(_) => Err(format!("An unexpected error occurred invoking '{method_name}'")),
            };
            if let Err(error) = &outcome {
                log::warn!("[Client] {error}");
            }
            shared.reply(id, outcome);
        });
    }

    /// Answer a server invocation when it carried an id.
    fn reply(&self, id: Option<String>, outcome: Result<serde_json::Value, String>) {
        let Some(id) = id else {
            return;
        };
        let result = match outcome {
            Ok(value) => InvocationResultDescriptor::success(id, value),
            Err(error) => InvocationResultDescriptor::failure(id, error),
        };
        let channel = Arc::clone(&self.channel);
        tokio::spawn(async move {
            let sent = match Message::invocation_result(&result) {
                Ok(message) => channel.send(&message).await.map_err(ClientError::from),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = sent {
                log::warn!("[Client] reply {} not sent: {e}", result.id);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory;
    use serde_json::{json, Value};

    /// Scripted server end.
    struct FakeServer {
        channel: Arc<Channel>,
        reader: ChannelReader,
    }

    impl FakeServer {
        async fn recv(&mut self) -> Message {
            tokio::time::timeout(Duration::from_secs(2), self.reader.recv())
                .await
                .expect("timed out")
                .expect("closed")
                .expect("bad message")
        }

        async fn recv_invocation(&mut self) -> InvocationDescriptor {
            let message = self.recv().await;
            assert_eq!(message.message_type(), MessageType::ClientMethodInvocation);
            InvocationDescriptor::parse(message.data()).unwrap().unwrap()
        }

        async fn answer(&self, id: &str, result: Value) {
            let desc = InvocationResultDescriptor::success(id, result);
            self.channel.send(&Message::invocation_result(&desc).unwrap()).await.unwrap();
        }
    }

    fn pair_with(config: ClientConfig) -> (HubConnection, FakeServer) {
        let (client, server) = memory::duplex();
        let (client_sink, client_source) = client.into_parts();
        let (server_sink, server_source) = server.into_parts();
        let connection = HubConnection::builder()
            .client_config(config)
            .build(client_sink, client_source);
        let (channel, reader) =
            Channel::open(server_sink, server_source, MiddlewarePipeline::empty());
        (connection, FakeServer { channel, reader })
    }

    async fn started() -> (HubConnection, FakeServer) {
        let (connection, server) = pair_with(ClientConfig::default());
        server.channel.send(&Message::connection_event("conn-1")).await.unwrap();
        let id = connection.start().await.unwrap();
        assert_eq!(id.as_str(), "conn-1");
        (connection, server)
    }

    #[tokio::test]
    async fn test_start_is_one_shot() {
        let (connection, _server) = started().await;
        assert!(connection.is_connected());
        assert!(matches!(connection.start().await, Err(ClientError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn test_handshake_timeout_disposes() {
        let config = ClientConfig {
            handshake_timeout_ms: 50,
            ..ClientConfig::default()
        };
        let (connection, _server) = pair_with(config);
        assert!(matches!(connection.start().await, Err(ClientError::Handshake(_))));
        assert!(matches!(
            connection.invoke::<Value>("X", ()).await,
            Err(ClientError::Disposed)
        ));
    }

    #[tokio::test]
    async fn test_invoke_before_start() {
        let (connection, _server) = pair_with(ClientConfig::default());
        assert!(matches!(
            connection.send("X", ()).await,
            Err(ClientError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn test_invoke_correlates_out_of_order_results() {
        let (connection, mut server) = started().await;

        let first = tokio::spawn({
            let c = connection.clone();
            async move { c.invoke::<i64>("Add", (1, 2)).await }
        });
        let a = server.recv_invocation().await;
        let second = tokio::spawn({
            let c = connection.clone();
            async move { c.invoke::<String>("Name", ()).await }
        });
        let b = server.recv_invocation().await;
        assert_ne!(a.id, b.id);

        server.answer(b.id.as_deref().unwrap(), json!("hub")).await;
        server.answer(a.id.as_deref().unwrap(), json!(3)).await;

        assert_eq!(second.await.unwrap().unwrap(), "hub");
        assert_eq!(first.await.unwrap().unwrap(), 3);
        assert_eq!(connection.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_remote_error_and_result_type() {
        let (connection, mut server) = started().await;

        let call = tokio::spawn({
            let c = connection.clone();
            async move { c.invoke::<i64>("Boom", ()).await }
        });
        let id = server.recv_invocation().await.id.unwrap();
        let desc = InvocationResultDescriptor::failure(id, "kaput");
        server.channel.send(&Message::invocation_result(&desc).unwrap()).await.unwrap();
        assert!(matches!(
            call.await.unwrap(),
            Err(ClientError::Remote { message, .. }) if message == "kaput"
        ));

        let call = tokio::spawn({
            let c = connection.clone();
            async move { c.invoke::<i64>("Text", ()).await }
        });
        let id = server.recv_invocation().await.id.unwrap();
        server.answer(&id, json!("not a number")).await;
        assert!(matches!(call.await.unwrap(), Err(ClientError::ResultType { .. })));
    }

    #[tokio::test]
    async fn test_cancellation_faults_locally() {
        let (connection, mut server) = started().await;
        let cancel = CancellationToken::new();

        let call = tokio::spawn({
            let c = connection.clone();
            let cancel = cancel.clone();
            async move { c.invoke_with_cancellation::<Value>("Slow", (), cancel).await }
        });
        let id = server.recv_invocation().await.id.unwrap();
        cancel.cancel();
        assert!(matches!(call.await.unwrap(), Err(ClientError::Cancelled { .. })));

        // A late result is dropped.
        server.answer(&id, json!(1)).await;
        assert_eq!(connection.pending_calls(), 0);
        assert!(connection.is_connected());
    }

    #[tokio::test]
    async fn test_dispose_fails_pending_and_is_idempotent() {
        let (connection, mut server) = started().await;

        let call = tokio::spawn({
            let c = connection.clone();
            async move { c.invoke::<Value>("Never", ()).await }
        });
        server.recv_invocation().await;

        connection.dispose().await;
        connection.dispose().await;
        assert!(matches!(call.await.unwrap(), Err(ClientError::ConnectionClosed)));
        assert!(matches!(
            connection.invoke::<Value>("After", ()).await,
            Err(ClientError::Disposed)
        ));
        assert!(!connection.is_connected());
        tokio::time::timeout(Duration::from_secs(1), connection.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_server_close_fails_pending() {
        let (connection, mut server) = started().await;

        let call = tokio::spawn({
            let c = connection.clone();
            async move { c.invoke::<Value>("Never", ()).await }
        });
        server.recv_invocation().await;
        server.channel.close(CloseStatus::GoingAway, "restart").await;

        assert!(matches!(call.await.unwrap(), Err(ClientError::ConnectionClosed)));
        tokio::time::timeout(Duration::from_secs(1), connection.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_server_invocation_reaches_handler_and_replies() {
        let (connection, mut server) = started().await;
        connection.on("Double", |(n,): (i64,)| async move { anyhow::Ok(n * 2) });

        let desc = InvocationDescriptor::call("s1", "Double", vec![json!(21)]);
        server.channel.send(&Message::invocation(&desc).unwrap()).await.unwrap();

        let reply = server.recv().await;
        let result = InvocationResultDescriptor::parse(reply.data()).unwrap();
        assert_eq!(result.id, "s1");
        assert_eq!(result.into_outcome(), Ok(json!(42)));
    }

    #[tokio::test]
    async fn test_unknown_handler_reported() {
        let (_connection, mut server) = started().await;

        let desc = InvocationDescriptor::call("s2", "Missing", vec![]);
        server.channel.send(&Message::invocation(&desc).unwrap()).await.unwrap();
        let reply = server.recv().await;
        let result = InvocationResultDescriptor::parse(reply.data()).unwrap();
        assert_eq!(result.id, "s2");
        assert!(result.error.unwrap().contains("Missing"));
    }

    #[tokio::test]
    async fn test_unknown_handler_ignored() {
        let config = ClientConfig {
            unknown_handler: UnknownHandlerPolicy::Ignore,
            ..ClientConfig::default()
        };
        let (connection, mut server) = pair_with(config);
        server.channel.send(&Message::connection_event("c")).await.unwrap();
        connection.start().await.unwrap();
        connection.on("Known", |(): ()| async move { anyhow::Ok("yes") });

        let missing = InvocationDescriptor::call("m", "Missing", vec![]);
        let known = InvocationDescriptor::call("k", "Known", vec![]);
        server.channel.send(&Message::invocation(&missing).unwrap()).await.unwrap();
        server.channel.send(&Message::invocation(&known).unwrap()).await.unwrap();

        let reply = server.recv().await;
        let result = InvocationResultDescriptor::parse(reply.data()).unwrap();
        assert_eq!(result.id, "k");
    }

    #[tokio::test]
    async fn test_text_handler() {
        let (connection, server) = started().await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        connection.on_text(move |text| {
            let _ = tx.send(text);
        });

        server.channel.send(&Message::text("hello")).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(got.as_deref(), Some("hello"));
    }
    #[tokio::test]
    async fn test_panicking_text_handler_keeps_receive_loop() {
        let (connection, mut server) = started().await;
        connection.on_text(|_| panic!("handler bug"));

        let call = tokio::spawn({
            let c = connection.clone();
            async move { c.invoke::<i64>("X", ()).await }
        });
        let id = server.recv_invocation().await.id.unwrap();
        server.channel.send(&Message::text("boom")).await.unwrap();
        server.answer(&id, json!(7)).await;

        let outcome = tokio::time::timeout(Duration::from_secs(2), call).await.unwrap();
        assert_eq!(outcome.unwrap().unwrap(), 7);
        assert!(connection.is_connected());

        // Pending calls still fail once the server goes away.
        let call = tokio::spawn({
            let c = connection.clone();
            async move { c.invoke::<i64>("Y", ()).await }
        });
        server.recv_invocation().await;
        server.channel.send(&Message::text("again")).await.unwrap();
        server.channel.close(CloseStatus::GoingAway, "restart").await;

        let outcome = tokio::time::timeout(Duration::from_secs(2), call).await.unwrap();
        assert!(matches!(outcome.unwrap(), Err(ClientError::ConnectionClosed)));
        tokio::time::timeout(Duration::from_secs(2), connection.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_handler_panicking_before_its_future_replies_with_error() {
        let (connection, mut server) = started().await;
        connection.on("Explode", |(): ()| {
            if true {
                panic!("sync part");
            }
            async move { anyhow::Ok(()) }
        });

        let desc = InvocationDescriptor::call("e1", "Explode", vec![]);
        server.channel.send(&Message::invocation(&desc).unwrap()).await.unwrap();
        let reply = server.recv().await;
        let result = InvocationResultDescriptor::parse(reply.data()).unwrap();
        assert_eq!(result.id, "e1");
        assert!(result.error.unwrap().contains("Explode"));

        let call = tokio::spawn({
            let c = connection.clone();
            async move { c.invoke::<bool>("Ping", ()).await }
        });
        let id = server.recv_invocation().await.id.unwrap();
        server.answer(&id, json!(true)).await;
        assert!(call.await.unwrap().unwrap());
    }
}
