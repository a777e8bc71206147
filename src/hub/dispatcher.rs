//! Hub dispatcher.
//!
//! Owns the method table for one hub type and drives every connection that
//! hub serves:
//!
//! ```text
//! serve(sink, source)
//!   ├── on_connected      registry + backplane + ConnectionEvent + hook
//!   ├── read loop         on_receive per message, invocations spawned
//!   └── on_disconnected   hook + backplane cleanup + registry removal
//! ```
//!
//! Server-initiated traffic flows the other way: hub code addresses a
//! [`ClientProxy`](super::ClientProxy), the backplane fans out, and the
//! delivery pump started in [`HubDispatcherBuilder::build`] queues each
//! delivery on its local connection's outbox. The pump never waits on a
//! transport.
//!
//! Malformed traffic is classified as unparseable, invalid or missing-method
//! and handled per [`ErrorHandling`].

// Rust guideline compliant 2026-02

use std::fmt;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::backplane::{Backplane, DeliveryReceiver, LocalBackplane};
use crate::channel::{Channel, ChannelError, CloseStatus, FrameSink, FrameSource};
use crate::config::{Config, ErrorHandling, ErrorPolicy};
use crate::connection::{Connection, ConnectionRegistry, Identity};
use crate::middleware::MiddlewarePipeline;
use crate::protocol::{
    InvocationDescriptor, InvocationResultDescriptor, Message, MessageType, ProtocolError,
};

use super::registry::{BoundInvocation, HubMethodDescriptor, HubMethodRegistry};
use super::{
    AuthorizationRequirements, AuthorizationResult, Authorizer, ClientProxy, DispatchTarget, Hub,
    HubContext, HubError, PolicyAuthorizer,
};

/// Builder for [`HubDispatcher`].
pub struct HubDispatcherBuilder<H> {
    backplane: Option<Arc<dyn Backplane>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    connections: Option<Arc<ConnectionRegistry>>,
    pipeline: MiddlewarePipeline,
    errors: ErrorHandling,
    _hub: PhantomData<fn() -> H>,
}

impl<H> fmt::Debug for HubDispatcherBuilder<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubDispatcherBuilder")
            .field("pipeline", &self.pipeline)
            .field("errors", &self.errors)
            .finish_non_exhaustive()
    }
}

impl<H: Hub> HubDispatcherBuilder<H> {
    fn new() -> Self {
        Self {
            backplane: None,
            authorizer: None,
            connections: None,
            pipeline: MiddlewarePipeline::empty(),
            errors: ErrorHandling::default(),
            _hub: PhantomData,
        }
    }

    /// Backplane for fan-out. Defaults to a fresh [`LocalBackplane`].
    #[must_use]
    pub fn backplane(mut self, backplane: Arc<dyn Backplane>) -> Self {
        self.backplane = Some(backplane);
        self
    }

    /// Authorizer for method requirements. Defaults to an empty
    /// [`PolicyAuthorizer`].
    #[must_use]
    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Share a connection registry with other components.
    #[must_use]
    pub fn connections(mut self, connections: Arc<ConnectionRegistry>) -> Self {
        self.connections = Some(connections);
        self
    }

    /// Middleware applied to every channel opened by [`HubDispatcher::serve`].
    #[must_use]
    pub fn middleware(mut self, pipeline: MiddlewarePipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Error policies.
    #[must_use]
    pub fn error_handling(mut self, errors: ErrorHandling) -> Self {
        self.errors = errors;
        self
    }

    /// Take error policies and the default middleware from `config`.
    #[must_use]
    pub fn config(self, config: &Config) -> Self {
        self.error_handling(config.errors).middleware(config.middleware())
    }

    /// Build the method table and start the delivery pump.
    ///
    /// Must run inside a Tokio runtime. Registration errors surface here, as
    /// does a backplane whose delivery stream another dispatcher already
    /// drains.
    pub fn build(self) -> Result<Arc<HubDispatcher<H>>, HubError> {
        let registry = Arc::new(HubMethodRegistry::<H>::build()?);
        let backplane = self
            .backplane
            .unwrap_or_else(|| Arc::new(LocalBackplane::new()));
        let connections = self.connections.unwrap_or_default();

        let Some(rx) = backplane.take_delivery_receiver() else {
            log::error!(
                "[Hub] {} backplane delivery stream already taken",
                backplane.name()
            );
            return Err(HubError::BackplaneInUse(backplane.name()));
        };
        let pump = tokio::spawn(delivery_pump(rx, Arc::clone(&connections)));

        log::info!(
            "[Hub] {} ready: {} method(s), {} backplane",
            H::name(),
            registry.len(),
            backplane.name()
        );

        Ok(Arc::new(HubDispatcher {
            registry,
            connections,
            backplane,
            authorizer: self
                .authorizer
                .unwrap_or_else(|| Arc::new(PolicyAuthorizer::new())),
            pipeline: self.pipeline,
            errors: self.errors,
            hub_authorization: H::authorization(),
            pump,
        }))
    }
}

/// Queues backplane deliveries on local connections, in arrival order.
async fn delivery_pump(mut rx: DeliveryReceiver, connections: Arc<ConnectionRegistry>) {
    while let Some(delivery) = rx.recv().await {
        let Some(connection) = connections.get_by_id(&delivery.connection_id) else {
            log::trace!(
                "[Hub] delivery for departed connection {}",
                delivery.connection_id
            );
            continue;
        };
        if let Err(e) = connection.enqueue(delivery.message) {
            log::warn!("[Hub] delivery to {} dropped: {e}", delivery.connection_id);
        }
    }
    log::debug!("[Hub] delivery pump stopped");
}

/// Dispatches invocations for hub type `H`.
pub struct HubDispatcher<H> {
    registry: Arc<HubMethodRegistry<H>>,
    connections: Arc<ConnectionRegistry>,
    backplane: Arc<dyn Backplane>,
    authorizer: Arc<dyn Authorizer>,
    pipeline: MiddlewarePipeline,
    errors: ErrorHandling,
    hub_authorization: Option<AuthorizationRequirements>,
    pump: JoinHandle<()>,
}

impl<H> fmt::Debug for HubDispatcher<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubDispatcher")
            .field("registry", &self.registry)
            .field("connections", &self.connections.len())
            .field("backplane", &self.backplane.name())
            .field("errors", &self.errors)
            .finish_non_exhaustive()
    }
}

impl<H> Drop for HubDispatcher<H> {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Which error policy applies.
#[derive(Debug, Clone, Copy)]
enum Failure {
    Unparseable,
    Invalid,
    MissingMethod,
}

impl<H: Hub> HubDispatcher<H> {
    /// Start configuring a dispatcher.
    pub fn builder() -> HubDispatcherBuilder<H> {
        HubDispatcherBuilder::new()
    }

    /// Live connections served by this dispatcher.
    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    /// The backplane.
    pub fn backplane(&self) -> &Arc<dyn Backplane> {
        &self.backplane
    }

    /// Middleware applied by [`serve`](Self::serve).
    pub fn middleware(&self) -> &MiddlewarePipeline {
        &self.pipeline
    }

    /// Descriptors of every invocable method.
    pub fn descriptors(&self) -> Vec<Arc<HubMethodDescriptor>> {
        self.registry.descriptors()
    }

    /// Proxy for pushing to clients from outside a hub activation.
    pub fn clients(&self, target: DispatchTarget) -> ClientProxy {
        ClientProxy::new(Arc::clone(&self.backplane), target)
    }

    fn context(&self, connection: &Arc<Connection>) -> HubContext {
        HubContext::new(Arc::clone(connection), Arc::clone(&self.backplane))
    }

    /// Serve one transport until it closes.
    ///
    /// Returns the raised error when an error policy set to `Raise` ended the
    /// connection; transport failures end the connection quietly.
    pub async fn serve(
        self: &Arc<Self>,
        sink: impl FrameSink,
        source: impl FrameSource,
        identity: Option<Identity>,
    ) -> Result<(), HubError> {
        let (channel, mut reader) = Channel::open(sink, source, self.pipeline.clone());
        let connection = self.on_connected(channel, identity).await?;
        let cancel = connection.cancellation();

        let mut transport_error = None;
        let mut outcome = Ok(());
        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => break,
                next = reader.recv() => next,
            };

            let step = match next {
                None => break,
                Some(Ok(message)) => self.on_receive(&connection, message).await,
                Some(Err(e)) if e.is_fatal() => {
                    log::warn!("[Hub] connection {} transport failed: {e}", connection.id());
                    transport_error = Some(e);
                    break;
                }
                Some(Err(e)) => self.on_unreadable(&connection, e).await,
            };

            if let Err(e) = step {
                log::error!("[Hub] closing connection {}: {e}", connection.id());
                connection
                    .channel()
                    .close(CloseStatus::ProtocolError, &e.to_string())
                    .await;
                outcome = Err(e);
                break;
            }
        }

        self.on_disconnected(&connection, transport_error).await;
        outcome
    }

    /// Register a new connection and announce its id.
    ///
    /// The connection event is queued before the backplane can route anything
    /// to the connection, so it is always the first message written.
    pub async fn on_connected(
        self: &Arc<Self>,
        channel: Arc<Channel>,
        identity: Option<Identity>,
    ) -> Result<Arc<Connection>, HubError> {
        let connection = self.connections.add_connection(channel, identity);
        let id = connection.id().clone();

        if let Err(e) = connection.enqueue(Message::connection_event(id.as_str())) {
            log::warn!("[Hub] connection {id} lost before handshake: {e}");
            self.connections.remove_connection(&id).await;
            return Err(e.into());
        }
        if let Err(e) = self.backplane.on_client_connected(&id).await {
            log::error!("[Hub] backplane rejected connection {id}: {e}");
            self.connections.remove_connection(&id).await;
            return Err(e.into());
        }

        log::info!("[Hub] {} connection {id} connected", H::name());
        let hook = H::activate(self.context(&connection)).on_connected();
        match AssertUnwindSafe(hook).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("[Hub] on_connected failed for {id}: {e:#}"),
            Err(_) => log::error!("[Hub] on_connected panicked for {id}"),
        }
        Ok(connection)
    }

    /// Tear a connection down: hook, backplane, registry.
    pub async fn on_disconnected(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        error: Option<ChannelError>,
    ) {
        let id = connection.id().clone();
        let hook = H::activate(self.context(connection)).on_disconnected(error);
        match AssertUnwindSafe(hook).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("[Hub] on_disconnected failed for {id}: {e:#}"),
            Err(_) => log::error!("[Hub] on_disconnected panicked for {id}"),
        }

        self.cleanup(connection).await;
        log::info!("[Hub] {} connection {id} disconnected", H::name());
    }

    async fn cleanup(&self, connection: &Arc<Connection>) {
        if let Err(e) = self.backplane.on_client_disconnected(connection.id()).await {
            log::error!("[Hub] backplane cleanup failed for {}: {e}", connection.id());
        }
        self.connections.remove_connection(connection.id()).await;
    }

    /// Handle one decoded message from `connection`.
    ///
    /// Returns `Err` only when a `Raise` policy applies; the caller is expected
    /// to close the connection.
    pub async fn on_receive(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        message: Message,
    ) -> Result<(), HubError> {
        match message.message_type() {
            MessageType::ClientMethodInvocation => {
                self.on_invocation(connection, message.data()).await
            }
            MessageType::Text => {
                self.spawn_text(connection, message.into_data());
                Ok(())
            }
            other @ (MessageType::InvocationResult | MessageType::ConnectionEvent) => {
                let err = HubError::InvalidMessage(format!("unexpected {other:?} from client"));
                self.reject(connection, Failure::Invalid, None, err).await
            }
        }
    }

    async fn on_unreadable(
        &self,
        connection: &Arc<Connection>,
        error: ChannelError,
    ) -> Result<(), HubError> {
        let (failure, err) = match error {
            ChannelError::Protocol(ProtocolError::MalformedJson(e)) => {
                (Failure::Unparseable, HubError::Unparseable(e.to_string()))
            }
            ChannelError::Protocol(e) => (Failure::Invalid, HubError::InvalidMessage(e.to_string())),
            other => (Failure::Unparseable, HubError::Unparseable(other.to_string())),
        };
        self.reject(connection, failure, None, err).await
    }

    async fn on_invocation(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        data: &str,
    ) -> Result<(), HubError> {
        let descriptor = match InvocationDescriptor::parse(data) {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => {
                let err = HubError::InvalidMessage("not an invocation envelope".to_string());
                return self
                    .reject(connection, Failure::Invalid, InvocationDescriptor::peek_id(data), err)
                    .await;
            }
            Err(e) => {
                let err = HubError::Unparseable(e.to_string());
                return self.reject(connection, Failure::Unparseable, None, err).await;
            }
        };

        let InvocationDescriptor {
            id,
            method_name,
            arguments,
        } = descriptor;
        let argument_count = arguments.len();
        let missing = || HubError::MissingMethod {
            method: method_name.clone(),
            argument_count,
        };

        let Some(method) = self.registry.get(&method_name) else {
            return self
                .reject(connection, Failure::MissingMethod, id, missing())
                .await;
        };

        let bound = match method.bind(arguments) {
            Ok(bound) => bound,
            Err(ProtocolError::ArgumentCount { .. }) => {
                return self
                    .reject(connection, Failure::MissingMethod, id, missing())
                    .await;
            }
            Err(e) => {
                let err = HubError::Unparseable(format!("'{method_name}': {e}"));
                return self.reject(connection, Failure::Unparseable, id, err).await;
            }
        };

        log::trace!("[Hub] {} invoking {method_name}", connection.id());
        self.spawn_invocation(connection, Arc::clone(method.descriptor()), id, bound);
        Ok(())
    }

    /// Apply the error policy for one failure class.
    async fn reject(
        &self,
        connection: &Arc<Connection>,
        failure: Failure,
        id: Option<String>,
        error: HubError,
    ) -> Result<(), HubError> {
        let policy = match failure {
            Failure::Unparseable => self.errors.unparseable,
            Failure::Invalid => self.errors.invalid,
            Failure::MissingMethod => self.errors.missing_method,
        };

        match policy {
            ErrorPolicy::Raise => Err(error),
            ErrorPolicy::Report => {
                log::warn!("[Hub] {} sent a bad message: {error}", connection.id());
                if let Some(id) = id {
                    let result = InvocationResultDescriptor::failure(id, error.to_string());
                    send_result(connection, &result);
                }
                Ok(())
            }
        }
    }

    fn spawn_invocation(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        method: Arc<HubMethodDescriptor>,
        id: Option<String>,
        bound: BoundInvocation<H>,
    ) {
        let this = Arc::clone(self);
        let connection = Arc::clone(connection);

        tokio::spawn(async move {
            let outcome = this.invoke(&connection, &method, bound).await;

            match id {
                Some(id) => {
                    let result = match outcome {
                        Ok(value) => InvocationResultDescriptor::success(id, value),
                        Err(error) => InvocationResultDescriptor::failure(id, error),
                    };
                    send_result(&connection, &result);
                }
                None => {
                    if let Err(error) = outcome {
                        log::debug!("[Hub] fire-and-forget {} failed: {error}", method.name);
                    }
                }
            }
        });
    }

    /// Authorize, activate and run one call. Errors are already client-facing
    /// text.
    async fn invoke(
        &self,
        connection: &Arc<Connection>,
        method: &HubMethodDescriptor,
        bound: BoundInvocation<H>,
    ) -> Result<Value, String> {
        let requirements = method
            .authorization
            .as_ref()
            .or(self.hub_authorization.as_ref());
        if let Some(requirements) = requirements {
            let decision = self
                .authorizer
                .authorize(connection.identity(), connection.id(), requirements)
                .await;
            if let AuthorizationResult::Denied(reason) = decision {
                log::warn!(
                    "[Hub] {} denied '{}': {reason}",
                    connection.id(),
                    method.name
                );
                return Err(format!(
                    "Failed to invoke '{}' because user is unauthorized",
                    method.name
                ));
            }
        }

        let hub = H::activate(self.context(connection));
        let call = AssertUnwindSafe(async move { bound(hub).await }).catch_unwind();
        match call.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                log::debug!("[Hub] '{}' failed: {e:#}", method.name);
                Err(format!("An error occurred invoking '{}': {e}", method.name))
            }
            Err(_) => {
                log::error!("[Hub] '{}' panicked", method.name);
                Err(format!(
                    "An unexpected error occurred invoking '{}'",
                    method.name
                ))
            }
        }
    }

    fn spawn_text(self: &Arc<Self>, connection: &Arc<Connection>, text: String) {
        let hub = H::activate(self.context(connection));
        let connection = Arc::clone(connection);

        tokio::spawn(async move {
            match AssertUnwindSafe(hub.on_text(text)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("[Hub] on_text failed for {}: {e:#}", connection.id()),
                Err(_) => log::error!("[Hub] on_text panicked for {}", connection.id()),
            }
        });
    }
}

fn send_result(connection: &Connection, result: &InvocationResultDescriptor) {
    let message = match Message::invocation_result(result) {
        Ok(message) => message,
        Err(e) => {
            log::error!("[Hub] could not encode result {}: {e}", result.id);
            return;
        }
    };
    if let Err(e) = connection.enqueue(message) {
        log::warn!("[Hub] result {} for {} not delivered: {e}", result.id, connection.id());
    }
}
