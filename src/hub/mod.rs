//! Server-side hubs.
//!
//! A hub type declares its invocable methods once, in [`Hub::register`], and
//! is activated fresh for every invocation and lifecycle hook:
//!
//! ```text
//! frame ─▶ HubDispatcher ─▶ HubMethodRegistry lookup ─▶ Authorizer
//!                                                          │
//!                     result ◀── method(hub, args) ◀── Hub::activate(ctx)
//! ```
//!
//! Methods take the hub by value, so each activation is released on every
//! exit path. The [`HubContext`] handed to `activate` exposes the calling
//! connection, client proxies, group management and the connection's
//! cancellation token.
//!
//! # Example
//!
//! ```ignore
//! struct Chat {
//!     ctx: HubContext,
//! }
//!
//! #[async_trait]
//! impl Hub for Chat {
//!     fn activate(ctx: HubContext) -> Self {
//!         Self { ctx }
//!     }
//!
//!     fn register(methods: &mut HubMethods<Self>) {
//!         methods.method("Send", |hub: Self, (text,): (String,)| async move {
//!             hub.ctx.clients().all().invoke("Receive", (text,)).await?;
//!             Ok(())
//!         });
//!     }
//! }
//! ```

// Rust guideline compliant 2026-02

pub mod auth;
pub mod context;
pub mod dispatcher;
pub mod registry;

use async_trait::async_trait;

use crate::backplane::BackplaneError;
use crate::channel::ChannelError;
use crate::protocol::ProtocolError;

pub use auth::{
    AuthorizationRequirements, AuthorizationResult, Authorizer, PolicyAuthorizer,
};
pub use context::{ClientProxy, DispatchTarget, GroupManager, HubClients, HubContext};
pub use dispatcher::{HubDispatcher, HubDispatcherBuilder};
pub use registry::{HubMethodDescriptor, HubMethodRegistry, HubMethods};

/// Names reserved for lifecycle hooks; never invocable.
pub const RESERVED_METHOD_NAMES: &[&str] = &["OnConnected", "OnDisconnected"];

/// Errors raised by hub registration and dispatch.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// Two methods were registered under one name.
    #[error("duplicate hub method '{0}'")]
    DuplicateMethod(String),

    /// A method was registered with an empty name.
    #[error("hub method name must not be empty")]
    EmptyMethodName,

    /// A method name collides with a lifecycle hook.
    #[error("'{0}' is reserved for lifecycle hooks")]
    ReservedMethodName(String),

    /// Malformed JSON, or arguments that do not fit the parameter types.
    #[error("unparseable message: {0}")]
    Unparseable(String),

    /// Well-formed data that is not a valid invocation.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// No method matches the name and argument count.
    #[error("Unknown hub method '{method}' with {argument_count} argument(s)")]
    MissingMethod {
        /// Requested method name.
        method: String,
        /// Number of arguments supplied.
        argument_count: usize,
    },

    /// The backplane's delivery stream is already drained by another
    /// dispatcher.
    #[error("{0} backplane is already serving another dispatcher")]
    BackplaneInUse(&'static str),

    /// Channel failure.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Backplane failure.
    #[error(transparent)]
    Backplane(#[from] BackplaneError),

    /// Encoding failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// A server-side hub type.
///
/// Lifecycle hooks have default no-op bodies and are never invocable by
/// clients.
#[async_trait]
pub trait Hub: Send + Sized + 'static {
    /// Construct the instance serving one invocation or hook.
    fn activate(context: HubContext) -> Self;

    /// Declare the invocable methods. Called once, when the dispatcher is built.
    fn register(methods: &mut HubMethods<Self>);

    /// Hub name used in logs.
    fn name() -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Requirements applied to every method that declares none of its own.
    fn authorization() -> Option<AuthorizationRequirements> {
        None
    }

    /// Runs after the connection is registered and has received its id.
    async fn on_connected(self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs before the connection leaves its groups and the registry.
    async fn on_disconnected(self, error: Option<ChannelError>) -> anyhow::Result<()> {
        if let Some(error) = error {
            log::debug!("[Hub] {} disconnected with error: {error}", Self::name());
        }
        Ok(())
    }

    /// Free-form text sent by the client.
    async fn on_text(self, text: String) -> anyhow::Result<()> {
        log::debug!("[Hub] {} ignoring {} bytes of text", Self::name(), text.len());
        Ok(())
    }
}
