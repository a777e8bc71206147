//! Per-activation hub context and client proxies.

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::backplane::Backplane;
use crate::connection::{Connection, ConnectionId, Identity};
use crate::protocol::{InvocationDescriptor, IntoArguments, Message};

use super::HubError;

/// Where a server-initiated message goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchTarget {
    /// Every connection in every process.
    All,
    /// Members of a group.
    Group(String),
    /// One connection.
    Connection(ConnectionId),
}

/// Sends to one [`DispatchTarget`] through the backplane.
///
/// Server-to-client invocations are fire-and-forget: no id, no result.
#[derive(Clone)]
pub struct ClientProxy {
    backplane: Arc<dyn Backplane>,
    target: DispatchTarget,
}

impl fmt::Debug for ClientProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientProxy")
            .field("backplane", &self.backplane.name())
            .field("target", &self.target)
            .finish()
    }
}

impl ClientProxy {
    pub(crate) fn new(backplane: Arc<dyn Backplane>, target: DispatchTarget) -> Self {
        Self { backplane, target }
    }

    /// Target of this proxy.
    pub fn target(&self) -> &DispatchTarget {
        &self.target
    }

    /// Invoke `method` on every targeted client.
    pub async fn invoke(&self, method: &str, args: impl IntoArguments) -> Result<(), HubError> {
        let descriptor = InvocationDescriptor::notification(method, args.into_arguments()?);
        self.dispatch(&Message::invocation(&descriptor)?).await
    }

    /// Push free-form text to every targeted client.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), HubError> {
        self.dispatch(&Message::text(text)).await
    }

    async fn dispatch(&self, message: &Message) -> Result<(), HubError> {
        match &self.target {
            DispatchTarget::All => self.backplane.send_to_all(message).await?,
            DispatchTarget::Group(group) => self.backplane.send_to_group(group, message).await?,
            DispatchTarget::Connection(id) => {
                self.backplane.send_to_connection(id, message).await?;
            }
        }
        Ok(())
    }
}

/// Client proxies available to a hub activation.
#[derive(Clone)]
pub struct HubClients {
    backplane: Arc<dyn Backplane>,
    caller: ConnectionId,
}

impl fmt::Debug for HubClients {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubClients")
            .field("caller", &self.caller)
            .finish_non_exhaustive()
    }
}

impl HubClients {
    /// Every connected client.
    pub fn all(&self) -> ClientProxy {
        self.proxy(DispatchTarget::All)
    }

    /// Members of `group`.
    pub fn group(&self, group: impl Into<String>) -> ClientProxy {
        self.proxy(DispatchTarget::Group(group.into()))
    }

    /// One client by connection id.
    pub fn client(&self, id: &ConnectionId) -> ClientProxy {
        self.proxy(DispatchTarget::Connection(id.clone()))
    }

    /// The client that triggered this activation.
    pub fn caller(&self) -> ClientProxy {
        self.proxy(DispatchTarget::Connection(self.caller.clone()))
    }

    fn proxy(&self, target: DispatchTarget) -> ClientProxy {
        ClientProxy::new(Arc::clone(&self.backplane), target)
    }
}

/// Group membership operations.
#[derive(Clone)]
pub struct GroupManager {
    backplane: Arc<dyn Backplane>,
}

impl fmt::Debug for GroupManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupManager")
            .field("backplane", &self.backplane.name())
            .finish()
    }
}

impl GroupManager {
    /// Add a connection to a group.
    pub async fn add(&self, group: &str, id: &ConnectionId) -> Result<(), HubError> {
        self.backplane.subscribe(group, id).await?;
        Ok(())
    }

    /// Remove a connection from a group.
    pub async fn remove(&self, group: &str, id: &ConnectionId) -> Result<(), HubError> {
        self.backplane.unsubscribe(group, id).await?;
        Ok(())
    }

    /// Local members of a group.
    pub async fn members(&self, group: &str) -> Vec<ConnectionId> {
        self.backplane.group_members(group).await
    }
}

/// Everything a hub activation can reach.
#[derive(Clone)]
pub struct HubContext {
    connection: Arc<Connection>,
    clients: HubClients,
    groups: GroupManager,
}

impl fmt::Debug for HubContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubContext")
            .field("connection", &self.connection.id())
            .finish_non_exhaustive()
    }
}

impl HubContext {
    pub(crate) fn new(connection: Arc<Connection>, backplane: Arc<dyn Backplane>) -> Self {
        Self {
            clients: HubClients {
                backplane: Arc::clone(&backplane),
                caller: connection.id().clone(),
            },
            groups: GroupManager { backplane },
            connection,
        }
    }

    /// The calling connection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// The calling connection's id.
    pub fn connection_id(&self) -> &ConnectionId {
        self.connection.id()
    }

    /// Caller identity, if any.
    pub fn identity(&self) -> Option<&Identity> {
        self.connection.identity()
    }

    /// Client proxies.
    pub fn clients(&self) -> &HubClients {
        &self.clients
    }

    /// Group operations.
    pub fn groups(&self) -> &GroupManager {
        &self.groups
    }

    /// Fires when the calling connection goes away.
    pub fn cancellation(&self) -> CancellationToken {
        self.connection.cancellation()
    }
}
