//! Cross-process message fan-out.
//!
//! A [`Backplane`] routes server-initiated messages to connections by id, by
//! group, or to everyone. Messages for connections owned by this process come
//! out of the delivery stream ([`Backplane::take_delivery_receiver`]); the
//! dispatcher drains it and writes to the matching channel.
//!
//! Two variants share one membership model ([`GroupMembership`]):
//!
//! - [`LocalBackplane`]: single process, in-memory fan-out.
//! - [`PubSubBackplane`]: publishes to a [`PubSubTransport`] so every process
//!   subscribed to the channel delivers to its own local connections.
//!
//! # Channel naming (pub/sub)
//!
//! ```text
//! {prefix}:all               every process, taken at construction
//! {prefix}:connection:{id}   while the connection is live here
//! {prefix}:group:{name}      while the group has a local member
//! ```

pub mod local;
pub mod membership;
pub mod memory;
pub mod pubsub;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::connection::ConnectionId;
use crate::protocol::{Message, ProtocolError};

pub use local::LocalBackplane;
pub use membership::GroupMembership;
pub use memory::{BusClient, InMemoryBus};
pub use pubsub::{PubSubBackplane, PubSubTransport, SubscriptionCallback};

/// Errors raised by backplane operations.
#[derive(Debug, thiserror::Error)]
pub enum BackplaneError {
    /// The connection is not owned by this process.
    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// The pub/sub transport failed.
    #[error("pub/sub transport error: {0}")]
    Transport(String),

    /// A published payload could not be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// A message addressed to one local connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Target connection.
    pub connection_id: ConnectionId,
    /// Message to write.
    pub message: Message,
}

/// Receiving end of a backplane's delivery stream.
pub type DeliveryReceiver = mpsc::UnboundedReceiver<Delivery>;

/// Fan-out contract shared by every backplane variant.
#[async_trait]
pub trait Backplane: Send + Sync + 'static {
    /// Short variant name for logs.
    fn name(&self) -> &'static str;

    /// A connection became live in this process.
    async fn on_client_connected(&self, id: &ConnectionId) -> Result<(), BackplaneError>;

    /// A connection went away: drop it from every group and subscription.
    async fn on_client_disconnected(&self, id: &ConnectionId) -> Result<(), BackplaneError>;

    /// Add a local connection to a group.
    async fn subscribe(&self, group: &str, id: &ConnectionId) -> Result<(), BackplaneError>;

    /// Remove a connection from a group. Unknown pairs are a no-op.
    async fn unsubscribe(&self, group: &str, id: &ConnectionId) -> Result<(), BackplaneError>;

    /// Send to every connection.
    async fn send_to_all(&self, message: &Message) -> Result<(), BackplaneError>;

    /// Send to one connection, wherever it lives.
    async fn send_to_connection(
        &self,
        id: &ConnectionId,
        message: &Message,
    ) -> Result<(), BackplaneError>;

    /// Send to every member of a group.
    async fn send_to_group(&self, group: &str, message: &Message) -> Result<(), BackplaneError>;

    /// Local members of a group.
    async fn group_members(&self, group: &str) -> Vec<ConnectionId>;

    /// Take the delivery stream. Only the first call gets it.
    fn take_delivery_receiver(&self) -> Option<DeliveryReceiver>;
}

/// Send one delivery per target into the delivery stream.
///
/// A closed stream means nobody is draining; deliveries are dropped.
pub(crate) fn deliver_all(
    tx: &mpsc::UnboundedSender<Delivery>,
    targets: impl IntoIterator<Item = ConnectionId>,
    message: &Message,
) {
    for connection_id in targets {
        let delivery = Delivery {
            connection_id,
            message: message.clone(),
        };
        if tx.send(delivery).is_err() {
            log::trace!("[Backplane] delivery stream closed, dropping message");
            return;
        }
    }
}
