//! Multi-process backplane over a pub/sub transport.
//!
//! Every send publishes the encoded [`Message`] on a named channel; every
//! process subscribed to that channel turns it into deliveries for its own
//! local connections. Subscriptions follow membership exactly:
//!
//! - `{prefix}:all` is subscribed once, at construction.
//! - `{prefix}:connection:{id}` lives as long as the connection is local.
//! - `{prefix}:group:{name}` is taken by the first local member and released
//!   when the last local member leaves.
//!
//! Transitions are serialized by an async lock that is held across the
//! transport call and the membership update, so a subscribe racing an
//! unsubscribe for the same group can never leave a dangling subscription.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::connection::ConnectionId;
use crate::protocol::Message;

use super::{deliver_all, Backplane, BackplaneError, Delivery, DeliveryReceiver, GroupMembership};

/// Callback invoked with each payload published on a subscribed channel.
pub type SubscriptionCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Minimal pub/sub client (Redis-style channels).
#[async_trait]
pub trait PubSubTransport: Send + Sync + 'static {
    /// Publish a payload to every subscriber of `channel`.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BackplaneError>;

    /// Subscribe this client to `channel`. Re-subscribing replaces the callback.
    async fn subscribe(
        &self,
        channel: &str,
        callback: SubscriptionCallback,
    ) -> Result<(), BackplaneError>;

    /// Drop this client's subscription to `channel`.
    async fn unsubscribe(&self, channel: &str) -> Result<(), BackplaneError>;
}

type SharedMembership = Arc<Mutex<GroupMembership>>;

fn lock(membership: &SharedMembership) -> MutexGuard<'_, GroupMembership> {
    membership.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Decode a published payload, logging and dropping garbage.
fn decode(channel: &str, payload: &[u8]) -> Option<Message> {
    match Message::decode(payload) {
        Ok(message) => Some(message),
        Err(e) => {
            log::warn!("[Backplane] undecodable payload on {channel}: {e}");
            None
        }
    }
}

/// Backplane that spans processes through a [`PubSubTransport`].
pub struct PubSubBackplane {
    transport: Arc<dyn PubSubTransport>,
    prefix: String,
    membership: SharedMembership,
    transitions: tokio::sync::Mutex<()>,
    tx: mpsc::UnboundedSender<Delivery>,
    rx: Mutex<Option<DeliveryReceiver>>,
}

impl fmt::Debug for PubSubBackplane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSubBackplane")
            .field("prefix", &self.prefix)
            .field("membership", &*lock(&self.membership))
            .finish_non_exhaustive()
    }
}

impl PubSubBackplane {
    /// Create the backplane and take the process-wide `{prefix}:all`
    /// subscription.
    pub async fn connect(
        transport: Arc<dyn PubSubTransport>,
        prefix: impl Into<String>,
    ) -> Result<Self, BackplaneError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let backplane = Self {
            transport,
            prefix: prefix.into(),
            membership: Arc::new(Mutex::new(GroupMembership::new())),
            transitions: tokio::sync::Mutex::new(()),
            tx,
            rx: Mutex::new(Some(rx)),
        };

        let channel = backplane.all_channel();
        let membership = Arc::clone(&backplane.membership);
        let tx = backplane.tx.clone();
        let name = channel.clone();
        let callback: SubscriptionCallback = Arc::new(move |payload| {
            if let Some(message) = decode(&name, &payload) {
                let targets = lock(&membership).connections();
                deliver_all(&tx, targets, &message);
            }
        });
        backplane.transport.subscribe(&channel, callback).await?;
        log::info!("[Backplane] pub/sub backplane ready on {channel}");
        Ok(backplane)
    }

    /// Create the backplane with the channel prefix from `config`.
    pub async fn from_config(
        transport: Arc<dyn PubSubTransport>,
        config: &Config,
    ) -> Result<Self, BackplaneError> {
        Self::connect(transport, config.backplane.channel_prefix.clone()).await
    }

    /// Channel prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn all_channel(&self) -> String {
        format!("{}:all", self.prefix)
    }

    fn connection_channel(&self, id: &ConnectionId) -> String {
        format!("{}:connection:{id}", self.prefix)
    }

    fn group_channel(&self, group: &str) -> String {
        format!("{}:group:{group}", self.prefix)
    }

    fn connection_callback(&self, id: &ConnectionId) -> SubscriptionCallback {
        let membership = Arc::clone(&self.membership);
        let tx = self.tx.clone();
        let id = id.clone();
        Arc::new(move |payload| {
            let Some(message) = decode(id.as_str(), &payload) else {
                return;
            };
            if lock(&membership).contains(&id) {
                deliver_all(&tx, [id.clone()], &message);
            }
        })
    }

    fn group_callback(&self, group: &str) -> SubscriptionCallback {
        let membership = Arc::clone(&self.membership);
        let tx = self.tx.clone();
        let group = group.to_string();
        Arc::new(move |payload| {
            if let Some(message) = decode(&group, &payload) {
                let targets = lock(&membership).members(&group);
                deliver_all(&tx, targets, &message);
            }
        })
    }

    async fn publish(&self, channel: String, message: &Message) -> Result<(), BackplaneError> {
        let payload = message.encode()?;
        log::trace!("[Backplane] publish {} bytes to {channel}", payload.len());
        self.transport.publish(&channel, payload).await
    }
}

#[async_trait]
impl Backplane for PubSubBackplane {
    fn name(&self) -> &'static str {
        "pubsub"
    }

    async fn on_client_connected(&self, id: &ConnectionId) -> Result<(), BackplaneError> {
        let _transition = self.transitions.lock().await;
        self.transport
            .subscribe(&self.connection_channel(id), self.connection_callback(id))
            .await?;
        lock(&self.membership).add_connection(id.clone());
        Ok(())
    }

    async fn on_client_disconnected(&self, id: &ConnectionId) -> Result<(), BackplaneError> {
        let _transition = self.transitions.lock().await;
        let emptied = lock(&self.membership).remove_connection(id);

        let mut first_error = None;
        let channels = std::iter::once(self.connection_channel(id))
            .chain(emptied.iter().map(|g| self.group_channel(g)));
        for channel in channels {
            if let Err(e) = self.transport.unsubscribe(&channel).await {
                log::error!("[Backplane] failed to unsubscribe {channel}: {e}");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn subscribe(&self, group: &str, id: &ConnectionId) -> Result<(), BackplaneError> {
        let _transition = self.transitions.lock().await;
        let needs_channel = {
            let membership = lock(&self.membership);
            if !membership.contains(id) {
                return Err(BackplaneError::UnknownConnection(id.clone()));
            }
            !membership.has_group(group)
        };

        if needs_channel {
            self.transport
                .subscribe(&self.group_channel(group), self.group_callback(group))
                .await?;
            log::debug!("[Backplane] subscribed {}", self.group_channel(group));
        }
        lock(&self.membership).subscribe(group, id)?;
        Ok(())
    }

    async fn unsubscribe(&self, group: &str, id: &ConnectionId) -> Result<(), BackplaneError> {
        let _transition = self.transitions.lock().await;
        let emptied = lock(&self.membership).unsubscribe(group, id);
        if emptied {
            self.transport.unsubscribe(&self.group_channel(group)).await?;
            log::debug!("[Backplane] unsubscribed {}", self.group_channel(group));
        }
        Ok(())
    }

    async fn send_to_all(&self, message: &Message) -> Result<(), BackplaneError> {
        self.publish(self.all_channel(), message).await
    }

    async fn send_to_connection(
        &self,
        id: &ConnectionId,
        message: &Message,
    ) -> Result<(), BackplaneError> {
        self.publish(self.connection_channel(id), message).await
    }

    async fn send_to_group(&self, group: &str, message: &Message) -> Result<(), BackplaneError> {
        self.publish(self.group_channel(group), message).await
    }

    async fn group_members(&self, group: &str) -> Vec<ConnectionId> {
        lock(&self.membership).members(group)
    }

    fn take_delivery_receiver(&self) -> Option<DeliveryReceiver> {
        self.rx.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}
