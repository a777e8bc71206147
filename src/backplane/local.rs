//! Single-process backplane.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::connection::ConnectionId;
use crate::protocol::Message;

use super::{deliver_all, Backplane, BackplaneError, Delivery, DeliveryReceiver, GroupMembership};

/// In-memory fan-out to connections owned by this process.
#[derive(Debug)]
pub struct LocalBackplane {
    membership: Mutex<GroupMembership>,
    tx: mpsc::UnboundedSender<Delivery>,
    rx: Mutex<Option<DeliveryReceiver>>,
}

impl Default for LocalBackplane {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBackplane {
    /// Create an empty backplane.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            membership: Mutex::new(GroupMembership::new()),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    fn membership(&self) -> std::sync::MutexGuard<'_, GroupMembership> {
        self.membership.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Backplane for LocalBackplane {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn on_client_connected(&self, id: &ConnectionId) -> Result<(), BackplaneError> {
        self.membership().add_connection(id.clone());
        Ok(())
    }

    async fn on_client_disconnected(&self, id: &ConnectionId) -> Result<(), BackplaneError> {
        let emptied = self.membership().remove_connection(id);
        if !emptied.is_empty() {
            log::trace!("[Backplane] {id} left, destroyed groups {emptied:?}");
        }
        Ok(())
    }

    async fn subscribe(&self, group: &str, id: &ConnectionId) -> Result<(), BackplaneError> {
        if self.membership().subscribe(group, id)? {
            log::trace!("[Backplane] group {group} created");
        }
        Ok(())
    }

    async fn unsubscribe(&self, group: &str, id: &ConnectionId) -> Result<(), BackplaneError> {
        if self.membership().unsubscribe(group, id) {
            log::trace!("[Backplane] group {group} destroyed");
        }
        Ok(())
    }

    async fn send_to_all(&self, message: &Message) -> Result<(), BackplaneError> {
        let targets = self.membership().connections();
        deliver_all(&self.tx, targets, message);
        Ok(())
    }

    async fn send_to_connection(
        &self,
        id: &ConnectionId,
        message: &Message,
    ) -> Result<(), BackplaneError> {
        if !self.membership().contains(id) {
            log::debug!("[Backplane] no local connection {id}, dropping message");
            return Ok(());
        }
        deliver_all(&self.tx, [id.clone()], message);
        Ok(())
    }

    async fn send_to_group(&self, group: &str, message: &Message) -> Result<(), BackplaneError> {
        let targets = self.membership().members(group);
        deliver_all(&self.tx, targets, message);
        Ok(())
    }

    async fn group_members(&self, group: &str) -> Vec<ConnectionId> {
        self.membership().members(group)
    }

    fn take_delivery_receiver(&self) -> Option<DeliveryReceiver> {
        self.rx.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ConnectionId {
        ConnectionId::from(s)
    }

    fn drain(rx: &mut DeliveryReceiver) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(d) = rx.try_recv() {
            out.push(d.connection_id.to_string());
        }
        out.sort();
        out
    }

    #[tokio::test]
    async fn test_group_fanout_reaches_members_only() {
        let bp = LocalBackplane::new();
        let mut rx = bp.take_delivery_receiver().unwrap();
        for c in ["a", "b", "c"] {
            bp.on_client_connected(&id(c)).await.unwrap();
        }
        bp.subscribe("room", &id("a")).await.unwrap();
        bp.subscribe("room", &id("b")).await.unwrap();

        bp.send_to_group("room", &Message::text("hi")).await.unwrap();
        assert_eq!(drain(&mut rx), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_send_to_all_and_connection() {
        let bp = LocalBackplane::new();
        let mut rx = bp.take_delivery_receiver().unwrap();
        bp.on_client_connected(&id("a")).await.unwrap();
        bp.on_client_connected(&id("b")).await.unwrap();

        bp.send_to_all(&Message::text("all")).await.unwrap();
        assert_eq!(drain(&mut rx), vec!["a", "b"]);

        bp.send_to_connection(&id("b"), &Message::text("one")).await.unwrap();
        bp.send_to_connection(&id("zzz"), &Message::text("nobody")).await.unwrap();
        assert_eq!(drain(&mut rx), vec!["b"]);
    }

    #[tokio::test]
    async fn test_disconnect_clears_groups() {
        let bp = LocalBackplane::new();
        let mut rx = bp.take_delivery_receiver().unwrap();
        bp.on_client_connected(&id("a")).await.unwrap();
        bp.subscribe("room", &id("a")).await.unwrap();

        bp.on_client_disconnected(&id("a")).await.unwrap();
        assert!(bp.group_members("room").await.is_empty());
        bp.send_to_group("room", &Message::text("hi")).await.unwrap();
        assert!(drain(&mut rx).is_empty());

        let err = bp.subscribe("room", &id("a")).await.unwrap_err();
        assert!(matches!(err, BackplaneError::UnknownConnection(_)));
    }

    #[test]
    fn test_delivery_receiver_taken_once() {
        let bp = LocalBackplane::new();
        assert!(bp.take_delivery_receiver().is_some());
        assert!(bp.take_delivery_receiver().is_none());
    }
}
