//! In-memory pub/sub bus.
//!
//! One [`InMemoryBus`] stands in for a shared broker; each [`BusClient`] acts
//! like a separate process's connection to it. Publishing delivers to every
//! client subscribed to the channel, including the publisher.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{BackplaneError, PubSubTransport, SubscriptionCallback};

#[derive(Default)]
struct BusState {
    next_client: u64,
    /// channel -> (client id -> callback)
    channels: HashMap<String, HashMap<u64, SubscriptionCallback>>,
}

/// Shared in-process broker.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl fmt::Debug for InMemoryBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("InMemoryBus")
            .field("clients", &state.next_client)
            .field("channels", &state.channels.len())
            .finish()
    }
}

impl InMemoryBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// A new client of this bus.
    pub fn client(&self) -> BusClient {
        let mut state = self.lock();
        state.next_client += 1;
        BusClient {
            id: state.next_client,
            bus: self.clone(),
        }
    }

    /// Number of clients subscribed to `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.lock().channels.get(channel).map_or(0, HashMap::len)
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One process's handle on an [`InMemoryBus`].
pub struct BusClient {
    id: u64,
    bus: InMemoryBus,
}

impl fmt::Debug for BusClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusClient").field("id", &self.id).finish()
    }
}

impl Drop for BusClient {
    fn drop(&mut self) {
        let mut state = self.bus.lock();
        state.channels.retain(|_, subscribers| {
            subscribers.remove(&self.id);
            !subscribers.is_empty()
        });
    }
}

#[async_trait]
impl PubSubTransport for BusClient {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BackplaneError> {
        // Callbacks run outside the lock; they may publish or inspect the bus.
        let callbacks: Vec<SubscriptionCallback> = self
            .bus
            .lock()
            .channels
            .get(channel)
            .map(|subs| subs.values().cloned().collect())
            .unwrap_or_default();

        for callback in callbacks {
            callback(payload.clone());
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
        callback: SubscriptionCallback,
    ) -> Result<(), BackplaneError> {
        self.bus
            .lock()
            .channels
            .entry(channel.to_string())
            .or_default()
            .insert(self.id, callback);
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BackplaneError> {
        let mut state = self.bus.lock();
        if let Some(subscribers) = state.channels.get_mut(channel) {
            subscribers.remove(&self.id);
            if subscribers.is_empty() {
                state.channels.remove(channel);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, SubscriptionCallback) {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        let callback: SubscriptionCallback = Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (hits, callback)
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscribed_client() {
        let bus = InMemoryBus::new();
        let a = bus.client();
        let b = bus.client();
        let (hits_a, cb_a) = counter();
        let (hits_b, cb_b) = counter();
        a.subscribe("ch", cb_a).await.unwrap();
        b.subscribe("ch", cb_b).await.unwrap();

        a.publish("ch", b"x".to_vec()).await.unwrap();
        a.publish("other", b"x".to_vec()).await.unwrap();
        assert_eq!(hits_a.load(Ordering::SeqCst), 1);
        assert_eq!(hits_b.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count("ch"), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_drop_release_subscriptions() {
        let bus = InMemoryBus::new();
        let a = bus.client();
        let b = bus.client();
        let (_, cb) = counter();
        a.subscribe("ch", Arc::clone(&cb)).await.unwrap();
        b.subscribe("ch", cb).await.unwrap();

        a.unsubscribe("ch").await.unwrap();
        assert_eq!(bus.subscriber_count("ch"), 1);
        drop(b);
        assert_eq!(bus.subscriber_count("ch"), 0);
    }
}
