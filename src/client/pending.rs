//! Outstanding client calls keyed by correlation id.
//!
//! Every transition (register, complete, cancel, fail-all) happens under one
//! lock, so a call resolves at most once no matter how results, cancellations
//! and disposal race.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::oneshot;

/// Why a call failed without a result value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallFailure {
    /// The server answered with an error.
    Remote(String),
    /// The connection closed first.
    ConnectionClosed,
}

/// Receiving half handed to the caller.
pub type CallReceiver = oneshot::Receiver<Result<Value, CallFailure>>;

#[derive(Debug)]
struct PendingCall {
    method: String,
    tx: oneshot::Sender<Result<Value, CallFailure>>,
}

#[derive(Debug, Default)]
struct Inner {
    calls: HashMap<u64, PendingCall>,
    closed: bool,
}

/// Table of in-flight calls.
#[derive(Debug, Default)]
pub struct PendingCalls {
    inner: Mutex<Inner>,
}

impl PendingCalls {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a call. Returns `None` once the table has been failed.
    pub fn register(&self, id: u64, method: &str) -> Option<CallReceiver> {
        let mut inner = self.lock();
        if inner.closed {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        inner.calls.insert(
            id,
            PendingCall {
                method: method.to_string(),
                tx,
            },
        );
        Some(rx)
    }

    /// Resolve a call. Returns `false` for unknown or already-resolved ids.
    pub fn complete(&self, id: u64, outcome: Result<Value, CallFailure>) -> bool {
        let mut inner = self.lock();
        let Some(call) = inner.calls.remove(&id) else {
            return false;
        };
        if call.tx.send(outcome).is_err() {
            log::debug!("[Client] caller of '{}' ({id}) went away", call.method);
        }
        true
    }

    /// Drop a call without resolving it. Returns whether it was still pending.
    pub fn cancel(&self, id: u64) -> bool {
        self.lock().calls.remove(&id).is_some()
    }

    /// Fail every call with [`CallFailure::ConnectionClosed`] and refuse new
    /// ones.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<PendingCall> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.calls.drain().map(|(_, call)| call).collect()
        };
        let count = drained.len();
        for call in drained {
            let _ = call.tx.send(Err(CallFailure::ConnectionClosed));
        }
        if count > 0 {
            log::debug!("[Client] failed {count} pending call(s) on close");
        }
        count
    }

    /// Number of calls awaiting a result.
    pub fn len(&self) -> usize {
        self.lock().calls.len()
    }

    /// Whether no calls are pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_complete_resolves_once() {
        let pending = PendingCalls::new();
        let rx = pending.register(1, "Add").unwrap();

        assert!(pending.complete(1, Ok(json!(3))));
        assert!(!pending.complete(1, Ok(json!(4))));
        assert_eq!(rx.await.unwrap(), Ok(json!(3)));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_unknown_id_is_ignored() {
        let pending = PendingCalls::new();
        assert!(!pending.complete(42, Err(CallFailure::Remote("x".into()))));
    }

    #[tokio::test]
    async fn test_cancel_then_late_result() {
        let pending = PendingCalls::new();
        let rx = pending.register(7, "Slow").unwrap();

        assert!(pending.cancel(7));
        assert!(!pending.complete(7, Ok(json!(null))));
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_fail_all_closes_table() {
        let pending = PendingCalls::new();
        let a = pending.register(1, "A").unwrap();
        let b = pending.register(2, "B").unwrap();

        assert_eq!(pending.fail_all(), 2);
        assert_eq!(a.await.unwrap(), Err(CallFailure::ConnectionClosed));
        assert_eq!(b.await.unwrap(), Err(CallFailure::ConnectionClosed));
        assert!(pending.register(3, "C").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_transitions_resolve_once() {
        use std::sync::Arc;
        use tokio::sync::Barrier;

        for round in 0..200u64 {
            let pending = Arc::new(PendingCalls::new());
            let rx = pending.register(round, "Race").unwrap();
            let barrier = Arc::new(Barrier::new(3));

            let complete = tokio::spawn({
                let (pending, barrier) = (Arc::clone(&pending), Arc::clone(&barrier));
                async move {
                    barrier.wait().await;
                    pending.complete(round, Ok(json!(round)))
                }
            });
            let cancel = tokio::spawn({
                let (pending, barrier) = (Arc::clone(&pending), Arc::clone(&barrier));
                async move {
                    barrier.wait().await;
                    pending.cancel(round)
                }
            });
            let fail = tokio::spawn({
                let (pending, barrier) = (Arc::clone(&pending), Arc::clone(&barrier));
                async move {
                    barrier.wait().await;
                    pending.fail_all() == 1
                }
            });

            let completed = complete.await.unwrap();
            let cancelled = cancel.await.unwrap();
            let failed = fail.await.unwrap();
            let winners = [completed, cancelled, failed].iter().filter(|w| **w).count();
            assert_eq!(winners, 1, "round {round}");

            match rx.await {
                Ok(Ok(value)) => assert!(completed && value == json!(round)),
                Ok(Err(CallFailure::ConnectionClosed)) => assert!(failed),
                Ok(Err(other)) => panic!("unexpected failure {other:?}"),
                Err(_) => assert!(cancelled),
            }
            assert!(pending.is_empty());
        }
    }
}
