//! Table of in-flight requests awaiting a response from the agent.
//!
//! Each entry owns the sending half of a oneshot channel and the abort handle
//! of its deadline timer. An entry is settled by whoever removes it from the
//! map, so a response, a timeout and a disconnect racing for the same id
//! settle it exactly once; the losers find nothing to remove.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use agent_relay_core::{RelayError, RequestId};
use serde_json::Value;
use tokio::{sync::oneshot, task::AbortHandle};
use uuid::Uuid;

/// Final outcome delivered to the waiting caller.
pub type Outcome = Result<Value, RelayError>;

struct PendingEntry {
    tx: oneshot::Sender<Outcome>,
    timer: AbortHandle,
}

/// Pending-request table for one session.
///
/// Not durable: a process that is suspended and resumed starts with an empty
/// table, and callers of requests lost that way are never settled.
#[derive(Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<RequestId, PendingEntry>>,
}

impl PendingTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, PendingEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new entry with a fresh correlation id.
    ///
    /// The entry is rejected with [`RelayError::Timeout`] once `deadline`
    /// elapses unless it is settled first. Must be called within a Tokio
    /// runtime.
    pub fn register(self: &Arc<Self>, deadline: Duration) -> (RequestId, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        let request_id = Uuid::new_v4().to_string();

        // The timer may fire on another worker before `spawn` returns; holding
        // the guard makes its `expire` wait until the entry is in the map.
        let mut entries = self.lock();
        let table = Arc::downgrade(self);
        let timer_id = request_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if let Some(table) = table.upgrade() {
                table.expire(&timer_id);
            }
        })
        .abort_handle();
        entries.insert(request_id.clone(), PendingEntry { tx, timer });
        drop(entries);

        (request_id, rx)
    }

    /// Settle the entry for `request_id` with `outcome`.
    ///
    /// Returns `false` if no such entry exists (unknown id, or already
    /// settled by a timeout or disconnect).
    pub fn resolve(&self, request_id: &str, outcome: Outcome) -> bool {
        let Some(entry) = self.lock().remove(request_id) else {
            return false;
        };
        entry.timer.abort();
        // The caller may have stopped waiting; nothing to do then.
        let _ = entry.tx.send(outcome);
        true
    }

    fn expire(&self, request_id: &str) {
        if let Some(entry) = self.lock().remove(request_id) {
            tracing::warn!(request_id, "Request timed out waiting for agent response");
            let _ = entry.tx.send(Err(RelayError::Timeout));
        }
    }

    /// Reject every entry with `error` and clear the table.
    ///
    /// Returns the number of entries rejected.
    pub fn reject_all(&self, error: &RelayError) -> usize {
        let drained: Vec<PendingEntry> = self.lock().drain().map(|(_, entry)| entry).collect();
        let count = drained.len();
        for entry in drained {
            entry.timer.abort();
            let _ = entry.tx.send(Err(error.clone()));
        }
        count
    }

    /// Whether an entry with this id is still pending.
    #[must_use]
    pub fn contains(&self, request_id: &str) -> bool {
        self.lock().contains_key(request_id)
    }

    /// Number of pending entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_resolve_settles_once() {
        let table = PendingTable::new();
        let (id, rx) = table.register(Duration::from_secs(30));
        assert!(table.contains(&id));

        assert!(table.resolve(&id, Ok(json!({"ok": true}))));
        assert!(!table.resolve(&id, Ok(json!({"ok": false}))));
        assert!(table.is_empty());

        assert_eq!(rx.await.unwrap(), Ok(json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_receiver_pending_until_resolved() {
        let table = PendingTable::new();
        let (id, rx) = table.register(Duration::from_secs(30));
        let mut rx = tokio_test::task::spawn(rx);
        tokio_test::assert_pending!(rx.poll());

        table.resolve(&id, Ok(json!(7)));
        assert!(rx.is_woken());
        assert_eq!(tokio_test::assert_ready!(rx.poll()).unwrap(), Ok(json!(7)));
    }

    #[tokio::test]
    async fn test_unknown_id_is_ignored() {
        let table = PendingTable::new();
        assert!(!table.resolve("nope", Ok(Value::Null)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_rejects_with_timeout() {
        let table = PendingTable::new();
        let (id, rx) = table.register(Duration::from_secs(30));

        assert_eq!(rx.await.unwrap(), Err(RelayError::Timeout));
        assert!(!table.contains(&id));
        // Late response after the timeout is a no-op.
        assert!(!table.resolve(&id, Ok(Value::Null)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolved_entry_does_not_time_out() {
        let table = PendingTable::new();
        let (id, rx) = table.register(Duration::from_secs(1));
        assert!(table.resolve(&id, Ok(json!(1))));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(rx.await.unwrap(), Ok(json!(1)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_zero_deadline_always_times_out() {
        let table = PendingTable::new();
        let receivers: Vec<_> = (0..200).map(|_| table.register(Duration::ZERO).1).collect();

        for rx in receivers {
            let outcome = tokio::time::timeout(Duration::from_secs(5), rx)
                .await
                .expect("entry was never settled");
            assert_eq!(outcome.unwrap(), Err(RelayError::Timeout));
        }
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_reject_all_drains_table() {
        let table = PendingTable::new();
        let receivers: Vec<_> = (0..5)
            .map(|_| table.register(Duration::from_secs(30)).1)
            .collect();
        assert_eq!(table.len(), 5);

        assert_eq!(table.reject_all(&RelayError::AgentDisconnected), 5);
        assert!(table.is_empty());

        for rx in receivers {
            assert_eq!(rx.await.unwrap(), Err(RelayError::AgentDisconnected));
        }
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let table = PendingTable::new();
        let ids: std::collections::HashSet<_> = (0..100)
            .map(|_| table.register(Duration::from_secs(30)).0)
            .collect();
        assert_eq!(ids.len(), 100);
        assert_eq!(table.len(), 100);
    }
}
