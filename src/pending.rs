//! Pending-request table: request id → suspended ingress response (spec §4.E).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

/// The response an ingress task is waiting to relay back to its caller.
#[derive(Debug, Clone)]
pub struct ServedResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl ServedResponse {
    pub fn gateway_timeout() -> Self {
        Self { status: 504, headers: HashMap::new(), body: b"Gateway Timeout".to_vec() }
    }
}

/// Owning identity of a pending request, carried so the control handler
/// can attribute the eventual response to the right counters without a
/// second lookup (spec §3 "Pending request").
#[derive(Debug, Clone)]
pub struct Owner {
    pub token: String,
    pub alias: Option<String>,
}

struct Slot {
    sender: oneshot::Sender<ServedResponse>,
    owner: Owner,
}

/// Request id → waiting ingress response. `DashMap::remove` is the single
/// atomic operation that decides which of {complete, cancel, timer} wins
/// for a given id — the others simply find nothing left to remove.
pub struct PendingTable {
    entries: dashmap::DashMap<String, Slot>,
}

impl PendingTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { entries: dashmap::DashMap::new() })
    }

    /// Registers a pending entry for `id` and starts its single-shot
    /// deadline timer. Returns the receiving half the ingress task awaits,
    /// and a guard that cancels the entry if the ingress task is dropped
    /// before the response arrives (cooperative cancellation, spec §9).
    pub fn allocate(
        self: &Arc<Self>,
        id: String,
        owner: Owner,
        timeout: Duration,
    ) -> (oneshot::Receiver<ServedResponse>, PendingGuard) {
        let (tx, rx) = oneshot::channel();
        self.entries.insert(id.clone(), Slot { sender: tx, owner });

        let table = self.clone();
        let timer_id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            table.fire_timeout(&timer_id);
        });

        let guard = PendingGuard { table: self.clone(), id };
        (rx, guard)
    }

    fn fire_timeout(&self, id: &str) {
        if let Some((_, slot)) = self.entries.remove(id) {
            let _ = slot.sender.send(ServedResponse::gateway_timeout());
        }
    }

    /// Delivers a response frame to the waiting ingress task, returning the
    /// owner it was allocated under so the caller can attribute response
    /// traffic counters correctly. A `response` whose id is not pending
    /// (already completed, cancelled, or timed out) is logged and dropped
    /// without side effects (spec §4.E, §8).
    pub fn complete(
        &self,
        id: &str,
        status: u16,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    ) -> Option<Owner> {
        match self.entries.remove(id) {
            Some((_, slot)) => {
                let owner = slot.owner;
                let _ = slot.sender.send(ServedResponse { status, headers, body });
                Some(owner)
            }
            None => {
                debug!(%id, "response frame for unknown or already-settled pending id, dropped");
                None
            }
        }
    }

    /// Called when the ingress connection closes before completion.
    pub fn cancel(&self, id: &str) {
        self.entries.remove(id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Cancels its entry on drop unless the response has already been
/// delivered or timed out (in which case the entry is already gone and
/// this is a harmless no-op).
pub struct PendingGuard {
    table: Arc<PendingTable>,
    id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.table.cancel(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn complete_delivers_the_response() {
        let table = PendingTable::new();
        let owner = Owner { token: "tok-1".to_string(), alias: None };
        let (rx, _guard) = table.allocate("req-1".to_string(), owner, Duration::from_secs(30));
        let completed = table.complete("req-1", 200, HashMap::new(), b"pong".to_vec());
        assert_eq!(completed.unwrap().token, "tok-1");
        let resp = rx.await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"pong");
    }

    #[tokio::test]
    async fn unknown_id_completion_is_a_noop() {
        let table = PendingTable::new();
        assert!(table.complete("ghost", 200, HashMap::new(), vec![]).is_none());
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn timeout_synthesizes_a_504() {
        let table = PendingTable::new();
        let owner = Owner { token: "tok-1".to_string(), alias: None };
        let (rx, _guard) = table.allocate("req-1".to_string(), owner, Duration::from_millis(10));
        let resp = rx.await.unwrap();
        assert_eq!(resp.status, 504);
    }

    #[tokio::test]
    async fn late_response_after_timeout_is_dropped() {
        let table = PendingTable::new();
        let owner = Owner { token: "tok-1".to_string(), alias: None };
        let (rx, _guard) = table.allocate("req-1".to_string(), owner, Duration::from_millis(10));
        let resp = rx.await.unwrap();
        assert_eq!(resp.status, 504);
        // The timer already removed the entry; a late `response` frame
        // finds nothing to complete.
        assert!(table.complete("req-1", 200, HashMap::new(), vec![]).is_none());
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn dropping_the_guard_cancels_the_entry() {
        let table = PendingTable::new();
        {
            let owner = Owner { token: "tok-1".to_string(), alias: None };
            let (_rx, _guard) = table.allocate("req-1".to_string(), owner, Duration::from_secs(30));
            assert_eq!(table.len(), 1);
        }
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn two_concurrent_completions_leave_exactly_one_winner() {
        let table = PendingTable::new();
        let owner = Owner { token: "tok-1".to_string(), alias: Some("alias-1".to_string()) };
        let (rx, _guard) = table.allocate("req-1".to_string(), owner, Duration::from_millis(20));
        // Racing completion against the timeout: whichever wins the
        // DashMap::remove races, the other becomes a no-op.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let completed = table.complete("req-1", 200, HashMap::new(), b"hi".to_vec());
        assert_eq!(completed.unwrap().alias.as_deref(), Some("alias-1"));
        let resp = rx.await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(table.len(), 0);
    }
}
