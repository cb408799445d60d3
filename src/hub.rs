//! Broker hub — registry of live terminal sessions, custodian of the
//! per-assessment lock table, and shutdown coordinator.
//!
//! The hub owns the set of live [`Session`](crate::ws) connections and the
//! assessment-keyed lock table used by the workload manager to serialise
//! pod lookup-or-create decisions. It never parses message payloads and
//! never touches the cluster.
//!
//! ## Concurrency
//!
//! The session registry is behind an `RwLock` held only for register /
//! deregister / listing, never across an await that can block on I/O.
//! The lock table's outer mutex is held only for lookup-or-create of an
//! inner lock; the inner locks themselves are handed out as `Arc`s and
//! acquired by callers after the outer mutex is released.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::{info, warn};

use crate::ws::protocol::Outbound;

/// A registered session as seen by the hub: identity plus the sending end
/// of its outbound queue.
pub struct SessionHandle {
    pub assessment_id: String,
    pub session_id: String,
    /// Sender half of the session's outbound queue. Dropped on deregister,
    /// which lets the writer task drain and close the socket once the
    /// session's own producers are gone.
    pub outbound: mpsc::Sender<Outbound>,
}

/// Keyed lock table: one mutex per assessment id, created on first use.
///
/// The table grows monotonically and is never pruned — assessment ids are
/// bounded and sparse, and a forgotten `Arc<Mutex<()>>` is a few dozen
/// bytes.
#[derive(Default)]
pub struct AssessmentLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AssessmentLocks {
    /// Return the unique lock for this assessment id, creating it on first
    /// use. The returned lock must be acquired *after* this call returns;
    /// the outer table mutex is never held while an inner lock is held.
    pub async fn lock_for(&self, assessment_id: &str) -> Arc<Mutex<()>> {
        let mut table = self.inner.lock().await;
        Arc::clone(
            table
                .entry(assessment_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Number of distinct assessment ids seen so far.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

/// Registry of live sessions plus the shutdown broadcast.
///
/// Cloneable via `Arc`; every WebSocket connection registers itself under a
/// connection-unique id on upgrade and deregisters exactly once on close.
pub struct BrokerHub {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    locks: Arc<AssessmentLocks>,
    shutdown: broadcast::Sender<()>,
}

impl Default for BrokerHub {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerHub {
    pub fn new() -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            sessions: RwLock::new(HashMap::new()),
            locks: Arc::new(AssessmentLocks::default()),
            shutdown,
        }
    }

    /// The assessment lock table, shared with the workload manager.
    pub fn locks(&self) -> Arc<AssessmentLocks> {
        Arc::clone(&self.locks)
    }

    /// Subscribe to the shutdown signal. Every long-lived session task
    /// selects on this.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Add a session to the live set under its connection id.
    pub async fn register(&self, connection_id: &str, handle: SessionHandle) {
        let mut sessions = self.sessions.write().await;
        sessions.insert(connection_id.to_string(), handle);
        info!("Session registered, total: {}", sessions.len());
    }

    /// Remove a session from the live set, dropping the hub's half of its
    /// outbound queue. Safe to call more than once; only the first call
    /// removes anything.
    pub async fn deregister(&self, connection_id: &str) {
        let mut sessions = self.sessions.write().await;
        if sessions.remove(connection_id).is_some() {
            info!("Session deregistered, remaining: {}", sessions.len());
        }
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Snapshot of live sessions as `(assessment_id, session_id)` pairs.
    pub async fn list_sessions(&self) -> Vec<(String, String)> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .map(|h| (h.assessment_id.clone(), h.session_id.clone()))
            .collect()
    }

    /// Broadcast the shutdown signal and wait for every session to
    /// deregister, up to `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        let count = self.session_count().await;
        if count > 0 {
            info!("Shutting down {count} live session(s)");
        }
        let _ = self.shutdown.send(());

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.session_count().await == 0 {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "Shutdown timed out with {} session(s) still live",
                    self.session_count().await
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_table_returns_same_lock_for_same_id() {
        let locks = AssessmentLocks::default();
        let a = locks.lock_for("asmt-1").await;
        let b = locks.lock_for("asmt-1").await;
        let c = locks.lock_for("asmt-2").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(locks.len().await, 2);
    }

    #[tokio::test]
    async fn lock_serialises_holders() {
        let locks = Arc::new(AssessmentLocks::default());
        let lock = locks.lock_for("asmt-1").await;

        let guard = lock.lock().await;
        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let lock = locks.lock_for("asmt-1").await;
                let _guard = lock.lock().await;
            })
        };
        // The contender cannot finish while the guard is held.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());
        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn deregister_is_idempotent() {
        let hub = BrokerHub::new();
        let (tx, _rx) = mpsc::channel(1);
        hub.register(
            "conn-1",
            SessionHandle {
                assessment_id: "asmt-1".to_string(),
                session_id: "sess-1".to_string(),
                outbound: tx,
            },
        )
        .await;
        assert_eq!(hub.session_count().await, 1);
        hub.deregister("conn-1").await;
        hub.deregister("conn-1").await;
        assert_eq!(hub.session_count().await, 0);
    }

    #[tokio::test]
    async fn shutdown_signal_reaches_subscribers() {
        let hub = BrokerHub::new();
        let mut rx = hub.subscribe_shutdown();
        hub.shutdown(Duration::from_millis(200)).await;
        assert!(rx.recv().await.is_ok());
    }
}
