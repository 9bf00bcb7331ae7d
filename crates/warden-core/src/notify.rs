//! Approval notification fan-out
//!
//! A bounded queue decouples `approve` from listener execution: the caller
//! enqueues and returns, a single dispatcher task drains the queue, and each
//! `(request_id, request)` event is submitted to every registered listener
//! through a small worker pool so one slow listener cannot starve the others
//! indefinitely. Listener panics are confined to their worker and logged;
//! they never reach the ledger or other listeners.
//!
//! Guarantees: events are dispatched in enqueue order; completion across
//! listeners for the same event is unordered. Delivery is at-least-once —
//! listeners are expected to be idempotent.

use crate::ledger::Request;
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock, Semaphore};
use tracing::{debug, warn};

/// Receiver of "request approved" events
#[async_trait]
pub trait ApprovalListener: Send + Sync {
    /// Called once per approved request (at-least-once delivery)
    async fn on_approved(&self, request_id: &str, request: &Request);
}

/// One approval event as enqueued by the ledger
#[derive(Debug, Clone)]
pub struct ApprovalEvent {
    /// Id of the approved request
    pub request_id: String,
    /// Snapshot of the request at approval time
    pub request: Request,
}

/// Bounded-queue fan-out of approval events to registered listeners.
///
/// Must be constructed inside a tokio runtime; the dispatcher task is
/// spawned immediately and runs until the notifier is dropped.
#[derive(Debug, Clone)]
pub struct ApprovalNotifier {
    tx: mpsc::Sender<ApprovalEvent>,
    listeners: Arc<RwLock<Vec<Arc<dyn ApprovalListener>>>>,
}

impl std::fmt::Debug for dyn ApprovalListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApprovalListener")
    }
}

impl ApprovalNotifier {
    /// Create a notifier with the given queue capacity and worker pool size
    pub fn new(capacity: usize, workers: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<ApprovalEvent>(capacity.max(1));
        let listeners: Arc<RwLock<Vec<Arc<dyn ApprovalListener>>>> =
            Arc::new(RwLock::new(Vec::new()));
        let pool = Arc::new(Semaphore::new(workers.max(1)));

        let registry = Arc::clone(&listeners);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let event = Arc::new(event);
                let snapshot = registry.read().await.clone();
                for listener in snapshot {
                    let Ok(permit) = Arc::clone(&pool).acquire_owned().await else {
                        // Pool closed only on shutdown
                        return;
                    };
                    let event = Arc::clone(&event);
                    tokio::spawn(async move {
                        let call = AssertUnwindSafe(
                            listener.on_approved(&event.request_id, &event.request),
                        )
                        .catch_unwind();
                        if call.await.is_err() {
                            warn!(request_id = %event.request_id, "approval listener panicked");
                        }
                        drop(permit);
                    });
                }
            }
            debug!("approval dispatcher stopped");
        });

        Self { tx, listeners }
    }

    /// Register a listener for future approvals
    pub async fn register(&self, listener: Arc<dyn ApprovalListener>) {
        self.listeners.write().await.push(listener);
    }

    /// Number of currently registered listeners
    pub async fn listener_count(&self) -> usize {
        self.listeners.read().await.len()
    }

    /// Enqueue an event. Blocks briefly when the queue is full (never drops
    /// silently); returns false only if the dispatcher is gone.
    pub async fn enqueue(&self, event: ApprovalEvent) -> bool {
        match self.tx.send(event).await {
            Ok(()) => true,
            Err(e) => {
                warn!(request_id = %e.0.request_id, "approval queue closed; event dropped");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{Request, RequestPriority, RequestStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn sample_request() -> Request {
        Request {
            id: "abc123".to_string(),
            topic: "docs".to_string(),
            description: "write hello world function".to_string(),
            priority: RequestPriority::Medium,
            status: RequestStatus::Approved,
            created: chrono::Utc::now(),
            response: Some("ok".to_string()),
            reason: None,
            correlation_id: Some("corr".to_string()),
        }
    }

    struct Counting {
        hits: AtomicUsize,
    }

    #[async_trait]
    impl ApprovalListener for Counting {
        async fn on_approved(&self, _id: &str, _request: &Request) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Slow {
        hits: AtomicUsize,
    }

    #[async_trait]
    impl ApprovalListener for Slow {
        async fn on_approved(&self, _id: &str, _request: &Request) {
            tokio::time::sleep(Duration::from_millis(300)).await;
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicking;

    #[async_trait]
    impl ApprovalListener for Panicking {
        async fn on_approved(&self, _id: &str, _request: &Request) {
            panic!("listener bug");
        }
    }

    async fn wait_for(pred: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !pred() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_all_listeners_receive_event() {
        let notifier = ApprovalNotifier::new(8, 4);
        let a = Arc::new(Counting { hits: AtomicUsize::new(0) });
        let b = Arc::new(Counting { hits: AtomicUsize::new(0) });
        notifier.register(a.clone()).await;
        notifier.register(b.clone()).await;

        assert!(notifier
            .enqueue(ApprovalEvent {
                request_id: "abc123".to_string(),
                request: sample_request(),
            })
            .await);

        wait_for(|| a.hits.load(Ordering::SeqCst) == 1 && b.hits.load(Ordering::SeqCst) == 1)
            .await;
    }

    #[tokio::test]
    async fn test_slow_listener_does_not_block_enqueue_or_peers() {
        let notifier = ApprovalNotifier::new(8, 4);
        let slow = Arc::new(Slow { hits: AtomicUsize::new(0) });
        let fast = Arc::new(Counting { hits: AtomicUsize::new(0) });
        notifier.register(slow.clone()).await;
        notifier.register(fast.clone()).await;

        let started = std::time::Instant::now();
        notifier
            .enqueue(ApprovalEvent {
                request_id: "abc123".to_string(),
                request: sample_request(),
            })
            .await;
        assert!(started.elapsed() < Duration::from_millis(100), "enqueue must not wait on listeners");

        // fast listener completes while slow one is still sleeping
        wait_for(|| fast.hits.load(Ordering::SeqCst) == 1).await;
        wait_for(|| slow.hits.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn test_panicking_listener_is_isolated() {
        let notifier = ApprovalNotifier::new(8, 4);
        let survivor = Arc::new(Counting { hits: AtomicUsize::new(0) });
        notifier.register(Arc::new(Panicking)).await;
        notifier.register(survivor.clone()).await;

        for _ in 0..3 {
            notifier
                .enqueue(ApprovalEvent {
                    request_id: "abc123".to_string(),
                    request: sample_request(),
                })
                .await;
        }
        wait_for(|| survivor.hits.load(Ordering::SeqCst) == 3).await;
    }

    #[tokio::test]
    async fn test_events_dispatched_in_enqueue_order() {
        struct Recording {
            seen: std::sync::Mutex<Vec<String>>,
        }
        #[async_trait]
        impl ApprovalListener for Recording {
            async fn on_approved(&self, id: &str, _request: &Request) {
                self.seen.lock().unwrap().push(id.to_string());
            }
        }

        let notifier = ApprovalNotifier::new(16, 1);
        let rec = Arc::new(Recording { seen: std::sync::Mutex::new(Vec::new()) });
        notifier.register(rec.clone()).await;

        for i in 0..5 {
            notifier
                .enqueue(ApprovalEvent {
                    request_id: format!("req-{i}"),
                    request: sample_request(),
                })
                .await;
        }
        wait_for(|| rec.seen.lock().unwrap().len() == 5).await;
        let seen = rec.seen.lock().unwrap().clone();
        assert_eq!(seen, vec!["req-0", "req-1", "req-2", "req-3", "req-4"]);
    }
}
