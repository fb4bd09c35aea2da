//! Durable FIFO command queue.
//!
//! Entries persist to a single JSON snapshot (write-temp-then-rename, via
//! `nc_persist::JsonStore`) on enqueue, on requeue, and on acknowledged
//! success — never on a bare pop. [`CommandQueue::dequeue`] only removes an
//! entry from the in-memory deque; the on-disk snapshot keeps showing it
//! until [`CommandQueue::process`] calls [`CommandQueue::ack`] after its
//! handler returns `Ok(())`. A crash anywhere between dequeue and ack —
//! including mid-handler — leaves the entry sitting in `queue.json`, so a
//! restart redelivers it (at-least-once). [`CommandQueue::process`]
//! re-appends an entry to the back of the queue on handler failure after a
//! fixed backoff, mirroring the batch-retry discipline of the agent's
//! rolling-push executor.

#![forbid(unsafe_code)]

use nc_persist::JsonStore;
use nc_proto::{AgentMessage, QueueEntry};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("handler failed: {0}")]
    HandlerFailed(String),
}

/// Delay before a failed entry is re-appended to the back of the queue.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(5);
/// Idle poll interval when the queue is empty.
const IDLE_POLL: Duration = Duration::from_millis(200);

/// Persistent, single-writer FIFO queue of [`AgentMessage`] commands.
pub struct CommandQueue {
    entries: Mutex<VecDeque<QueueEntry>>,
    next_sequence: AtomicU64,
    store: JsonStore,
}

impl CommandQueue {
    /// Load `{state_path}/queue.json`, or start empty if absent.
    pub fn new(state_path: &Path) -> Self {
        let store = JsonStore::at_path(state_path.join("queue.json"));
        let loaded: Vec<QueueEntry> = store.load();
        let next_sequence = loaded.iter().map(|e| e.sequence).max().map_or(0, |m| m + 1);
        debug!(count = loaded.len(), next_sequence, "loaded command queue from disk");
        Self {
            entries: Mutex::new(loaded.into()),
            next_sequence: AtomicU64::new(next_sequence),
            store,
        }
    }

    /// Append a command to the back of the queue, persisting before returning.
    pub fn enqueue(&self, message: AgentMessage) -> QueueEntry {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let entry = QueueEntry {
            message,
            sequence,
            enqueued_at: chrono::Utc::now(),
        };
        let mut guard = self.entries.lock();
        guard.push_back(entry.clone());
        self.snapshot(&guard);
        entry
    }

    /// Pop the front entry, if any. In-memory only — the on-disk snapshot
    /// still lists this entry as queued until [`Self::ack`] commits its
    /// removal. This is what lets an unacknowledged entry survive a crash.
    pub fn dequeue(&self) -> Option<QueueEntry> {
        self.entries.lock().pop_front()
    }

    /// Re-append an entry to the back, used by [`Self::process`] on handler
    /// failure. Keeps the original sequence number — sequence order reflects
    /// original arrival, not retry order. Persists immediately: the entry
    /// must stay visible on disk whether it sits at the front (not yet
    /// popped) or the back (requeued after failure).
    pub fn requeue(&self, entry: QueueEntry) {
        let mut guard = self.entries.lock();
        guard.push_back(entry);
        self.snapshot(&guard);
    }

    /// Commit the current in-memory queue to disk. Called by [`Self::process`]
    /// only after a handler resolves `Ok(())`, so a dequeued entry is removed
    /// from `queue.json` exactly when it has been acknowledged with success —
    /// never before.
    pub fn ack(&self) {
        let guard = self.entries.lock();
        self.snapshot(&guard);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn snapshot(&self, guard: &VecDeque<QueueEntry>) {
        let ordered: Vec<&QueueEntry> = guard.iter().collect();
        if let Err(e) = self.store.save(&ordered) {
            warn!(error = %e, "failed to persist command queue");
        }
    }

    /// Long-running loop: dequeue, invoke `handler`, re-append on failure
    /// after [`RETRY_BACKOFF`]. Exits when `shutdown` is set to `true`.
    pub async fn process<F, Fut>(&self, mut handler: F, mut shutdown: watch::Receiver<bool>)
    where
        F: FnMut(QueueEntry) -> Fut,
        Fut: Future<Output = Result<(), QueueError>>,
    {
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.dequeue() {
                Some(entry) => {
                    let sequence = entry.sequence;
                    match handler(entry.clone()).await {
                        Ok(()) => {
                            self.ack();
                            debug!(sequence, "command queue entry processed");
                        }
                        Err(e) => {
                            warn!(sequence, error = %e, "command queue handler failed, will retry");
                            tokio::select! {
                                _ = tokio::time::sleep(RETRY_BACKOFF) => {}
                                _ = shutdown.changed() => {}
                            }
                            self.requeue(entry);
                        }
                    }
                }
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(IDLE_POLL) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nc_proto::MessageType;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn message(tag: &str) -> AgentMessage {
        AgentMessage::new("cli", "agent", MessageType::Command, serde_json::json!({"tag": tag}), "a1")
    }

    #[test]
    fn enqueue_dequeue_preserves_fifo_order() {
        let dir = tempfile::tempdir().unwrap();
        let queue = CommandQueue::new(dir.path());
        queue.enqueue(message("one"));
        queue.enqueue(message("two"));

        let first = queue.dequeue().unwrap();
        let second = queue.dequeue().unwrap();
        assert_eq!(first.message.payload["tag"], "one");
        assert_eq!(second.message.payload["tag"], "two");
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn sequence_numbers_are_monotonic_and_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let queue = CommandQueue::new(dir.path());
            queue.enqueue(message("one"));
            queue.enqueue(message("two"));
        }
        let reloaded = CommandQueue::new(dir.path());
        assert_eq!(reloaded.len(), 2);
        let entry = reloaded.dequeue().unwrap();
        assert_eq!(entry.sequence, 0);
        let next = CommandQueue::new(dir.path());
        // sequence counter for *new* entries continues past what was reloaded
        let appended = next.enqueue(message("three"));
        assert_eq!(appended.sequence, 2);
    }

    #[test]
    fn dequeued_entry_survives_reload_until_acked() {
        let dir = tempfile::tempdir().unwrap();
        let queue = CommandQueue::new(dir.path());
        queue.enqueue(message("one"));

        let entry = queue.dequeue().unwrap();
        assert!(queue.is_empty(), "pop removes from memory immediately");

        // Simulate a crash between dequeue and ack: reload from disk and the
        // entry must still be there, unacknowledged.
        let after_crash = CommandQueue::new(dir.path());
        assert_eq!(after_crash.len(), 1, "unacked entry must survive a restart");

        queue.ack();
        let after_ack = CommandQueue::new(dir.path());
        assert_eq!(after_ack.len(), 0, "acked entry must be gone after restart");

        let _ = entry;
    }

    #[test]
    fn requeue_appends_to_back_keeping_original_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let queue = CommandQueue::new(dir.path());
        queue.enqueue(message("one"));
        queue.enqueue(message("two"));
        let first = queue.dequeue().unwrap();
        queue.requeue(first.clone());

        let next = queue.dequeue().unwrap();
        assert_eq!(next.message.payload["tag"], "two");
        let retried = queue.dequeue().unwrap();
        assert_eq!(retried.sequence, first.sequence);
    }

    #[tokio::test]
    async fn process_retries_failed_entry_then_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(CommandQueue::new(dir.path()));
        queue.enqueue(message("flaky"));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let queue_clone = queue.clone();
        let shutdown_tx_clone = shutdown_tx.clone();

        let handle = tokio::spawn(async move {
            queue_clone
                .process(
                    move |_entry| {
                        let attempts = attempts_clone.clone();
                        let shutdown_tx = shutdown_tx_clone.clone();
                        async move {
                            let count = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                            if count < 2 {
                                Err(QueueError::HandlerFailed("transient".into()))
                            } else {
                                let _ = shutdown_tx.send(true);
                                Ok(())
                            }
                        }
                    },
                    shutdown_rx,
                )
                .await;
        });

        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("process loop did not exit")
            .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
