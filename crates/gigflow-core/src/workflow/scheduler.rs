//! Admission queue and the dispatch loop.
//!
//! Enqueued executions wait in a priority queue (priority descending, FIFO
//! among equals). A single dispatch loop pops entries with a bounded wait --
//! so it can also observe the shutdown flag -- and spawns one runner task
//! per execution. The global bound is enforced by counting executions in
//! the Running state, not by a fixed worker pool.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use gigflow_types::error::DirectorError;
use gigflow_types::workflow::{Priority, WorkflowStatus};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::director::DirectorState;

use super::runner;

// ---------------------------------------------------------------------------
// QueueEntry
// ---------------------------------------------------------------------------

/// One admission-queue entry.
#[derive(Debug)]
pub struct QueueEntry {
    pub priority: Priority,
    /// Monotonic enqueue sequence; the FIFO tie-break within a priority.
    pub seq: u64,
    pub execution_id: Uuid,
    pub input: Option<Value>,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence (older) first.
        self.priority
            .rank()
            .cmp(&other.priority.rank())
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ---------------------------------------------------------------------------
// AdmissionQueue
// ---------------------------------------------------------------------------

/// Priority queue with a bounded-wait pop.
#[derive(Default)]
pub struct AdmissionQueue {
    heap: Mutex<BinaryHeap<QueueEntry>>,
    notify: Notify,
    seq: AtomicU64,
}

impl AdmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an execution at the given priority.
    pub fn push(&self, execution_id: Uuid, priority: Priority, input: Option<Value>) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::SeqCst);
        let mut heap = self.heap.lock().unwrap();
        heap.push(QueueEntry {
            priority,
            seq,
            execution_id,
            input,
        });
        drop(heap);
        self.notify.notify_one();
    }

    fn try_pop(&self) -> Option<QueueEntry> {
        self.heap.lock().unwrap().pop()
    }

    /// Pop the highest-priority entry, waiting at most `timeout` for one to
    /// arrive. Returns None on timeout so the caller can re-check state.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<QueueEntry> {
        if let Some(entry) = self.try_pop() {
            return Some(entry);
        }
        match tokio::time::timeout(timeout, self.notify.notified()).await {
            Ok(()) => self.try_pop(),
            Err(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Dispatch loop
// ---------------------------------------------------------------------------

/// The single dispatch loop: wait for capacity, pop, spawn a runner.
///
/// Never crashes; unexpected dispatch failures are logged and followed by a
/// short back-off.
pub(crate) async fn run_dispatch_loop(state: Arc<DirectorState>) {
    let poll = Duration::from_millis(state.config.dispatch_poll_interval_ms);
    let backoff = Duration::from_secs(state.config.dispatch_backoff_secs);
    tracing::info!("dispatch loop started");

    loop {
        if state.shutdown.is_cancelled() {
            break;
        }

        if state.running_count() >= state.config.max_concurrent_workflows {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = tokio::time::sleep(poll) => {}
            }
            continue;
        }

        let entry = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            entry = state.queue.pop_timeout(poll) => entry,
        };
        let Some(entry) = entry else { continue };

        if let Err(e) = dispatch_entry(&state, entry) {
            tracing::error!(error = %e, "dispatch failed, backing off");
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    tracing::info!("dispatch loop stopped");
}

fn dispatch_entry(state: &Arc<DirectorState>, entry: QueueEntry) -> Result<(), DirectorError> {
    let execution_id = entry.execution_id;

    // Mark the execution Running here, before the runner task is scheduled,
    // so the concurrency cap never overshoots between pop and runner start.
    // Terminal executions (cancelled while queued) pass through untouched;
    // the runner archives them.
    let marked = state.with_execution(execution_id, |exec| {
        if !exec.status.is_terminal() {
            exec.status = WorkflowStatus::Running;
        }
    });
    if marked.is_none() {
        // The execution vanished between enqueue and dispatch.
        return Err(DirectorError::ExecutionNotFound(execution_id));
    }

    let task_state = Arc::clone(state);
    let handle = tokio::spawn(async move {
        runner::run_execution(task_state, execution_id, entry.input).await;
    });
    state.runner_tasks.insert(execution_id, handle);
    tracing::debug!(execution_id = %execution_id, "dispatched execution");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pops_highest_priority_first() {
        let queue = AdmissionQueue::new();
        let low = Uuid::now_v7();
        let critical = Uuid::now_v7();
        let normal = Uuid::now_v7();

        queue.push(low, Priority::Low, None);
        queue.push(critical, Priority::Critical, None);
        queue.push(normal, Priority::Normal, None);

        let order: Vec<Uuid> = [
            queue.pop_timeout(Duration::from_millis(10)).await.unwrap(),
            queue.pop_timeout(Duration::from_millis(10)).await.unwrap(),
            queue.pop_timeout(Duration::from_millis(10)).await.unwrap(),
        ]
        .into_iter()
        .map(|e| e.execution_id)
        .collect();

        assert_eq!(order, vec![critical, normal, low]);
    }

    #[tokio::test]
    async fn equal_priority_pops_fifo() {
        let queue = AdmissionQueue::new();
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::now_v7()).collect();
        for id in &ids {
            queue.push(*id, Priority::Normal, None);
        }

        for expected in &ids {
            let entry = queue.pop_timeout(Duration::from_millis(10)).await.unwrap();
            assert_eq!(entry.execution_id, *expected);
        }
    }

    #[tokio::test]
    async fn pop_times_out_on_empty_queue() {
        let queue = AdmissionQueue::new();
        let popped = queue.pop_timeout(Duration::from_millis(20)).await;
        assert!(popped.is_none());
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let queue = Arc::new(AdmissionQueue::new());
        let popper = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop_timeout(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let id = Uuid::now_v7();
        queue.push(id, Priority::High, None);

        let entry = popper.await.unwrap().expect("push should wake the popper");
        assert_eq!(entry.execution_id, id);
    }

    #[tokio::test]
    async fn push_carries_input_through() {
        let queue = AdmissionQueue::new();
        let id = Uuid::now_v7();
        queue.push(id, Priority::Normal, Some(serde_json::json!({"keywords": ["rust"]})));

        let entry = queue.pop_timeout(Duration::from_millis(10)).await.unwrap();
        assert_eq!(entry.input.unwrap()["keywords"][0], "rust");
        assert!(queue.is_empty());
    }
}
