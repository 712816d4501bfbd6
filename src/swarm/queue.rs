//! Dispatch queue
//!
//! Priority queue of subtasks waiting for an agent. Ordering is priority
//! (highest first), then submission sequence. Items may carry a `not_before`
//! instant while backing off after a retryable failure.

use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use super::run::TaskPriority;

/// A queued subtask reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub run_id: String,
    pub task_id: String,
    pub capability: String,
    pub priority: TaskPriority,
    pub seq: u64,
    pub not_before: Option<Instant>,
}

impl QueueItem {
    fn ready(&self, now: Instant) -> bool {
        self.not_before.map(|t| t <= now).unwrap_or(true)
    }
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Thread-safe subtask queue
#[derive(Default)]
pub struct DispatchQueue {
    heap: Mutex<BinaryHeap<QueueItem>>,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: QueueItem) {
        self.heap.lock().push(item);
    }

    /// Take every item that is ready now, in dispatch order
    pub fn drain_ready(&self, now: Instant) -> Vec<QueueItem> {
        let mut heap = self.heap.lock();
        let mut ready = Vec::new();
        let mut waiting = Vec::new();

        while let Some(item) = heap.pop() {
            if item.ready(now) {
                ready.push(item);
            } else {
                waiting.push(item);
            }
        }
        heap.extend(waiting);
        ready
    }

    /// Earliest backoff expiry among queued items
    pub fn next_ready_at(&self) -> Option<Instant> {
        self.heap.lock().iter().filter_map(|item| item.not_before).min()
    }

    /// Drop every item of a run, returning how many were removed
    pub fn remove_run(&self, run_id: &str) -> usize {
        let mut heap = self.heap.lock();
        let before = heap.len();
        heap.retain(|item| item.run_id != run_id);
        before - heap.len()
    }

    pub fn clear(&self) {
        self.heap.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn item(run: &str, task: &str, priority: TaskPriority, seq: u64) -> QueueItem {
        QueueItem {
            run_id: run.to_string(),
            task_id: task.to_string(),
            capability: "cap".to_string(),
            priority,
            seq,
            not_before: None,
        }
    }

    #[test]
    fn test_priority_then_submission_order() {
        let queue = DispatchQueue::new();
        queue.push(item("r", "low", TaskPriority::Low, 1));
        queue.push(item("r", "n2", TaskPriority::Normal, 3));
        queue.push(item("r", "high", TaskPriority::High, 4));
        queue.push(item("r", "n1", TaskPriority::Normal, 2));

        let order: Vec<String> = queue
            .drain_ready(Instant::now())
            .into_iter()
            .map(|i| i.task_id)
            .collect();
        assert_eq!(order, vec!["high", "n1", "n2", "low"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_backoff_items_stay_queued() {
        let queue = DispatchQueue::new();
        let now = Instant::now();
        let mut later = item("r", "later", TaskPriority::High, 1);
        later.not_before = Some(now + Duration::from_secs(60));
        queue.push(later);
        queue.push(item("r", "now", TaskPriority::Low, 2));

        let ready = queue.drain_ready(now);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].task_id, "now");
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_ready_at(), Some(now + Duration::from_secs(60)));
    }

    #[test]
    fn test_remove_run() {
        let queue = DispatchQueue::new();
        queue.push(item("a", "1", TaskPriority::Normal, 1));
        queue.push(item("b", "2", TaskPriority::Normal, 2));
        queue.push(item("a", "3", TaskPriority::Normal, 3));

        assert_eq!(queue.remove_run("a"), 2);
        assert_eq!(queue.len(), 1);
    }
}
