//! Priority-ordered FIFO task queue (spec §4.5 intake / §9 "insertion
//! order is preserved among equal priorities").
//!
//! A `BinaryHeap` would give priority ordering for free but not FIFO
//! ordering among equal priorities without also tracking a sequence
//! number and threading it through comparisons; the teacher's own ready
//! set in `gator-core::orchestrator` (`task_db::get_ready_tasks`) sorts a
//! plain `Vec` instead, which is the simpler shape here too given queue
//! depths are expected to stay small (worker counts in the single or low
//! double digits). Insertion finds the first entry with strictly lower
//! priority and inserts before it, which is `O(n)` but keeps the
//! invariant ("higher priority first, FIFO within a priority") trivially
//! visible at the call site rather than encoded in a comparator.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::model::Task;

/// A priority queue of pending [`Task`]s.
///
/// Higher `priority` values are dequeued first; tasks with equal priority
/// are dequeued in the order they were enqueued.
#[derive(Default)]
pub struct TaskQueue {
    items: Mutex<VecDeque<Task>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `task` in priority order, after any existing task with
    /// priority `>= task.priority` and before the first with a strictly
    /// lower one.
    pub fn push(&self, task: Task) {
        let mut items = self.items.lock().unwrap();
        let insert_at = items
            .iter()
            .position(|existing| existing.priority < task.priority)
            .unwrap_or(items.len());
        items.insert(insert_at, task);
    }

    /// Remove and return the highest-priority, earliest-enqueued task.
    pub fn pop(&self) -> Option<Task> {
        self.items.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove a still-queued task by run id, if it has not yet been
    /// dequeued by a worker (spec §5: cancelling a queued run removes it
    /// from the queue).
    pub fn remove(&self, run_id: uuid::Uuid) -> Option<Task> {
        let mut items = self.items.lock().unwrap();
        let pos = items.iter().position(|t| t.run_id == run_id)?;
        items.remove(pos)
    }
}
