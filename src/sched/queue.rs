//! Per-device task queues.
//!
//! Each device owns a "normal" and a "future" queue. Both are FIFO deques
//! behind their own lock; `swap_with` exchanges the contents of two queues
//! atomically with respect to every other operation on either of them.

use std::collections::VecDeque;

use parking_lot::Mutex;
use thiserror::Error;

use crate::sched::task::{RowOverlap, Task};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Cannot allocate a queue slot in {queue} queue")]
    AllocationFailed { queue: &'static str },
}

/// A named FIFO of tasks.
pub struct TaskQueue {
    name: &'static str,
    tasks: Mutex<VecDeque<Task>>,
}

impl TaskQueue {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            tasks: Mutex::new(VecDeque::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Append to the tail.
    pub fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        let mut tasks = self.tasks.lock();
        tasks
            .try_reserve(1)
            .map_err(|_| QueueError::AllocationFailed { queue: self.name })?;
        tasks.push_back(task);
        Ok(())
    }

    /// Append unless an equivalent task (row, col, device, iteration) is queued.
    ///
    /// Returns whether the task was added.
    pub fn enqueue_unique(&self, task: Task) -> Result<bool, QueueError> {
        let mut tasks = self.tasks.lock();
        if tasks
            .iter()
            .any(|t| t.same_work(task.row, task.col, task.device, task.iteration))
        {
            return Ok(false);
        }
        tasks
            .try_reserve(1)
            .map_err(|_| QueueError::AllocationFailed { queue: self.name })?;
        tasks.push_back(task);
        Ok(true)
    }

    /// Put a task back at the head, ahead of everything else.
    pub fn requeue_front(&self, task: Task) -> Result<(), QueueError> {
        let mut tasks = self.tasks.lock();
        tasks
            .try_reserve(1)
            .map_err(|_| QueueError::AllocationFailed { queue: self.name })?;
        tasks.push_front(task);
        Ok(())
    }

    pub fn dequeue(&self) -> Option<Task> {
        self.tasks.lock().pop_front()
    }

    pub fn peek_front(&self) -> Option<Task> {
        self.tasks.lock().front().copied()
    }

    pub fn peek_back(&self) -> Option<Task> {
        self.tasks.lock().back().copied()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Linear scan for an equivalent task.
    pub fn contains(&self, row: u32, col: u32, device: u32, iteration: u32) -> bool {
        self.tasks
            .lock()
            .iter()
            .any(|t| t.same_work(row, col, device, iteration))
    }

    /// Find the next task to run under `mode`, optionally removing it.
    ///
    /// `None` mode yields the front. The scan modes yield the first task whose
    /// row satisfies `ready`, scanning from the head or from the tail. The scan
    /// and the removal happen under one lock acquisition.
    pub fn find_next<F>(&self, ready: F, mode: RowOverlap, take: bool) -> Option<Task>
    where
        F: Fn(u32) -> bool,
    {
        let mut tasks = self.tasks.lock();
        let pos = match mode {
            RowOverlap::None => (!tasks.is_empty()).then_some(0),
            RowOverlap::ScanForward => tasks.iter().position(|t| ready(t.row)),
            RowOverlap::ScanBackward => tasks.iter().rposition(|t| ready(t.row)),
        }?;

        if take {
            tasks.remove(pos)
        } else {
            tasks.get(pos).copied()
        }
    }

    /// Exchange the contents of two queues.
    ///
    /// Both locks are taken in address order, so concurrent swaps in opposite
    /// directions cannot deadlock.
    pub fn swap_with(&self, other: &TaskQueue) {
        if std::ptr::eq(self, other) {
            return;
        }
        let (first, second) = if (self as *const TaskQueue) < (other as *const TaskQueue) {
            (self, other)
        } else {
            (other, self)
        };
        let mut a = first.tasks.lock();
        let mut b = second.tasks.lock();
        std::mem::swap(&mut *a, &mut *b);
    }

    /// Drop every queued task. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut tasks = self.tasks.lock();
        let dropped = tasks.len();
        tasks.clear();
        dropped
    }

    /// Copy of the queued tasks, head first.
    pub fn snapshot(&self) -> Vec<Task> {
        self.tasks.lock().iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::task::tests::task;

    #[test]
    fn test_fifo_order() {
        let q = TaskQueue::new("normal");
        q.enqueue(task(0, 0, 0)).unwrap();
        q.enqueue(task(0, 1, 0)).unwrap();
        assert_eq!(q.peek_front().map(|t| t.col), Some(0));
        assert_eq!(q.peek_back().map(|t| t.col), Some(1));
        assert_eq!(q.dequeue().map(|t| t.col), Some(0));
        assert_eq!(q.dequeue().map(|t| t.col), Some(1));
        assert!(q.dequeue().is_none());
        assert!(q.peek_front().is_none());
    }

    #[test]
    fn test_enqueue_unique() {
        let q = TaskQueue::new("normal");
        assert!(q.enqueue_unique(task(1, 2, 0)).unwrap());
        assert!(!q.enqueue_unique(task(1, 2, 0)).unwrap());
        assert!(q.enqueue_unique(task(1, 2, 1)).unwrap());
        assert_eq!(q.len(), 2);
        assert!(q.contains(1, 2, 0, 1));
        assert!(!q.contains(2, 1, 0, 0));
    }

    #[test]
    fn test_find_next_modes() {
        let q = TaskQueue::new("future");
        for row in [0, 1, 2, 3] {
            q.enqueue(task(row, 0, 1)).unwrap();
        }
        let ready = |row: u32| row == 1 || row == 2;

        assert_eq!(q.find_next(ready, RowOverlap::None, false).map(|t| t.row), Some(0));
        assert_eq!(
            q.find_next(ready, RowOverlap::ScanForward, false).map(|t| t.row),
            Some(1)
        );
        assert_eq!(
            q.find_next(ready, RowOverlap::ScanBackward, false).map(|t| t.row),
            Some(2)
        );
        assert_eq!(q.len(), 4);

        assert_eq!(
            q.find_next(ready, RowOverlap::ScanBackward, true).map(|t| t.row),
            Some(2)
        );
        assert_eq!(q.len(), 3);
        assert!(q.find_next(|_| false, RowOverlap::ScanForward, true).is_none());
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn test_swap_with() {
        let a = TaskQueue::new("normal");
        let b = TaskQueue::new("future");
        a.enqueue(task(0, 0, 0)).unwrap();
        b.enqueue(task(1, 1, 1)).unwrap();
        b.enqueue(task(2, 2, 1)).unwrap();

        a.swap_with(&b);
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 1);
        assert_eq!(b.peek_front().map(|t| t.row), Some(0));

        // Self-swap is a no-op.
        a.swap_with(&a);
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_requeue_front_and_clear() {
        let q = TaskQueue::new("normal");
        q.enqueue(task(0, 1, 0)).unwrap();
        q.requeue_front(task(0, 0, 0)).unwrap();
        assert_eq!(q.peek_front().map(|t| t.col), Some(0));
        assert_eq!(q.clear(), 2);
        assert!(q.is_empty());
    }
}
