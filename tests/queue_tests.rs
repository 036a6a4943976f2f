//! Integration tests for the task queues.

use std::sync::Arc;
use std::thread;

use proptest::prelude::*;

use csd_sim::sched::queue::TaskQueue;
use csd_sim::sched::task::{RowOverlap, Task};

fn task(row: u32, col: u32) -> Task {
    Task {
        outdegree_offset: 0,
        outdegree_len: 0,
        edge_block_offset: 0,
        edge_block_len: 4096,
        row,
        col,
        iteration: 0,
        num_iterations: 2,
        device: 0,
        num_devices: 1,
        num_partitions: 8,
        num_vertices: 1024,
        namespace: 0,
        row_overlap: RowOverlap::None,
        prefetch_level: 0,
        time_budget_ns: 0,
    }
}

fn rows(tasks: &[Task]) -> Vec<u32> {
    tasks.iter().map(|t| t.row).collect()
}

#[test]
fn test_fifo_order_and_requeue() {
    let queue = TaskQueue::new("normal");
    for row in 0..3 {
        queue.enqueue(task(row, 0)).unwrap();
    }
    let first = queue.dequeue().unwrap();
    assert_eq!(first.row, 0);

    queue.requeue_front(first).unwrap();
    assert_eq!(rows(&queue.snapshot()), vec![0, 1, 2]);
    assert_eq!(queue.peek_back().map(|t| t.row), Some(2));
}

#[test]
fn test_enqueue_unique_rejects_same_work() {
    let queue = TaskQueue::new("normal");
    assert!(queue.enqueue_unique(task(1, 2)).unwrap());
    assert!(!queue.enqueue_unique(task(1, 2)).unwrap());

    let mut next_iteration = task(1, 2);
    next_iteration.iteration = 1;
    assert!(queue.enqueue_unique(next_iteration).unwrap());
    assert_eq!(queue.len(), 2);
    assert!(queue.contains(1, 2, 0, 1));
}

#[test]
fn test_find_next_scan_modes() {
    let queue = TaskQueue::new("future");
    for row in [4, 1, 5, 3] {
        queue.enqueue(task(row, 0)).unwrap();
    }
    let ready = |row: u32| row % 2 == 1;

    assert_eq!(queue.find_next(ready, RowOverlap::None, false).map(|t| t.row), Some(4));
    assert_eq!(queue.find_next(ready, RowOverlap::ScanForward, false).map(|t| t.row), Some(1));
    assert_eq!(queue.find_next(ready, RowOverlap::ScanBackward, false).map(|t| t.row), Some(3));
    assert_eq!(queue.len(), 4);

    assert_eq!(queue.find_next(ready, RowOverlap::ScanBackward, true).map(|t| t.row), Some(3));
    assert_eq!(rows(&queue.snapshot()), vec![4, 1, 5]);
    assert_eq!(queue.find_next(|_| false, RowOverlap::ScanForward, true), None);
}

#[test]
fn test_swap_with_self_is_noop() {
    let queue = TaskQueue::new("normal");
    queue.enqueue(task(0, 0)).unwrap();
    queue.swap_with(&queue);
    assert_eq!(queue.len(), 1);
}

#[test]
fn test_opposite_swaps_do_not_deadlock() {
    let a = Arc::new(TaskQueue::new("normal"));
    let b = Arc::new(TaskQueue::new("future"));
    a.enqueue(task(0, 0)).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let (a, b) = (a.clone(), b.clone());
            thread::spawn(move || {
                for _ in 0..500 {
                    if i % 2 == 0 {
                        a.swap_with(&b);
                    } else {
                        b.swap_with(&a);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(a.len() + b.len(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_swap_is_atomic_under_concurrent_enqueue(
        a_rows in proptest::collection::vec(0u32..100, 0..16),
        b_rows in proptest::collection::vec(100u32..200, 0..16),
        extra in 1usize..64,
    ) {
        let a = Arc::new(TaskQueue::new("normal"));
        let b = TaskQueue::new("future");
        for &row in &a_rows {
            a.enqueue(task(row, 0)).unwrap();
        }
        for &row in &b_rows {
            b.enqueue(task(row, 0)).unwrap();
        }

        let extra_rows: Vec<u32> = (0..extra as u32).map(|i| 1000 + i).collect();
        let producer = {
            let a = a.clone();
            let extra_rows = extra_rows.clone();
            thread::spawn(move || {
                for row in extra_rows {
                    a.enqueue(task(row, 0)).unwrap();
                }
            })
        };
        a.swap_with(&b);
        producer.join().unwrap();

        // Enqueues that landed before the swap moved to B with A's old
        // contents; the rest landed on B's old contents, now in A.
        let in_b = rows(&b.snapshot());
        let in_a = rows(&a.snapshot());
        prop_assert!(in_b.len() >= a_rows.len());
        let moved = in_b.len() - a_rows.len();
        prop_assert!(moved <= extra);

        let mut expected_b = a_rows.clone();
        expected_b.extend_from_slice(&extra_rows[..moved]);
        let mut expected_a = b_rows.clone();
        expected_a.extend_from_slice(&extra_rows[moved..]);

        prop_assert_eq!(in_b, expected_b);
        prop_assert_eq!(in_a, expected_a);
        prop_assert_eq!(a.len() + b.len(), a_rows.len() + b_rows.len() + extra);
    }
}
