//! Integration tests for the admission queue under contention

use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use tusk_engine::*;

#[test]
fn overflow_lands_at_position_one() {
    const N: usize = 3;
    let queue = AdmissionQueue::new(N);
    for i in 0..N {
        assert_eq!(queue.add(&format!("u{}", i)), Admission::Admitted);
    }

    assert_eq!(queue.add("overflow"), Admission::Queued(1));
    assert_eq!(queue.queue_position("overflow").as_i64(), 1);

    assert_eq!(queue.finish_upload("u0"), Some("overflow".to_string()));
    assert_eq!(queue.queue_position("overflow"), QueuePosition::Active);
}

#[test]
fn concurrent_adds_respect_capacity() {
    const MAX: usize = 5;
    const THREADS: usize = 8;
    const PER_THREAD: usize = 25;

    let queue = Arc::new(AdmissionQueue::new(MAX));
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for k in 0..PER_THREAD {
                    queue.add(&format!("t{}-{}", t, k));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let total = THREADS * PER_THREAD;
    let snapshot = queue.snapshot();
    assert_eq!(snapshot.active.len(), MAX.min(total));
    assert_eq!(snapshot.waiting.len(), total.saturating_sub(MAX));

    let active: HashSet<_> = snapshot.active.iter().collect();
    assert!(snapshot.waiting.iter().all(|w| !active.contains(w)));
}

#[test]
fn concurrent_finishes_drain_the_queue() {
    const MAX: usize = 4;
    let queue = Arc::new(AdmissionQueue::new(MAX));
    for i in 0..40 {
        queue.add(&format!("u{}", i));
    }

    // Each worker keeps finishing whatever is active until nothing is left
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut finished = 0;
                loop {
                    let Some(id) = queue.active_ids().into_iter().next() else {
                        break;
                    };
                    if queue.is_active(&id) {
                        queue.finish_upload(&id);
                        finished += 1;
                    }
                    assert!(queue.active_len() <= MAX);
                }
                finished
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(queue.active_len(), 0);
    assert_eq!(queue.waiting_len(), 0);
}

proptest! {
    #[test]
    fn props_ids_are_never_both_active_and_waiting(
        max in 1usize..6,
        ops in prop::collection::vec((0u8..3, 0usize..12), 0..200)
    ) {
        let queue = AdmissionQueue::new(max);
        for (op, n) in ops {
            let id = format!("u{}", n);
            match op {
                0 => { queue.add(&id); }
                1 => { queue.remove(&id); }
                _ => { queue.finish_upload(&id); }
            }

            let snapshot = queue.snapshot();
            prop_assert!(snapshot.active.len() <= max);
            let waiting: HashSet<_> = snapshot.waiting.iter().collect();
            prop_assert_eq!(waiting.len(), snapshot.waiting.len());
            prop_assert!(snapshot.active.iter().all(|a| !waiting.contains(a)));
        }
    }
}
