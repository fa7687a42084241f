use jobfiber::{Job, JobPriority, JobState, StackArena, yield_now};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

#[test]
fn test_concurrent_acquire_never_duplicates() {
    let arena = Arc::new(StackArena::new(32 * 1024, 64).unwrap());

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let arena = arena.clone();
            thread::spawn(move || {
                let mut mine = Vec::new();
                while let Some(block) = arena.acquire_stack() {
                    mine.push(block.as_ptr() as usize);
                    if mine.len() == 32 {
                        break;
                    }
                }
                mine
            })
        })
        .collect();

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for addr in handle.join().unwrap() {
            assert!(seen.insert(addr), "block {addr:#x} handed out twice");
            total += 1;
        }
    }

    assert_eq!(total, 64);
    assert!(arena.acquire_stack().is_none());
    assert_eq!(arena.in_use_blocks(), 64);
}

#[test]
fn test_suspended_jobs_keep_their_stacks() {
    let arena = Arc::new(StackArena::new(64 * 1024, 3).unwrap());

    let jobs: Vec<Box<Job>> = (0..3)
        .map(|_| {
            Job::new(&arena, JobPriority::Normal, || {
                yield_now();
            })
            .unwrap()
        })
        .collect();

    for job in &jobs {
        assert!(job.resume());
        assert_eq!(job.state(), JobState::Suspended);
    }
    assert_eq!(arena.free_blocks(), 0);
    assert!(Job::new(&arena, JobPriority::Low, || {}).is_err());

    for job in &jobs {
        assert!(!job.resume());
    }
    drop(jobs);
    assert_eq!(arena.free_blocks(), 3);
    assert_eq!(arena.in_use_blocks(), 0);
}
