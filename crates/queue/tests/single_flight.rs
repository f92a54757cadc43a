#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use steward_core::{ReconcileOutcome, ResourceKey};
use steward_queue::{spawn_workers, WorkQueue};

#[derive(Default)]
struct Tracker {
    running: Mutex<FxHashMap<ResourceKey, usize>>,
    max_same_key: AtomicUsize,
    max_total: AtomicUsize,
    total_running: AtomicUsize,
    calls: AtomicUsize,
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_key_never_runs_concurrently() {
    let queue: WorkQueue<ResourceKey> = WorkQueue::new("test");
    let tracker = Arc::new(Tracker::default());

    let handles = spawn_workers(queue.clone(), 4, {
        let tracker = Arc::clone(&tracker);
        move |key: ResourceKey| {
            let tracker = Arc::clone(&tracker);
            async move {
                {
                    let mut running = tracker.running.lock().unwrap();
                    let n = running.entry(key.clone()).or_default();
                    *n += 1;
                    tracker.max_same_key.fetch_max(*n, Ordering::SeqCst);
                }
                let total = tracker.total_running.fetch_add(1, Ordering::SeqCst) + 1;
                tracker.max_total.fetch_max(total, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                tracker.total_running.fetch_sub(1, Ordering::SeqCst);
                *tracker.running.lock().unwrap().get_mut(&key).unwrap() -= 1;
                tracker.calls.fetch_add(1, Ordering::SeqCst);
                ReconcileOutcome::done()
            }
        }
    });

    // Hammer one key while it is in flight, plus a few distinct keys.
    for round in 0..5 {
        queue.push(ResourceKey::new("ns", "hot"));
        queue.push(ResourceKey::new("ns", format!("cold-{round}")));
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    for h in handles { h.abort(); }

    assert_eq!(tracker.max_same_key.load(Ordering::SeqCst), 1);
    assert!(tracker.max_total.load(Ordering::SeqCst) > 1, "distinct keys should run in parallel");
    // Pushes for "hot" during a run collapse into a single follow-up run.
    let calls = tracker.calls.load(Ordering::SeqCst);
    assert!(calls >= 6 && calls < 10, "unexpected call count {calls}");
}

#[tokio::test(start_paused = true)]
async fn requeue_outcome_schedules_key_again() {
    let queue: WorkQueue<ResourceKey> = WorkQueue::new("requeue");
    let calls = Arc::new(AtomicUsize::new(0));
    let handles = spawn_workers(queue.clone(), 1, {
        let calls = Arc::clone(&calls);
        move |_key: ResourceKey| {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 { ReconcileOutcome::requeue_after(Duration::from_secs(5)) } else { ReconcileOutcome::done() }
            }
        }
    });

    queue.push(ResourceKey::new("ns", "a"));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    for h in handles { h.abort(); }
}
