use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use taskloom::cancel::CancelToken;
use taskloom::semaphore::Semaphore;
use taskloom::Error;

// Scenario S2: Semaphore(1) behaves as mutual exclusion — at most one
// background `add` task observes "active" at a time.
#[test]
fn semaphore_of_one_is_mutual_exclusion() {
    let sem = Semaphore::new(1);
    let active = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let sem = sem.clone();
            let active = active.clone();
            let max_seen = max_seen.clone();
            let completed = completed.clone();
            std::thread::spawn(move || {
                sem.add(
                    0,
                    None,
                    Box::new(move || {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(5));
                        active.fetch_sub(1, Ordering::SeqCst);
                        completed.fetch_add(1, Ordering::SeqCst);
                        false
                    }),
                );
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    while completed.load(Ordering::SeqCst) < 8 {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
}

// Scenario S3: Semaphore(N) allows up to N concurrent `add` tasks and no
// more.
#[test]
fn semaphore_of_n_caps_concurrency_at_n() {
    let sem = Semaphore::new(3);
    let active = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..12)
        .map(|_| {
            let sem = sem.clone();
            let active = active.clone();
            let max_seen = max_seen.clone();
            let completed = completed.clone();
            std::thread::spawn(move || {
                sem.add(
                    0,
                    None,
                    Box::new(move || {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(5));
                        active.fetch_sub(1, Ordering::SeqCst);
                        completed.fetch_add(1, Ordering::SeqCst);
                        false
                    }),
                );
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    while completed.load(Ordering::SeqCst) < 12 {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(max_seen.load(Ordering::SeqCst) <= 3);
    assert!(max_seen.load(Ordering::SeqCst) >= 1);
}

#[test]
fn cancelled_waiter_does_not_consume_a_slot() {
    let sem = Semaphore::new(1);
    let _held = sem.lock(0, None).unwrap();

    let token = CancelToken::new();
    let sem2 = sem.clone();
    let token2 = token.clone();
    let waiter = std::thread::spawn(move || sem2.lock(0, Some(token2)));
    std::thread::sleep(Duration::from_millis(20));
    token.cancel();
    assert!(matches!(waiter.join().unwrap(), Err(Error::Cancelled)));
    assert_eq!(sem.claims(), 1);
}

#[tokio::test]
async fn lock_async_respects_capacity() {
    let sem = Semaphore::new(1);
    let first = sem.lock_async(0, None).await.unwrap();
    assert!(!sem.try_lock(0));
    drop(first);
    assert!(sem.try_lock(0));
}
