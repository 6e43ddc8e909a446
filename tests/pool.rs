use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use taskloom::idle::{HostContext, ThreadIdleQueue};
use taskloom::pool::ResourcePool;
use taskloom::task_queue::TaskQueue;
use taskloom::{Error, PoolConfig};

struct Connection(u32);

fn factory(counter: Arc<AtomicU32>) -> impl Fn() -> anyhow::Result<Connection> + Send + Sync {
    move || Ok(Connection(counter.fetch_add(1, Ordering::Relaxed)))
}

// Scenario S4: a released resource is reused by the next acquirer
// instead of triggering another factory call.
#[test]
fn released_resource_is_reused() {
    let counter = Arc::new(AtomicU32::new(0));
    let pool = ResourcePool::new(PoolConfig::default(), factory(counter.clone()));

    let first = pool.acquire(0, None).unwrap();
    let id = first.get().0;
    drop(first);

    let second = pool.acquire(0, None).unwrap();
    assert_eq!(second.get().0, id);
    assert_eq!(counter.load(Ordering::Relaxed), 1);
}

// Scenario S5: the pool never exceeds max_size concurrently checked-out
// resources; a capped, exhausted pool blocks acquirers until release.
#[test]
fn pool_blocks_acquirers_once_at_capacity() {
    let counter = Arc::new(AtomicU32::new(0));
    let config = PoolConfig {
        max_size: 2,
        ..PoolConfig::default()
    };
    let pool = ResourcePool::new(config, factory(counter));

    let first = pool.acquire(0, None).unwrap();
    let second = pool.acquire(0, None).unwrap();
    assert!(matches!(pool.try_acquire(), Err(Error::WouldBlock)));

    let pool2 = pool.clone();
    let waiter = std::thread::spawn(move || pool2.acquire(0, None));
    std::thread::sleep(Duration::from_millis(20));
    drop(first);
    assert!(waiter.join().unwrap().is_ok());
    drop(second);
}

#[test]
fn factory_failure_surfaces_as_factory_failed() {
    let pool: Arc<ResourcePool<Connection>> =
        ResourcePool::new(PoolConfig::default(), || Err(anyhow::anyhow!("unreachable backend")));
    assert!(matches!(pool.acquire(0, None), Err(Error::FactoryFailed(_))));
}

// Scenario S4: with a capped pool(1) and 8 concurrent background
// `execute` calls, all 8 callbacks observe the same resource identity,
// the factory only ever runs once, and no two calls overlap.
#[tokio::test]
async fn eight_concurrent_background_execute_calls_share_one_resource() {
    let counter = Arc::new(AtomicU32::new(0));
    let config = PoolConfig {
        max_size: 1,
        ..PoolConfig::default()
    };
    let queue = TaskQueue::new();
    queue.increase_max_threads(8);
    let pool = ResourcePool::with_task_queue(config, factory(counter.clone()), queue);

    let idle = Arc::new(ThreadIdleQueue::new());
    HostContext::install(idle.clone());
    let idle2 = idle.clone();
    let pump = tokio::spawn(async move {
        loop {
            idle2.pump();
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    });

    let active = Arc::new(AtomicU32::new(0));
    let max_seen = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        let active = active.clone();
        let max_seen = max_seen.clone();
        handles.push(tokio::spawn(async move {
            pool.execute_background(0, None, move |_conn: &Connection| {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(50));
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            })
            .await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    pump.abort();

    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    assert_eq!(counter.load(Ordering::Relaxed), 1);
}
