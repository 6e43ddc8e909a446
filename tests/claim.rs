use taskloom::pool::ResourcePool;
use taskloom::semaphore::Semaphore;
use taskloom::PoolConfig;

// Scenario S7: a claim releases exactly once, whether released
// explicitly or only via drop, and never double-releases into its
// owner's accounting.
#[test]
fn semaphore_claim_release_is_idempotent() {
    let sem = Semaphore::new(1);
    let claim = sem.lock(0, None).unwrap();
    assert_eq!(sem.claims(), 1);
    claim.release();
    claim.release();
    assert_eq!(sem.claims(), 0);
    drop(claim);
    assert_eq!(sem.claims(), 0);
}

#[test]
fn resource_claim_returns_to_pool_on_drop() {
    let pool: std::sync::Arc<ResourcePool<u32>> =
        ResourcePool::new(PoolConfig::default(), || Ok(1));
    {
        let _claim = pool.acquire(0, None).unwrap();
        assert_eq!(pool.stats().active, 1);
    }
    assert_eq!(pool.stats().active, 0);
    assert_eq!(pool.stats().idle, 1);
}

#[test]
fn resource_claim_explicit_release_then_drop_is_idempotent() {
    let pool: std::sync::Arc<ResourcePool<u32>> =
        ResourcePool::new(PoolConfig::default(), || Ok(1));
    let mut claim = pool.acquire(0, None).unwrap();
    claim.release();
    assert_eq!(pool.stats().idle, 1);
    drop(claim);
    assert_eq!(pool.stats().idle, 1);
}
