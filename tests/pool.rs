//! Pool behavior exercised against an in-memory resource manager.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use warren::pool::{Manage, PoolError, ResourcePool};

/// Hands out sequentially numbered resources and counts disposals.
#[derive(Default)]
struct Counters {
    created: AtomicUsize,
    destroyed: AtomicUsize,
}

#[derive(Clone, Default)]
struct NumberManager {
    counters: Arc<Counters>,
}

#[async_trait::async_trait]
impl Manage for NumberManager {
    type Resource = usize;

    async fn create(&self) -> Result<usize, anyhow::Error> {
        Ok(self.counters.created.fetch_add(1, Ordering::SeqCst))
    }

    async fn destroy(&self, _resource: usize) {
        self.counters.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn resources_are_reused_in_fifo_order() {
    let manager = NumberManager::default();
    let counters = Arc::clone(&manager.counters);
    let pool = ResourcePool::new(manager, 2);

    let first = pool.acquire().await.unwrap();
    let second = pool.acquire().await.unwrap();
    assert_eq!((*first, *second), (0, 1));
    drop(first);
    drop(second);

    // Both resources are back in the idle set; no new ones get created.
    let reused = pool.acquire().await.unwrap();
    assert_eq!(*reused, 0);
    assert_eq!(counters.created.load(Ordering::SeqCst), 2);
    assert_eq!(pool.idle_count(), 1);
}

#[tokio::test]
async fn acquire_blocks_at_capacity_until_a_resource_is_released() {
    let pool = ResourcePool::new(NumberManager::default(), 1);

    let held = pool.acquire().await.unwrap();
    let blocked = timeout(Duration::from_millis(50), pool.acquire()).await;
    assert!(blocked.is_err(), "acquire should block while at capacity");

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await.map(|guard| *guard) })
    };
    sleep(Duration::from_millis(20)).await;
    drop(held);

    let reacquired = timeout(Duration::from_millis(200), waiter)
        .await
        .expect("acquire should resume once a resource is released")
        .unwrap()
        .unwrap();
    assert_eq!(reacquired, 0);
}

#[tokio::test]
async fn destroyed_resources_are_replaced_not_reused() {
    let manager = NumberManager::default();
    let counters = Arc::clone(&manager.counters);
    let pool = ResourcePool::new(manager, 1);

    let broken = pool.acquire().await.unwrap();
    broken.destroy().await;
    assert_eq!(counters.destroyed.load(Ordering::SeqCst), 1);

    let replacement = pool.acquire().await.unwrap();
    assert_eq!(*replacement, 1, "a fresh resource should be created");
}

#[tokio::test(start_paused = true)]
async fn only_resources_past_the_idle_threshold_are_evicted() {
    let manager = NumberManager::default();
    let counters = Arc::clone(&manager.counters);
    let pool = ResourcePool::new(manager, 2);

    let old = pool.acquire().await.unwrap();
    let young = pool.acquire().await.unwrap();
    drop(old);
    tokio::time::advance(Duration::from_secs(31)).await;
    drop(young);

    pool.evict_idle(Duration::from_secs(30)).await;
    assert_eq!(counters.destroyed.load(Ordering::SeqCst), 1);
    assert_eq!(pool.idle_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn guards_dropped_during_close_are_never_stranded_in_the_idle_set() {
    for _ in 0..200 {
        let manager = NumberManager::default();
        let pool = ResourcePool::new(manager, 2);
        let guard = pool.acquire().await.unwrap();

        let dropper = tokio::spawn(async move {
            drop(guard);
        });
        let closer = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.close().await;
            })
        };
        let (dropped, closed) = tokio::join!(dropper, closer);
        dropped.unwrap();
        closed.unwrap();

        // Whichever side won the race, nothing may linger in the idle set
        // of a closed pool.
        assert_eq!(pool.idle_count(), 0);
    }
}

#[tokio::test]
async fn a_closed_pool_rejects_acquisitions_and_disposes_idle_resources() {
    let manager = NumberManager::default();
    let counters = Arc::clone(&manager.counters);
    let pool = ResourcePool::new(manager, 2);

    let guard = pool.acquire().await.unwrap();
    drop(pool.acquire().await.unwrap());
    assert_eq!(pool.idle_count(), 1);

    pool.close().await;
    assert!(pool.is_closed());
    assert_eq!(counters.destroyed.load(Ordering::SeqCst), 1);
    assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));

    // The in-flight guard is handed back to the manager on drop.
    drop(guard);
    tokio::task::yield_now().await;
    assert_eq!(counters.destroyed.load(Ordering::SeqCst), 2);
}
