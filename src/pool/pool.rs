use super::PoolError;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

/// Creation and disposal of pooled resources.
///
/// Implementors decide what a resource is and how it is built; the pool owns
/// bounding, reuse and idle-age bookkeeping. [`ChannelManager`](super::ChannelManager)
/// is the implementation used by [`Publisher`](crate::publishers::Publisher).
#[async_trait::async_trait]
pub trait Manage: Send + Sync + 'static {
    type Resource: Send + 'static;

    /// Build a new resource.
    ///
    /// `create` may retry internally; it is only polled while an acquiring
    /// caller is waiting on it.
    async fn create(&self) -> Result<Self::Resource, anyhow::Error>;

    /// Dispose of a resource that left the pool for good.
    async fn destroy(&self, resource: Self::Resource);
}

/// A bounded pool of reusable resources.
///
/// `ResourcePool` is a cheap-clone handle. At most `max_size` resources exist
/// at any time, counting both idle and in-use ones; [`ResourcePool::acquire`]
/// blocks while the pool is at capacity until a resource is released or
/// destroyed.
pub struct ResourcePool<M: Manage> {
    inner: Arc<PoolInner<M>>,
}

impl<M: Manage> Clone for ResourcePool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct PoolInner<M: Manage> {
    manager: M,
    slots: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleResource<M::Resource>>>,
}

struct IdleResource<T> {
    resource: T,
    since: Instant,
}

impl<M: Manage> PoolInner<M> {
    fn idle(&self) -> MutexGuard<'_, VecDeque<IdleResource<M::Resource>>> {
        // A poisoned lock only means another caller panicked mid-push;
        // the queue itself is still structurally sound.
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<M: Manage> ResourcePool<M> {
    /// Create a pool bounded at `max_size` resources.
    ///
    /// Resources are created lazily, on the first `acquire` that finds no
    /// idle one.
    pub fn new(manager: M, max_size: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                manager,
                slots: Arc::new(Semaphore::new(max_size)),
                idle: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Acquire a resource, reusing an idle one when available and creating a
    /// new one otherwise.
    ///
    /// Blocks while the pool is at capacity; fails with [`PoolError::Closed`]
    /// if the pool is torn down while waiting. Callers that need a deadline
    /// wrap the future in `tokio::time::timeout`.
    pub async fn acquire(&self) -> Result<Pooled<M>, PoolError> {
        let permit = Arc::clone(&self.inner.slots)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        if let Some(idle) = self.inner.idle().pop_front() {
            return Ok(Pooled::new(self.clone(), idle.resource, permit));
        }

        let resource = self
            .inner
            .manager
            .create()
            .await
            .map_err(PoolError::Resource)?;
        Ok(Pooled::new(self.clone(), resource, permit))
    }

    /// Destroy idle resources that have been unused for longer than
    /// `max_idle`; younger ones stay in the idle set.
    pub async fn evict_idle(&self, max_idle: Duration) {
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut idle = self.inner.idle();
            let mut kept = VecDeque::with_capacity(idle.len());
            while let Some(entry) = idle.pop_front() {
                if now.duration_since(entry.since) > max_idle {
                    expired.push(entry.resource);
                } else {
                    kept.push_back(entry);
                }
            }
            *idle = kept;
        }

        if !expired.is_empty() {
            debug!(evicted = expired.len(), "evicting idle pooled resources");
        }
        for resource in expired {
            self.inner.manager.destroy(resource).await;
        }
    }

    /// Tear the pool down.
    ///
    /// Pending and future `acquire` calls fail with [`PoolError::Closed`];
    /// idle resources are destroyed immediately, in-flight ones when their
    /// guard is dropped.
    pub async fn close(&self) {
        self.inner.slots.close();
        let drained: Vec<_> = self.inner.idle().drain(..).collect();
        for entry in drained {
            self.inner.manager.destroy(entry.resource).await;
        }
    }

    /// Whether [`ResourcePool::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.inner.slots.is_closed()
    }

    /// Number of resources currently sitting idle.
    pub fn idle_count(&self) -> usize {
        self.inner.idle().len()
    }
}

/// An acquired resource.
///
/// Dropping the guard returns the resource to the idle set; a caller that
/// observed an error on the resource must call [`Pooled::destroy`] instead -
/// a broken channel is never put back into rotation.
pub struct Pooled<M: Manage> {
    pool: ResourcePool<M>,
    resource: Option<M::Resource>,
    _permit: OwnedSemaphorePermit,
}

impl<M: Manage> Pooled<M> {
    fn new(pool: ResourcePool<M>, resource: M::Resource, permit: OwnedSemaphorePermit) -> Self {
        Self {
            pool,
            resource: Some(resource),
            _permit: permit,
        }
    }

    /// Dispose of the resource instead of returning it to the pool.
    pub async fn destroy(mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.inner.manager.destroy(resource).await;
        }
    }
}

impl<M: Manage> Deref for Pooled<M> {
    type Target = M::Resource;

    fn deref(&self) -> &Self::Target {
        self.resource
            .as_ref()
            .unwrap_or_else(|| unreachable!("resource taken out of a live guard"))
    }
}

impl<M: Manage> DerefMut for Pooled<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.resource
            .as_mut()
            .unwrap_or_else(|| unreachable!("resource taken out of a live guard"))
    }
}

impl<M: Manage> Drop for Pooled<M> {
    fn drop(&mut self) {
        let Some(resource) = self.resource.take() else {
            return;
        };
        // The closed check and the push must happen under the idle lock:
        // `close` drains the idle set under the same lock after closing the
        // semaphore, so a resource pushed here while the pool is still open
        // is always seen by that drain.
        {
            let mut idle = self.pool.inner.idle();
            if !self.pool.is_closed() {
                idle.push_back(IdleResource {
                    resource,
                    since: Instant::now(),
                });
                return;
            }
        }
        // The pool was torn down while this resource was in use; hand it
        // back to the manager rather than leaking it.
        let pool = self.pool.clone();
        tokio::spawn(async move {
            pool.inner.manager.destroy(resource).await;
        });
    }
}
