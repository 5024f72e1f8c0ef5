//! ResourcePool: a size-classed byte buffer recycler with an
//! expiration sweep, plus a weak-tracked external resource handle registry.
//!
//! A `BufferPool`/`PooledBuffer`-style RAII guard (free list per class
//! behind a mutex, atomic stats, auto-return on drop), extended with
//! power-of-two size classing: free lists are keyed by class size instead
//! of being a single undifferentiated pool.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::error::{IsolationError, Result};

/// Round up to the nearest power of two, minimum 1.
pub fn ceil_pow2(n: u32) -> u32 {
    if n <= 1 {
        return 1;
    }
    1u32 << (32 - (n - 1).leading_zeros())
}

/// A buffer handed out by [`ResourcePool::get_buffer`]. Returns itself to
/// the pool's free list on drop, zeroing its payload first.
pub struct ResourceBuffer {
    data: Vec<u8>,
    class: u32,
    creation_time: Instant,
    last_access_time: Instant,
    access_count: u64,
    pool: Weak<ResourcePoolInner>,
    disposed: bool,
}

impl ResourceBuffer {
    fn fresh(class: u32, pool: Weak<ResourcePoolInner>) -> Self {
        let now = Instant::now();
        Self {
            data: vec![0u8; class as usize],
            class,
            creation_time: now,
            last_access_time: now,
            access_count: 0,
            pool,
            disposed: false,
        }
    }

    fn reset_for_reuse(&mut self) {
        self.data.iter_mut().for_each(|b| *b = 0);
        self.last_access_time = Instant::now();
        self.access_count = 0;
    }

    pub fn size(&self) -> u32 {
        self.class
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.access_count += 1;
        self.last_access_time = Instant::now();
        &mut self.data
    }

    pub fn is_expired(&self, idle_expire: Duration) -> bool {
        self.last_access_time.elapsed() >= idle_expire || self.access_count > 1000
    }
}

impl Drop for ResourceBuffer {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.reclaim(self.class, std::mem::take(&mut self.data));
        }
    }
}

/// A tagged external resource released when dropped, with an optional
/// absolute expiration. Weak-tracked: the pool's `handles` map holds only a
/// `Weak<()>` liveness token, so the registry entry never keeps this handle
/// alive, and this handle's `Drop` proactively removes its own entry rather
/// than waiting on a later `cleanup_expired` sweep to notice it is gone.
pub struct ResourceHandle<T> {
    pub id: String,
    resource: Option<T>,
    expires_at: Option<Instant>,
    pool: Weak<ResourcePoolInner>,
    _liveness: Arc<()>,
}

impl<T> ResourceHandle<T> {
    pub fn get(&self) -> Option<&T> {
        if self.is_expired() { None } else { self.resource.as_ref() }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|e| Instant::now() >= e)
    }
}

impl<T> Drop for ResourceHandle<T> {
    fn drop(&mut self) {
        self.resource.take();
        if let Some(pool) = self.pool.upgrade() {
            pool.handles.remove(&self.id);
        }
    }
}

#[derive(Debug, Default)]
struct ClassStats {
    total_created: AtomicU64,
    total_reused: AtomicU64,
    total_discarded: AtomicU64,
    total_returned: AtomicU64,
}

/// Point-in-time view of pool state, used by observability.
#[derive(Clone, Debug, Default)]
pub struct PoolStatisticsSnapshot {
    pub total_created: u64,
    pub total_reused: u64,
    pub total_discarded: u64,
    pub total_returned: u64,
    pub in_use: i64,
    pub peak_in_use: i64,
    pub free_by_class: HashMap<u32, usize>,
    pub active_handles: usize,
}

/// A pooled buffer keeps the `Instant` it was returned at, so
/// `cleanup_expired` can actually tell idle entries apart from fresh ones —
/// without it the free list is just a pile of `Vec<u8>`s with no age.
struct FreeList {
    buffers: Mutex<VecDeque<(Instant, Vec<u8>)>>,
    stats: ClassStats,
}

impl Default for FreeList {
    fn default() -> Self {
        Self {
            buffers: Mutex::new(VecDeque::new()),
            stats: ClassStats::default(),
        }
    }
}

struct HandleEntry {
    expires_at: Option<Instant>,
    /// Collected when the owning `ResourceHandle` drops. A dangling weak
    /// ref here means the handle was dropped before its TTL (if any)
    /// elapsed, and `cleanup_expired` should reap it either way.
    liveness: Weak<()>,
}

struct ResourcePoolInner {
    classes: DashMap<u32, Arc<FreeList>>,
    handles: DashMap<String, HandleEntry>,
    max_pooled: usize,
    max_buffer_size: u32,
    idle_expire: Duration,
    in_use: AtomicI64,
    peak_in_use: AtomicI64,
}

impl ResourcePoolInner {
    fn free_list(&self, class: u32) -> Arc<FreeList> {
        self.classes.entry(class).or_default().clone()
    }

    fn reclaim(&self, class: u32, mut data: Vec<u8>) {
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        let list = self.free_list(class);
        let mut guard = list.buffers.lock().unwrap();
        if guard.len() < self.max_pooled {
            data.iter_mut().for_each(|b| *b = 0);
            guard.push_back((Instant::now(), data));
            list.stats.total_returned.fetch_add(1, Ordering::Relaxed);
        } else {
            list.stats.total_discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn bump_in_use(&self) {
        let now = self.in_use.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_in_use.fetch_max(now, Ordering::Relaxed);
    }
}

/// Size-classed buffer recycler + expiration sweep + weak resource handles.
#[derive(Clone)]
pub struct ResourcePool {
    inner: Arc<ResourcePoolInner>,
}

impl ResourcePool {
    pub fn new(max_pooled: usize, max_buffer_size: u32, idle_expire: Duration) -> Self {
        Self {
            inner: Arc::new(ResourcePoolInner {
                classes: DashMap::new(),
                handles: DashMap::new(),
                max_pooled,
                max_buffer_size,
                idle_expire,
                in_use: AtomicI64::new(0),
                peak_in_use: AtomicI64::new(0),
            }),
        }
    }

    /// Returns a buffer of size `ceil_pow2(size)`, clamped to `max_buffer_size`.
    pub fn get_buffer(&self, size: u32) -> Result<ResourceBuffer> {
        if size == 0 {
            return Err(IsolationError::InvalidArgument(
                "get_buffer requires size > 0".to_string(),
            ));
        }
        let class = ceil_pow2(size).min(self.inner.max_buffer_size);
        let list = self.inner.free_list(class);

        self.inner.bump_in_use();

        let reused = {
            let mut guard = list.buffers.lock().unwrap();
            guard.pop_front().map(|(_, data)| data)
        };

        let mut buffer = if let Some(data) = reused {
            list.stats.total_reused.fetch_add(1, Ordering::Relaxed);
            let mut b = ResourceBuffer {
                data,
                class,
                creation_time: Instant::now(),
                last_access_time: Instant::now(),
                access_count: 0,
                pool: Arc::downgrade(&self.inner),
                disposed: false,
            };
            b.reset_for_reuse();
            b
        } else {
            list.stats.total_created.fetch_add(1, Ordering::Relaxed);
            ResourceBuffer::fresh(class, Arc::downgrade(&self.inner))
        };
        buffer.last_access_time = Instant::now();
        Ok(buffer)
    }

    /// Register a weak-tracked external resource with an optional TTL.
    pub fn create_handle<T>(
        &self,
        id: impl Into<String>,
        resource: T,
        ttl: Option<Duration>,
    ) -> ResourceHandle<T> {
        let id = id.into();
        let liveness = Arc::new(());
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.inner.handles.insert(
            id.clone(),
            HandleEntry {
                expires_at,
                liveness: Arc::downgrade(&liveness),
            },
        );
        ResourceHandle {
            id,
            resource: Some(resource),
            expires_at,
            pool: Arc::downgrade(&self.inner),
            _liveness: liveness,
        }
    }

    /// Remove expired buffers and collected/expired handles. Intended to be
    /// invoked every `cleanup_interval` (default 60s) by the owning manager.
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        for entry in self.inner.classes.iter() {
            let list = entry.value();
            let mut guard = list.buffers.lock().unwrap();
            let before = guard.len();
            guard.retain(|(returned_at, _)| now.duration_since(*returned_at) < self.inner.idle_expire);
            let expired = before - guard.len();
            if expired > 0 {
                list.stats.total_discarded.fetch_add(expired as u64, Ordering::Relaxed);
            }
            // `reclaim` already refuses pushes beyond `max_pooled`, so this
            // only trims any backlog the idle sweep above didn't already clear.
            if guard.len() > self.inner.max_pooled {
                guard.truncate(self.inner.max_pooled);
            }
        }
        // A handle is reaped once its TTL has elapsed, *or* once its owning
        // `ResourceHandle` has dropped without that drop having already
        // removed the entry (the `liveness` weak ref goes dangling either way).
        self.inner.handles.retain(|_, entry| {
            let ttl_elapsed = entry.expires_at.is_some_and(|e| now >= e);
            let collected = entry.liveness.strong_count() == 0;
            !ttl_elapsed && !collected
        });
    }

    pub fn snapshot(&self) -> PoolStatisticsSnapshot {
        let mut total_created = 0;
        let mut total_reused = 0;
        let mut total_discarded = 0;
        let mut total_returned = 0;
        let mut free_by_class = HashMap::new();

        for entry in self.inner.classes.iter() {
            let (class, list) = (*entry.key(), entry.value());
            total_created += list.stats.total_created.load(Ordering::Relaxed);
            total_reused += list.stats.total_reused.load(Ordering::Relaxed);
            total_discarded += list.stats.total_discarded.load(Ordering::Relaxed);
            total_returned += list.stats.total_returned.load(Ordering::Relaxed);
            free_by_class.insert(class, list.buffers.lock().unwrap().len());
        }

        PoolStatisticsSnapshot {
            total_created,
            total_reused,
            total_discarded,
            total_returned,
            in_use: self.inner.in_use.load(Ordering::Relaxed),
            peak_in_use: self.inner.peak_in_use.load(Ordering::Relaxed),
            free_by_class,
            active_handles: self.inner.handles.len(),
        }
    }

    pub fn idle_expire(&self) -> Duration {
        self.inner.idle_expire
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceil_pow2_rounds_up_and_floors_at_one() {
        assert_eq!(ceil_pow2(0), 1);
        assert_eq!(ceil_pow2(1), 1);
        assert_eq!(ceil_pow2(2), 2);
        assert_eq!(ceil_pow2(3), 4);
        assert_eq!(ceil_pow2(1024), 1024);
        assert_eq!(ceil_pow2(1025), 2048);
    }

    #[test]
    fn get_buffer_clamps_to_max_size() {
        let pool = ResourcePool::new(100, 65536, Duration::from_secs(300));
        let buf = pool.get_buffer(1_000_000).unwrap();
        assert_eq!(buf.size(), 65536);
    }

    #[test]
    fn get_buffer_rejects_zero_size() {
        let pool = ResourcePool::new(100, 65536, Duration::from_secs(300));
        assert!(matches!(
            pool.get_buffer(0),
            Err(IsolationError::InvalidArgument(_))
        ));
    }

    #[test]
    fn buffers_are_zeroed_on_reuse() {
        let pool = ResourcePool::new(100, 65536, Duration::from_secs(300));
        {
            let mut buf = pool.get_buffer(128).unwrap();
            buf.data_mut().fill(0xAB);
        }
        let buf = pool.get_buffer(128).unwrap();
        assert!(buf.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn in_use_returns_to_baseline_after_drop() {
        let pool = ResourcePool::new(100, 65536, Duration::from_secs(300));
        let before = pool.snapshot().in_use;
        {
            let _a = pool.get_buffer(64).unwrap();
            let _b = pool.get_buffer(64).unwrap();
            assert_eq!(pool.snapshot().in_use, before + 2);
        }
        assert_eq!(pool.snapshot().in_use, before);
    }

    #[test]
    fn discards_beyond_max_pooled() {
        let pool = ResourcePool::new(1, 65536, Duration::from_secs(300));
        {
            let _a = pool.get_buffer(64).unwrap();
            let _b = pool.get_buffer(64).unwrap();
        }
        let snap = pool.snapshot();
        assert_eq!(snap.free_by_class.get(&64), Some(&1));
        assert_eq!(snap.total_discarded, 1);
    }

    #[test]
    fn reuse_is_counted_separately_from_creation() {
        let pool = ResourcePool::new(100, 65536, Duration::from_secs(300));
        {
            let _a = pool.get_buffer(64).unwrap();
        }
        let _b = pool.get_buffer(64).unwrap();
        let snap = pool.snapshot();
        assert_eq!(snap.total_created, 1);
        assert_eq!(snap.total_reused, 1);
    }

    #[test]
    fn cleanup_expired_evicts_buffers_idle_past_the_expiry_window() {
        let pool = ResourcePool::new(100, 65536, Duration::from_millis(10));
        {
            let _a = pool.get_buffer(64).unwrap();
        }
        assert_eq!(pool.snapshot().free_by_class.get(&64), Some(&1));

        std::thread::sleep(Duration::from_millis(20));
        pool.cleanup_expired();

        let snap = pool.snapshot();
        assert_eq!(snap.free_by_class.get(&64), Some(&0));
        assert_eq!(snap.total_discarded, 1);
    }

    #[test]
    fn cleanup_expired_keeps_recently_returned_buffers() {
        let pool = ResourcePool::new(100, 65536, Duration::from_secs(300));
        {
            let _a = pool.get_buffer(64).unwrap();
        }
        pool.cleanup_expired();
        assert_eq!(pool.snapshot().free_by_class.get(&64), Some(&1));
    }

    #[test]
    fn dropping_a_handle_removes_it_without_waiting_for_a_cleanup_sweep() {
        let pool = ResourcePool::new(100, 65536, Duration::from_secs(300));
        {
            let _handle = pool.create_handle("session-1", 42, None);
            assert_eq!(pool.snapshot().active_handles, 1);
        }
        assert_eq!(pool.snapshot().active_handles, 0);
    }

    #[test]
    fn cleanup_expired_reaps_a_ttl_expired_handle() {
        let pool = ResourcePool::new(100, 65536, Duration::from_secs(300));
        let handle = pool.create_handle("session-2", 7, Some(Duration::from_millis(10)));
        std::thread::sleep(Duration::from_millis(20));
        assert!(handle.is_expired());

        pool.cleanup_expired();
        assert_eq!(pool.snapshot().active_handles, 0);
        drop(handle);
    }

    #[test]
    fn a_handle_with_no_ttl_survives_cleanup_until_dropped() {
        let pool = ResourcePool::new(100, 65536, Duration::from_secs(300));
        let handle = pool.create_handle("session-3", "value", None);
        pool.cleanup_expired();
        assert_eq!(pool.snapshot().active_handles, 1);
        drop(handle);
        assert_eq!(pool.snapshot().active_handles, 0);
    }
}
