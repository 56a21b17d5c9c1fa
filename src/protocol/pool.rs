//! Per-type object pool for message instances.
//!
//! Under sustained command load every request would otherwise allocate a
//! request, a response and their payload buffers. The pool keeps a bounded
//! free list per message type and hands out instances through a [`Pooled`]
//! handle.
//!
//! # Lifecycle
//!
//! 1. `acquire()` pops a recycled instance (or allocates a fresh one).
//! 2. The handle has exactly one owner at a time. Shared ownership goes
//!    through `Arc<Pooled<T>>`, whose reference count decides when the
//!    handle drops.
//! 3. Dropping the handle is the release point: the instance is reset and
//!    pushed back onto the free list, or discarded if the list is full.
//!
//! Reset happens on release, so an instance sitting in the free list never
//! carries data from its previous use.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Default number of idle instances kept per pool.
pub const DEFAULT_POOL_CAPACITY: usize = 1024;

/// A type that can be recycled by a [`Pool`].
pub trait Poolable: Default + Send {
    /// Scrub every field back to its default.
    ///
    /// Implementations should keep heap capacity (e.g. `Vec::clear`) so the
    /// next user can reuse it.
    fn reset(&mut self);
}

// =============================================================================
// POOL
// =============================================================================

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Instances created because the free list was empty.
    pub allocated: u64,
    /// Instances handed out from the free list.
    pub recycled: u64,
    /// Instances returned to the free list.
    pub released: u64,
    /// Instances dropped because the free list was full.
    pub discarded: u64,
}

#[derive(Default)]
struct PoolCounters {
    allocated: AtomicU64,
    recycled: AtomicU64,
    released: AtomicU64,
    discarded: AtomicU64,
}

struct PoolShared<T> {
    free: Mutex<Vec<T>>,
    capacity: usize,
    counters: PoolCounters,
}

impl<T: Poolable> PoolShared<T> {
    fn release(&self, mut value: T) {
        value.reset();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(value);
            self.counters.released.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// A bounded free list of `T` instances.
///
/// Cloning a pool yields another handle to the same free list. Each pool has
/// its own lock, so different message types never contend with each other.
pub struct Pool<T: Poolable> {
    shared: Arc<PoolShared<T>>,
}

impl<T: Poolable> Pool<T> {
    /// Create a pool keeping at most `capacity` idle instances.
    pub fn new(capacity: usize) -> Self {
        Pool {
            shared: Arc::new(PoolShared {
                free: Mutex::new(Vec::with_capacity(capacity.min(64))),
                capacity,
                counters: PoolCounters::default(),
            }),
        }
    }

    /// Take a reset instance from the pool.
    pub fn acquire(&self) -> Pooled<T> {
        let recycled = self.shared.free.lock().pop();
        let value = match recycled {
            Some(value) => {
                self.shared.counters.recycled.fetch_add(1, Ordering::Relaxed);
                value
            }
            None => {
                self.shared.counters.allocated.fetch_add(1, Ordering::Relaxed);
                T::default()
            }
        };
        Pooled {
            value,
            home: Some(Arc::clone(&self.shared)),
        }
    }

    /// Number of idle instances currently in the free list.
    pub fn idle(&self) -> usize {
        self.shared.free.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.shared.counters;
        PoolStats {
            allocated: c.allocated.load(Ordering::Relaxed),
            recycled: c.recycled.load(Ordering::Relaxed),
            released: c.released.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
        }
    }
}

impl<T: Poolable> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Pool {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Poolable> Default for Pool<T> {
    fn default() -> Self {
        Pool::new(DEFAULT_POOL_CAPACITY)
    }
}

impl<T: Poolable> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("capacity", &self.shared.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

// =============================================================================
// POOLED HANDLE
// =============================================================================

/// Exclusive owner of a pooled instance.
///
/// Only shared access is exposed publicly. Builders in this crate write
/// through [`Pooled::get_mut`] before the message is handed out.
pub struct Pooled<T: Poolable> {
    value: T,
    home: Option<Arc<PoolShared<T>>>,
}

impl<T: Poolable> Pooled<T> {
    /// Wrap a value that belongs to no pool. Dropping it simply frees it.
    pub fn detached(value: T) -> Self {
        Pooled { value, home: None }
    }

    /// True if dropping this handle returns the instance to a pool.
    pub fn is_pooled(&self) -> bool {
        self.home.is_some()
    }

    pub(crate) fn get_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: Poolable> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: Poolable> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(home) = self.home.take() {
            home.release(std::mem::take(&mut self.value));
        }
    }
}

impl<T: Poolable + PartialEq> PartialEq for Pooled<T> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<T: Poolable + Eq> Eq for Pooled<T> {}

impl<T: Poolable + fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.value.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[derive(Debug, Default, PartialEq)]
    struct Scratch {
        id: u64,
        data: Vec<u8>,
    }

    impl Poolable for Scratch {
        fn reset(&mut self) {
            self.id = 0;
            self.data.clear();
        }
    }

    #[test]
    fn test_release_resets_fields_but_keeps_capacity() {
        let pool: Pool<Scratch> = Pool::new(4);
        {
            let mut item = pool.acquire();
            item.get_mut().id = 7;
            item.get_mut().data.extend_from_slice(&[1u8; 128]);
        }
        assert_eq!(pool.idle(), 1);

        let item = pool.acquire();
        assert_eq!(item.id, 0);
        assert!(item.data.is_empty());
        assert!(item.data.capacity() >= 128);

        let stats = pool.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.recycled, 1);
        assert_eq!(stats.released, 1);
    }

    #[test]
    fn test_capacity_bounds_free_list() {
        let pool: Pool<Scratch> = Pool::new(2);
        let items: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        drop(items);
        assert_eq!(pool.idle(), 2);
        assert_eq!(pool.stats().discarded, 3);
    }

    #[test]
    fn test_shared_handle_releases_once_on_last_reference() {
        let pool: Pool<Scratch> = Pool::new(4);
        let shared = Arc::new(pool.acquire());
        let other = Arc::clone(&shared);
        drop(shared);
        assert_eq!(pool.idle(), 0);
        drop(other);
        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.stats().released, 1);
    }

    #[test]
    fn test_detached_never_returns() {
        let pool: Pool<Scratch> = Pool::new(4);
        let item = Pooled::detached(Scratch::default());
        assert!(!item.is_pooled());
        drop(item);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let pool: Pool<Scratch> = Pool::new(16);
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for i in 0..500u64 {
                        let mut item = pool.acquire();
                        assert_eq!(item.id, 0);
                        assert!(item.data.is_empty());
                        item.get_mut().id = t * 1000 + i;
                        item.get_mut().data.push(t as u8);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.allocated + stats.recycled, 8 * 500);
        assert!(pool.idle() <= 16);
    }
}
