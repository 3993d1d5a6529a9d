// SPDX-License-Identifier: Apache-2.0

//! Object pools for hot-path maps and scratch buffers.
//!
//! A run rents its parameter bag, framework items map and temporary
//! buffers at start and returns them at completion. Pooling is opt-in:
//! callers that supply their own maps retain ownership and those maps
//! never enter a pool. Rentals take a capacity hint so a reused object
//! does not immediately resize.

use parking_lot::Mutex;
use serde_json::Value;
use std::borrow::Cow;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Objects that can live in a [`Pool`].
pub trait Poolable: Send + 'static {
    /// Creates a fresh object sized for the given hint.
    fn with_capacity(hint: usize) -> Self;

    /// Clears the object before it re-enters the pool.
    fn reset(&mut self);

    /// The object's current capacity, used to honor rental hints.
    fn capacity(&self) -> usize;
}

/// The map type used for parameter bags and framework item maps.
pub type KeyValueMap = HashMap<Cow<'static, str>, Value>;

impl Poolable for KeyValueMap {
    fn with_capacity(hint: usize) -> Self {
        HashMap::with_capacity(hint)
    }

    fn reset(&mut self) {
        self.clear();
    }

    fn capacity(&self) -> usize {
        HashMap::capacity(self)
    }
}

impl Poolable for Vec<u8> {
    fn with_capacity(hint: usize) -> Self {
        Vec::with_capacity(hint)
    }

    fn reset(&mut self) {
        self.clear();
    }

    fn capacity(&self) -> usize {
        Vec::capacity(self)
    }
}

/// A bounded pool of reusable objects.
pub struct Pool<T: Poolable> {
    idle: Mutex<Vec<T>>,
    max_idle: usize,
}

impl<T: Poolable> Pool<T> {
    /// Creates a pool retaining at most `max_idle` returned objects.
    #[must_use]
    pub fn new(max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            idle: Mutex::new(Vec::new()),
            max_idle,
        })
    }

    /// Rents an object with at least the requested capacity.
    ///
    /// Prefers an idle object whose capacity already satisfies the hint;
    /// otherwise allocates a fresh one.
    pub fn rent(self: &Arc<Self>, capacity_hint: usize) -> Pooled<T> {
        let mut idle = self.idle.lock();
        let position = idle.iter().position(|item| item.capacity() >= capacity_hint);
        let value = match position {
            Some(pos) => idle.swap_remove(pos),
            None => T::with_capacity(capacity_hint),
        };
        drop(idle);

        Pooled {
            value: Some(value),
            pool: Arc::downgrade(self),
        }
    }

    /// Number of idle objects currently held.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    fn give_back(&self, mut value: T) {
        value.reset();
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(value);
        }
    }
}

/// A rented object that returns to its pool on drop.
pub struct Pooled<T: Poolable> {
    value: Option<T>,
    pool: std::sync::Weak<Pool<T>>,
}

impl<T: Poolable> Pooled<T> {
    /// Detaches the object from the pool, transferring ownership to the
    /// caller. The object will not be returned.
    #[must_use]
    pub fn detach(mut self) -> T {
        self.value.take().expect("Pooled value already taken")
    }
}

impl<T: Poolable> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("Pooled value already taken")
    }
}

impl<T: Poolable> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("Pooled value already taken")
    }
}

impl<T: Poolable> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let (Some(value), Some(pool)) = (self.value.take(), self.pool.upgrade()) {
            pool.give_back(value);
        }
    }
}

/// The pools shared by all runs of an engine instance.
pub struct Pools {
    /// Pool for parameter bags.
    pub params: Arc<Pool<KeyValueMap>>,
    /// Pool for framework item maps.
    pub items: Arc<Pool<KeyValueMap>>,
    /// Pool for temporary byte buffers.
    pub buffers: Arc<Pool<Vec<u8>>>,
}

impl Default for Pools {
    fn default() -> Self {
        Self {
            params: Pool::new(DEFAULT_MAX_IDLE),
            items: Pool::new(DEFAULT_MAX_IDLE),
            buffers: Pool::new(DEFAULT_MAX_IDLE),
        }
    }
}

const DEFAULT_MAX_IDLE: usize = 32;

impl Pools {
    /// Creates the default pool set.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rent_and_return_reuses_objects() {
        let pool: Arc<Pool<KeyValueMap>> = Pool::new(4);

        {
            let mut map = pool.rent(8);
            let _ = map.insert("k".into(), Value::from(1));
            assert_eq!(map.len(), 1);
        }
        assert_eq!(pool.idle_count(), 1);

        // The returned object comes back cleared.
        let map = pool.rent(0);
        assert!(map.is_empty());
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_capacity_hint_skips_undersized_objects() {
        let pool: Arc<Pool<Vec<u8>>> = Pool::new(4);
        {
            let _small = pool.rent(8);
        }
        let big = pool.rent(1024);
        assert!(big.capacity() >= 1024);
    }

    #[test]
    fn test_detach_keeps_object_out_of_pool() {
        let pool: Arc<Pool<Vec<u8>>> = Pool::new(4);
        let buffer = pool.rent(16);
        let owned = buffer.detach();
        drop(owned);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_pool_bounds_idle_objects() {
        let pool: Arc<Pool<Vec<u8>>> = Pool::new(1);
        let a = pool.rent(4);
        let b = pool.rent(4);
        drop(a);
        drop(b);
        assert_eq!(pool.idle_count(), 1);
    }
}
