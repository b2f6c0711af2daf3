//! Instance caches for the DI container
//!
//! Uses DashMap for sharded concurrent access. Each key maps to its own
//! async once-cell, so constructing one service never blocks resolution of
//! an unrelated one and concurrent callers for the same key wait on that
//! key's cell only.

use crate::ServiceKey;
use crate::factory::AnyService;
use ahash::RandomState;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::OnceCell;

/// Only the call that built the instance has seen it.
const OWNED: u8 = 0;
/// Some other call received the instance; it can no longer be rolled back.
const SHARED: u8 = 1;
/// The building call failed and is taking the instance back.
const RETRACTED: u8 = 2;

/// A per-key construction slot.
///
/// The first caller to run [`Slot::get_or_try_init`] claims the slot; everyone
/// else suspends until it is filled. A failed initialization leaves the slot
/// empty for the next caller.
///
/// A filled slot also tracks whether the instance has escaped the call that
/// built it. Callers other than the builder must [`share`](Slot::share) the
/// instance before using it; once shared, a failing builder leaves it cached.
#[derive(Default)]
pub(crate) struct Slot {
    cell: OnceCell<AnyService>,
    state: AtomicU8,
}

impl Slot {
    #[inline]
    pub fn get(&self) -> Option<&AnyService> {
        self.cell.get()
    }

    /// Fill the slot with `init` unless someone else already has.
    ///
    /// The boolean is `true` when this caller's `init` produced the instance.
    pub async fn get_or_try_init<E, F, Fut>(&self, init: F) -> Result<(AnyService, bool), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AnyService, E>>,
    {
        let mut built = false;
        let instance = self
            .cell
            .get_or_try_init(|| {
                built = true;
                init()
            })
            .await?;
        Ok((Arc::clone(instance), built))
    }

    /// Mark the instance as held by a caller that did not build it.
    ///
    /// Returns `false` if the builder is already retracting it; the caller
    /// must then look the key up again.
    pub fn share(&self) -> bool {
        match self
            .state
            .compare_exchange(OWNED, SHARED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(state) => state == SHARED,
        }
    }

    fn retract(&self) -> bool {
        self.state
            .compare_exchange(OWNED, RETRACTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[cfg(test)]
    fn set(&self, instance: AnyService) -> bool {
        self.cell.set(instance).is_ok()
    }
}

/// Thread-safe cache of constructed instances.
///
/// Used for the container's singletons and for each scope's scoped instances.
pub(crate) struct InstanceCache {
    slots: DashMap<ServiceKey, Arc<Slot>, RandomState>,
}

impl InstanceCache {
    /// Create new empty cache with optimized shard count.
    ///
    /// Uses 8 shards; default DashMap uses num_cpus * 4 shards which is
    /// overkill for typical per-scope caches holding a handful of services.
    #[inline]
    pub fn new() -> Self {
        Self {
            slots: DashMap::with_capacity_and_hasher_and_shard_amount(0, RandomState::new(), 8),
        }
    }

    /// Create with pre-allocated capacity and a shard count scaled to it.
    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        let shard_amount = if capacity <= 16 {
            8
        } else if capacity <= 64 {
            16
        } else {
            32
        };
        Self {
            slots: DashMap::with_capacity_and_hasher_and_shard_amount(
                capacity,
                RandomState::new(),
                shard_amount,
            ),
        }
    }

    /// The slot for `key`, if its instance has been constructed.
    #[inline]
    pub fn filled(&self, key: &ServiceKey) -> Option<Arc<Slot>> {
        self.slots
            .get(key)
            .filter(|entry| entry.value().get().is_some())
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Get (or create) the construction slot for `key`.
    ///
    /// The map guard is released before returning, so callers may await on
    /// the slot freely.
    #[inline]
    pub fn slot(&self, key: &ServiceKey) -> Arc<Slot> {
        Arc::clone(&*self.slots.entry(key.clone()).or_default())
    }

    /// Take back `instance` from `key`, unless another caller has shared it.
    ///
    /// Returns whether the instance was removed. The ownership check and the
    /// removal happen under the same shard lock, so a concurrent
    /// [`Slot::share`] either lands first (and the instance stays) or sees
    /// the retraction.
    pub fn retract(&self, key: &ServiceKey, instance: &AnyService) -> bool {
        self.slots
            .remove_if(key, |_, slot| {
                slot.get().is_some_and(|cached| Arc::ptr_eq(cached, instance)) && slot.retract()
            })
            .is_some()
    }

    /// Number of constructed instances.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|e| e.value().get().is_some()).count()
    }

    /// Drop every cached instance.
    #[inline]
    pub fn clear(&self) {
        self.slots.clear();
    }
}

impl Default for InstanceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InstanceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceCache")
            .field("count", &self.len())
            .finish()
    }
}
