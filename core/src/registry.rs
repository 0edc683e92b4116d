//! The instance-id arena shared by both sides of the bridge.
//!
//! Plugin instances (and the callback objects that cross the boundary with
//! them) are named by process-wide monotonically increasing ids instead of by
//! references, so neither side ever holds a long-lived owning reference into
//! the other's object graph. Lookups hand back the reader guard together with
//! the value, keeping the entry alive for exactly as long as the caller uses
//! it.

use fnv::FnvHashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard};

/// Names one plugin instance for the lifetime of a worker process. Never
/// reused.
pub type InstanceId = u64;

pub struct InstanceRegistry<T> {
    entries: RwLock<FnvHashMap<InstanceId, T>>,
    next_instance_id: AtomicU64,
}

/// A registry entry together with the reader lock guard that keeps it alive.
pub struct InstanceRef<'a, T> {
    guard: RwLockReadGuard<'a, FnvHashMap<InstanceId, T>>,
    instance_id: InstanceId,
}

impl<T> Deref for InstanceRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard[&self.instance_id]
    }
}

impl<T> Default for InstanceRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> InstanceRegistry<T> {
    pub fn new() -> Self {
        Self { entries: RwLock::new(FnvHashMap::default()), next_instance_id: AtomicU64::new(0) }
    }

    /// Issue the next instance id. Ids count up from zero and are unique for
    /// the lifetime of the process.
    pub fn generate_instance_id(&self) -> InstanceId {
        self.next_instance_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Register an instance under a fresh id.
    pub fn register(&self, value: T) -> InstanceId {
        let instance_id = self.generate_instance_id();
        self.register_with_id(instance_id, value);

        instance_id
    }

    /// Register an instance under an id issued earlier (the foreign side
    /// issues the id during `create` and inserts once initialization
    /// finished).
    pub fn register_with_id(&self, instance_id: InstanceId, value: T) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let previous = entries.insert(instance_id, value);
        debug_assert!(previous.is_none(), "instance id {} was registered twice", instance_id);
    }

    /// Look up an instance, holding the reader lock for as long as the
    /// returned reference is used.
    pub fn get(&self, instance_id: InstanceId) -> Option<InstanceRef<'_, T>> {
        let guard = self.entries.read().unwrap_or_else(|e| e.into_inner());
        if guard.contains_key(&instance_id) {
            Some(InstanceRef { guard, instance_id })
        } else {
            None
        }
    }

    /// Remove and return an instance. Takes the writer lock, so this blocks
    /// until every outstanding lookup guard has been dropped.
    pub fn unregister(&self, instance_id: InstanceId) -> Option<T> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(&instance_id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` for every registered instance under the reader lock.
    pub fn for_each(&self, mut f: impl FnMut(InstanceId, &T)) {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        for (instance_id, value) in entries.iter() {
            f(*instance_id, value);
        }
    }

    /// Drain every entry. Used during shutdown so the instances drop outside
    /// the lock.
    pub fn drain(&self) -> Vec<(InstanceId, T)> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_get_unregister() {
        let registry: InstanceRegistry<String> = InstanceRegistry::new();

        let id_a = registry.register("mda SVF".to_owned());
        let id_b = registry.register("mda JX10".to_owned());
        assert_ne!(id_a, id_b);

        assert_eq!(&*registry.get(id_a).unwrap(), "mda SVF");
        assert_eq!(&*registry.get(id_b).unwrap(), "mda JX10");

        assert_eq!(registry.unregister(id_a), Some("mda SVF".to_owned()));
        assert!(registry.get(id_a).is_none());
        assert!(registry.get(id_b).is_some());

        // Unregistering twice is a no-op
        assert_eq!(registry.unregister(id_a), None);
    }

    #[test]
    fn instance_ids_are_monotonic_and_never_reused() {
        let registry: InstanceRegistry<u8> = InstanceRegistry::new();

        let first = registry.register(0);
        registry.unregister(first);
        let second = registry.register(0);

        assert_eq!(first, 0);
        assert_eq!(second, 1);
    }
}
