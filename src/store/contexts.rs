//! Operation contexts.
//!
//! Each operation takes a context that supplies the key and the
//! operation-specific copy/merge callbacks. Contexts for operations that can
//! go asynchronous must be `Clone`: the engine deep-copies them onto the
//! session's pending queue and the copy's `on_complete` fires when the
//! operation resolves.

use crate::record::{Key, Value};
use crate::status::Status;

/// Context for Upsert.
pub trait UpsertContext<K: Key, V: Value>: Send {
    /// The key being upserted.
    fn key(&self) -> &K;

    /// Build the value inside a freshly allocated (zeroed) record.
    fn put(&self, dest: &mut V);

    /// Overwrite an existing value in place. The engine holds the value's
    /// generation lock for the duration. Return false if the new value does
    /// not fit the existing slot; the engine then releases the lock with the
    /// replaced mark and appends instead.
    fn put_atomic(&self, dest: &mut V) -> bool {
        self.put(dest);
        true
    }

    /// Completion notification for operations that went pending.
    fn on_complete(&mut self, status: Status) {
        let _ = status;
    }
}

/// Context for Read.
pub trait ReadContext<K: Key, V: Value>: Send {
    /// The key being read.
    fn key(&self) -> &K;

    /// Receive the value of a stable (immutable) record.
    fn get(&mut self, value: &V);

    /// Receive the value of a record that may be concurrently mutated. The
    /// engine wraps this in the generation protocol and may invoke it
    /// multiple times until a torn-free copy is observed; implementations
    /// must tolerate repeated calls.
    fn get_atomic(&mut self, value: &V) {
        self.get(value);
    }

    /// Completion notification for operations that went pending.
    fn on_complete(&mut self, status: Status) {
        let _ = status;
    }
}

/// Context for Read-Modify-Write.
pub trait RmwContext<K: Key, V: Value>: Send {
    /// The key being modified.
    fn key(&self) -> &K;

    /// Build the initial value when the key does not exist.
    fn rmw_initial(&self, dest: &mut V);

    /// Build the updated value in `dest` from the previous value.
    fn rmw_copy(&self, old: &V, dest: &mut V);

    /// Modify the value in place. The engine holds the generation lock.
    /// Return false to force the copy path (e.g. the update grows the
    /// value).
    fn rmw_atomic(&self, value: &mut V) -> bool;

    /// Completion notification for operations that went pending.
    fn on_complete(&mut self, status: Status) {
        let _ = status;
    }
}

/// Context for Delete.
pub trait DeleteContext<K: Key>: Send {
    /// The key being deleted.
    fn key(&self) -> &K;
}

/// Upsert context holding an owned key and value.
#[derive(Debug, Clone)]
pub struct SimpleUpsertContext<K, V> {
    key: K,
    value: V,
}

impl<K: Key, V: Value + Clone> SimpleUpsertContext<K, V> {
    /// Upsert `key` to `value`.
    pub fn new(key: K, value: V) -> Self {
        Self { key, value }
    }
}

impl<K: Key, V: Value + Clone> UpsertContext<K, V> for SimpleUpsertContext<K, V> {
    fn key(&self) -> &K {
        &self.key
    }

    fn put(&self, dest: &mut V) {
        dest.clone_from(&self.value);
    }
}

/// Read context that parks the result in a shared cell, so a deep copy on
/// the pending queue still delivers to the original caller.
pub struct SimpleReadContext<K, V> {
    key: K,
    result: std::sync::Arc<parking_lot::Mutex<Option<V>>>,
}

impl<K, V> Clone for SimpleReadContext<K, V>
where
    K: Clone,
{
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            result: self.result.clone(),
        }
    }
}

impl<K: Key, V: Value + Clone> SimpleReadContext<K, V> {
    /// Read `key`.
    pub fn new(key: K) -> Self {
        Self {
            key,
            result: std::sync::Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    /// The value read, if the operation has completed and found one.
    pub fn value(&self) -> Option<V> {
        self.result.lock().clone()
    }
}

impl<K: Key, V: Value + Clone> ReadContext<K, V> for SimpleReadContext<K, V> {
    fn key(&self) -> &K {
        &self.key
    }

    fn get(&mut self, value: &V) {
        *self.result.lock() = Some(value.clone());
    }
}

/// Delete context holding an owned key.
#[derive(Debug, Clone)]
pub struct SimpleDeleteContext<K> {
    key: K,
}

impl<K: Key> SimpleDeleteContext<K> {
    /// Delete `key`.
    pub fn new(key: K) -> Self {
        Self { key }
    }
}

impl<K: Key> DeleteContext<K> for SimpleDeleteContext<K> {
    fn key(&self) -> &K {
        &self.key
    }
}

/// RMW context adding a delta to a [`crate::record::GenLocked`] `u64`
/// counter.
#[derive(Debug, Clone)]
pub struct IncrementContext<K> {
    key: K,
    delta: u64,
}

impl<K: Key> IncrementContext<K> {
    /// Add `delta` to the counter at `key`, initializing to `delta` when
    /// absent.
    pub fn new(key: K, delta: u64) -> Self {
        Self { key, delta }
    }
}

impl<K: Key> RmwContext<K, crate::record::GenLocked<u64>> for IncrementContext<K> {
    fn key(&self) -> &K {
        &self.key
    }

    fn rmw_initial(&self, dest: &mut crate::record::GenLocked<u64>) {
        *dest.get_mut() = self.delta;
    }

    fn rmw_copy(
        &self,
        old: &crate::record::GenLocked<u64>,
        dest: &mut crate::record::GenLocked<u64>,
    ) {
        *dest.get_mut() = old.get().wrapping_add(self.delta);
    }

    fn rmw_atomic(&self, value: &mut crate::record::GenLocked<u64>) -> bool {
        let current = *value.get();
        *value.get_mut() = current.wrapping_add(self.delta);
        true
    }
}

/// RMW context adding a delta to a plain `u64` value. Plain values carry no
/// generation lock, so every update takes the copy path.
#[derive(Debug, Clone)]
pub struct AddContext<K> {
    key: K,
    delta: u64,
}

impl<K: Key> AddContext<K> {
    /// Add `delta` to the value at `key`, initializing to `delta` when
    /// absent.
    pub fn new(key: K, delta: u64) -> Self {
        Self { key, delta }
    }
}

impl<K: Key> RmwContext<K, u64> for AddContext<K> {
    fn key(&self) -> &K {
        &self.key
    }

    fn rmw_initial(&self, dest: &mut u64) {
        *dest = self.delta;
    }

    fn rmw_copy(&self, old: &u64, dest: &mut u64) {
        *dest = old.wrapping_add(self.delta);
    }

    fn rmw_atomic(&self, _value: &mut u64) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::GenLocked;

    #[test]
    fn simple_read_shares_result_with_clones() {
        let mut ctx = SimpleReadContext::<u64, u64>::new(7);
        let copy = ctx.clone();
        ctx.get(&99);
        assert_eq!(copy.value(), Some(99));
    }

    #[test]
    fn increment_context_paths_agree() {
        let ctx = IncrementContext::new(1u64, 5);

        let mut fresh = GenLocked::new(0u64);
        ctx.rmw_initial(&mut fresh);
        assert_eq!(*fresh.get(), 5);

        let mut copied = GenLocked::new(0u64);
        ctx.rmw_copy(&GenLocked::new(10), &mut copied);
        assert_eq!(*copied.get(), 15);

        let mut in_place = GenLocked::new(10u64);
        assert!(ctx.rmw_atomic(&mut in_place));
        assert_eq!(*in_place.get(), 15);
    }

    #[test]
    fn upsert_context_writes_dest() {
        let ctx = SimpleUpsertContext::new(1u64, 42u64);
        let mut dest = 0u64;
        ctx.put(&mut dest);
        assert_eq!(dest, 42);
        assert!(ctx.put_atomic(&mut dest));
    }
}
