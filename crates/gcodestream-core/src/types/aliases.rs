//! Type aliases for commonly used shared-state types.
//!
//! The engine loop owns its state outright; these aliases cover the few
//! places where state genuinely crosses threads (in-memory transports,
//! listener registries, state snapshots read by the control handle).

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// A thread-safe vector, mutex-protected (`parking_lot::Mutex`).
pub type ThreadSafeVec<T> = Arc<Mutex<Vec<T>>>;

/// A thread-safe reader-writer lock wrapper for read-heavy workloads.
pub type ThreadSafeRw<T> = Arc<RwLock<T>>;

/// A thread-safe reader-writer hash map.
pub type ThreadSafeRwMap<K, V> = Arc<RwLock<HashMap<K, V>>>;

/// Create a `ThreadSafeVec<T>` holding `items`.
pub fn thread_safe_vec<T>(items: Vec<T>) -> ThreadSafeVec<T> {
    Arc::new(Mutex::new(items))
}

/// Create a new `ThreadSafeRw<T>` from a value.
pub fn thread_safe_rw<T>(value: T) -> ThreadSafeRw<T> {
    Arc::new(RwLock::new(value))
}

/// Create a new empty `ThreadSafeRwMap<K, V>`.
pub fn thread_safe_rw_map<K, V>() -> ThreadSafeRwMap<K, V> {
    Arc::new(RwLock::new(HashMap::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_safe_helpers() {
        let items: ThreadSafeVec<u32> = thread_safe_vec(vec![1]);
        items.lock().push(2);
        assert_eq!(items.lock().drain(..).sum::<u32>(), 3);

        let rw = thread_safe_rw(5);
        *rw.write() += 1;
        assert_eq!(*rw.read(), 6);

        let map: ThreadSafeRwMap<String, u8> = thread_safe_rw_map();
        map.write().insert("a".into(), 1);
        assert_eq!(map.read().get("a"), Some(&1));
    }
}
