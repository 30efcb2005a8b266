//! Shared, swappable configuration cell
//!
//! [`ConfigCell`] holds a value behind `RwLock<Arc<T>>`: readers grab a
//! cheap `Arc` clone and never block writers for longer than the clone,
//! while [`store`](ConfigCell::store) swaps the whole value atomically.
//! Long-lived components (an executor mid-run, a stream in flight) keep
//! working against the snapshot they loaded; new work picks up the
//! replacement.

use parking_lot::RwLock;
use std::sync::Arc;

/// A read-mostly slot holding an `Arc`-shared value
pub struct ConfigCell<T> {
    inner: RwLock<Arc<T>>,
}

impl<T> ConfigCell<T> {
    /// Wrap an initial value
    pub fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(Arc::new(value)),
        }
    }

    /// Snapshot the current value
    pub fn load(&self) -> Arc<T> {
        self.inner.read().clone()
    }

    /// Replace the value; existing snapshots are unaffected
    pub fn store(&self, value: T) {
        *self.inner.write() = Arc::new(value);
    }
}

impl<T: Default> Default for ConfigCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for ConfigCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ConfigCell").field(&*self.load()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_returns_stored_value() {
        let cell = ConfigCell::new(41);
        assert_eq!(*cell.load(), 41);
        cell.store(42);
        assert_eq!(*cell.load(), 42);
    }

    #[test]
    fn test_snapshots_survive_replacement() {
        let cell = ConfigCell::new(String::from("before"));
        let snapshot = cell.load();
        cell.store(String::from("after"));
        assert_eq!(*snapshot, "before");
        assert_eq!(*cell.load(), "after");
    }

    #[test]
    fn test_shared_across_threads() {
        let cell = Arc::new(ConfigCell::new(0u64));
        let writer = {
            let cell = Arc::clone(&cell);
            std::thread::spawn(move || {
                for i in 1..=100 {
                    cell.store(i);
                }
            })
        };
        writer.join().unwrap();
        assert_eq!(*cell.load(), 100);
    }
}
