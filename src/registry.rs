//! Attachment cache: engine handle -> wrapper object
//!
//! Wrapping the same handle twice returns the same wrapper. Entries live as
//! long as the owning connection and are dropped by `clear` on teardown.

use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::Mutex;

pub struct Registry<H, W> {
    entries: Mutex<HashMap<H, W>>,
}

impl<H, W> Registry<H, W>
where
    H: Copy + Eq + Hash,
    W: Clone,
{
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, handle: &H) -> Option<W> {
        self.entries.lock().get(handle).cloned()
    }

    /// Cached wrapper for `handle`, building it with `make` on first use
    ///
    /// `make` runs under the registry lock and must not touch this registry.
    pub fn get_or_insert_with<F>(&self, handle: H, make: F) -> W
    where
        F: FnOnce() -> W,
    {
        self.entries.lock().entry(handle).or_insert_with(make).clone()
    }

    /// Fallible variant of `get_or_insert_with`
    pub fn get_or_try_insert_with<F, E>(&self, handle: H, make: F) -> Result<W, E>
    where
        F: FnOnce() -> Result<W, E>,
    {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&handle) {
            return Ok(existing.clone());
        }
        let wrapper = make()?;
        entries.insert(handle, wrapper.clone());
        Ok(wrapper)
    }

    pub fn insert(&self, handle: H, wrapper: W) -> Option<W> {
        self.entries.lock().insert(handle, wrapper)
    }

    pub fn remove(&self, handle: &H) -> Option<W> {
        self.entries.lock().remove(handle)
    }

    pub fn contains(&self, handle: &H) -> bool {
        self.entries.lock().contains_key(handle)
    }

    /// Snapshot of all wrappers, taken under the lock
    pub fn values(&self) -> Vec<W> {
        self.entries.lock().values().cloned().collect()
    }

    /// Snapshot of all handles, sorted
    pub fn handles(&self) -> Vec<H>
    where
        H: Ord,
    {
        let mut handles: Vec<H> = self.entries.lock().keys().copied().collect();
        handles.sort();
        handles
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop every entry, returning what was cached
    pub fn clear(&self) -> Vec<W> {
        self.entries.lock().drain().map(|(_, w)| w).collect()
    }
}

impl<H, W> Default for Registry<H, W>
where
    H: Copy + Eq + Hash,
    W: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<H, W> std::fmt::Debug for Registry<H, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("len", &self.entries.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_same_handle_same_wrapper() {
        let registry: Registry<u64, Arc<String>> = Registry::new();
        let first = registry.get_or_insert_with(7, || Arc::new("seven".to_string()));
        let second = registry.get_or_insert_with(7, || Arc::new("other".to_string()));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_failed_insert_leaves_no_entry() {
        let registry: Registry<u64, Arc<u64>> = Registry::new();
        let result: Result<Arc<u64>, &str> = registry.get_or_try_insert_with(1, || Err("boom"));
        assert!(result.is_err());
        assert!(!registry.contains(&1));
    }

    #[test]
    fn test_clear_returns_entries() {
        let registry: Registry<u64, u64> = Registry::new();
        registry.insert(2, 20);
        registry.insert(1, 10);
        assert_eq!(registry.handles(), vec![1, 2]);

        let mut drained = registry.clear();
        drained.sort();
        assert_eq!(drained, vec![10, 20]);
        assert!(registry.is_empty());
    }
}
