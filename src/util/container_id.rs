//! Container identity and thread-safe link id minting
//!
//! `ContainerId` is immutable once created. `next_id` may be called from any
//! thread; uniqueness is guaranteed by the mutex inside `Counter`.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// Mutex-guarded counter, incremented only through `next`
#[derive(Debug, Default)]
pub struct Counter {
    count: Mutex<u64>,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment and return the new value
    pub fn next(&self) -> u64 {
        let mut count = self.count.lock();
        *count += 1;
        *count
    }

    /// Last value handed out (0 if none yet)
    pub fn current(&self) -> u64 {
        *self.count.lock()
    }
}

/// Globally unique container identifier
#[derive(Debug)]
pub struct ContainerId {
    id: Arc<str>,
    counter: Counter,
}

impl ContainerId {
    /// Use `seed` as the id, or a random v4 UUID when absent
    pub fn new(seed: Option<&str>) -> Self {
        let id: Arc<str> = match seed {
            Some(seed) => Arc::from(seed),
            None => Arc::from(uuid::Uuid::new_v4().to_string()),
        };
        Self {
            id,
            counter: Counter::new(),
        }
    }

    /// Random container id
    pub fn generate() -> Self {
        Self::new(None)
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }

    /// Unique id of the form `<hex counter>@<container id>`
    pub fn next_id(&self) -> String {
        format!("{:x}@{}", self.counter.next(), self.id)
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.id
    }
}

impl PartialEq<str> for ContainerId {
    fn eq(&self, other: &str) -> bool {
        &*self.id == other
    }
}

impl PartialEq<&str> for ContainerId {
    fn eq(&self, other: &&str) -> bool {
        &*self.id == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_seeded_id() {
        let id = ContainerId::new(Some("broker-1"));
        assert_eq!(id, "broker-1");
        assert_eq!(id.next_id(), "1@broker-1");
        assert_eq!(id.next_id(), "2@broker-1");
    }

    #[test]
    fn test_hex_counter() {
        let id = ContainerId::new(Some("c"));
        let last = (0..255).map(|_| id.next_id()).last().unwrap();
        assert_eq!(last, "ff@c");
    }

    #[test]
    fn test_generated_ids_differ() {
        let a = ContainerId::generate();
        let b = ContainerId::generate();
        assert_ne!(a.as_str(), b.as_str());
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn test_next_id_concurrent_unique() {
        let id = Arc::new(ContainerId::new(Some("shared")));
        let mut handles = vec![];

        for _ in 0..8 {
            let id = Arc::clone(&id);
            handles.push(thread::spawn(move || {
                (0..500).map(|_| id.next_id()).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for value in handle.join().unwrap() {
                assert!(seen.insert(value), "duplicate id minted");
            }
        }
        assert_eq!(seen.len(), 4000);
        assert_eq!(id.counter.current(), 4000);
    }
}
