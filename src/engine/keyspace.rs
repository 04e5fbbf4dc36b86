//! Keyspace
//!
//! BTreeMap-based key/value map with RwLock for concurrency.

use std::collections::BTreeMap;

use parking_lot::RwLock;

/// In-memory keyspace shared by every session
#[derive(Debug, Default)]
pub struct Keyspace {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl Keyspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a value by key (read lock)
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.read().get(key).cloned()
    }

    /// Put a key-value pair (write lock)
    pub fn set(&self, key: Vec<u8>, value: Vec<u8>) {
        self.data.write().insert(key, value);
    }

    /// Remove keys, returning how many existed
    pub fn delete<'a>(&self, keys: impl IntoIterator<Item = &'a [u8]>) -> usize {
        let mut data = self.data.write();
        keys.into_iter()
            .filter(|key| data.remove(*key).is_some())
            .count()
    }

    /// Count how many of `keys` exist (duplicates counted twice)
    pub fn exists<'a>(&self, keys: impl IntoIterator<Item = &'a [u8]>) -> usize {
        let data = self.data.read();
        keys.into_iter().filter(|key| data.contains_key(*key)).count()
    }

    /// Increment an integer value, treating a missing key as 0
    pub fn incr(&self, key: &[u8], by: i64) -> Option<i64> {
        let mut data = self.data.write();
        let current = match data.get(key) {
            Some(raw) => std::str::from_utf8(raw).ok()?.parse::<i64>().ok()?,
            None => 0,
        };
        let next = current.checked_add(by)?;
        data.insert(key.to_vec(), next.to_string().into_bytes());
        Some(next)
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}
