//! In-memory byte store.

use crate::error::{StorageError, StorageResult};
use crate::store::ByteStore;
use parking_lot::RwLock;

/// A byte store held entirely in memory.
///
/// Used by the in-memory backend and by tests. Contents are lost on drop.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    data: RwLock<Vec<u8>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-loaded with `data`.
    ///
    /// Useful for exercising index rebuilds in tests.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    /// Returns a copy of everything in the store.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl ByteStore for InMemoryStore {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let end = start.saturating_add(len);

        if offset > size || end > data.len() {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        Ok(data[start..end].to_vec())
    }

    fn append(&self, bytes: &[u8]) -> StorageResult<u64> {
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(bytes);
        Ok(offset)
    }

    fn flush(&self) -> StorageResult<()> {
        Ok(())
    }

    fn len(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn truncate(&self, new_len: u64) -> StorageResult<()> {
        let mut data = self.data.write();
        let size = data.len() as u64;
        if new_len > size {
            return Err(StorageError::ReadPastEnd {
                offset: new_len,
                len: 0,
                size,
            });
        }
        data.truncate(usize::try_from(new_len).unwrap_or(usize::MAX));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_store_is_empty() {
        let store = InMemoryStore::new();
        assert_eq!(store.len().unwrap(), 0);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn append_returns_offsets() {
        let store = InMemoryStore::new();
        assert_eq!(store.append(b"hello").unwrap(), 0);
        assert_eq!(store.append(b" world").unwrap(), 5);
        assert_eq!(store.len().unwrap(), 11);
    }

    #[test]
    fn read_back_slices() {
        let store = InMemoryStore::new();
        store.append(b"hello world").unwrap();
        assert_eq!(store.read_at(6, 5).unwrap(), b"world");
        assert!(store.read_at(2, 0).unwrap().is_empty());
    }

    #[test]
    fn read_past_end_fails() {
        let store = InMemoryStore::new();
        store.append(b"hello").unwrap();
        assert!(matches!(
            store.read_at(3, 10),
            Err(StorageError::ReadPastEnd { .. })
        ));
        assert!(matches!(
            store.read_at(10, 1),
            Err(StorageError::ReadPastEnd { .. })
        ));
    }

    #[test]
    fn truncate_drops_tail() {
        let store = InMemoryStore::new();
        store.append(b"hello world").unwrap();
        store.truncate(5).unwrap();
        assert_eq!(store.snapshot(), b"hello");
        assert!(store.truncate(6).is_err());
    }

    #[test]
    fn preloaded_data() {
        let store = InMemoryStore::with_data(b"preloaded".to_vec());
        assert_eq!(store.len().unwrap(), 9);
        assert_eq!(store.snapshot(), b"preloaded");
    }
}
