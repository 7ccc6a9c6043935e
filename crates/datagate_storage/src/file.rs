//! File-backed byte store.

use crate::error::{StorageError, StorageResult};
use crate::store::ByteStore;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A byte store kept in a single append-only file.
///
/// `flush` pushes data to the OS and calls `sync_data`, so a blob written
/// before a successful flush survives a restart.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    inner: Mutex<FileState>,
}

#[derive(Debug)]
struct FileState {
    file: File,
    size: u64,
}

impl FileStore {
    /// Opens or creates the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(FileState { file, size }),
        })
    }

    /// Opens or creates the store, creating parent directories first.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or the file cannot be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteStore for FileStore {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let mut state = self.inner.lock();
        let size = state.size;
        let end = offset.saturating_add(len as u64);
        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        if len == 0 {
            return Ok(Vec::new());
        }

        state.file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len];
        state.file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn append(&self, data: &[u8]) -> StorageResult<u64> {
        let mut state = self.inner.lock();
        let offset = state.size;
        if data.is_empty() {
            return Ok(offset);
        }

        state.file.seek(SeekFrom::End(0))?;
        state.file.write_all(data)?;
        state.size += data.len() as u64;
        Ok(offset)
    }

    fn flush(&self) -> StorageResult<()> {
        let mut state = self.inner.lock();
        state.file.flush()?;
        state.file.sync_data()?;
        Ok(())
    }

    fn len(&self) -> StorageResult<u64> {
        Ok(self.inner.lock().size)
    }

    fn truncate(&self, new_len: u64) -> StorageResult<()> {
        let mut state = self.inner.lock();
        if new_len > state.size {
            return Err(StorageError::ReadPastEnd {
                offset: new_len,
                len: 0,
                size: state.size,
            });
        }
        state.file.set_len(new_len)?;
        state.file.sync_all()?;
        state.size = new_len;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blobs.bin");

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.len().unwrap(), 0);
        assert!(path.exists());
        assert_eq!(store.path(), path);
    }

    #[test]
    fn append_and_read() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(&dir.path().join("blobs.bin")).unwrap();

        assert_eq!(store.append(b"hello").unwrap(), 0);
        assert_eq!(store.append(b" world").unwrap(), 5);
        assert_eq!(store.read_at(0, 11).unwrap(), b"hello world");
        assert_eq!(store.append(b"").unwrap(), 11);
    }

    #[test]
    fn read_past_end_fails() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(&dir.path().join("blobs.bin")).unwrap();
        store.append(b"hello").unwrap();
        assert!(matches!(
            store.read_at(4, 5),
            Err(StorageError::ReadPastEnd { .. })
        ));
    }

    #[test]
    fn survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("blobs.bin");

        {
            let store = FileStore::open_with_create_dirs(&path).unwrap();
            store.append(b"persistent").unwrap();
            store.flush().unwrap();
        }

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.len().unwrap(), 10);
        assert_eq!(store.read_at(0, 10).unwrap(), b"persistent");
    }
}
