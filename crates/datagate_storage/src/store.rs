//! The append-only byte store trait.

use crate::error::StorageResult;

/// An append-only byte log.
///
/// Stores do not interpret what they hold. Framing, addressing and
/// integrity checks belong to the layer above ([`crate::BlobStore`]).
///
/// All methods take `&self`; implementations synchronise internally so a
/// store can sit behind an `Arc` shared by every request.
///
/// # Invariants
///
/// - `append` returns the offset the data was written at
/// - `read_at(offset, len)` returns exactly the bytes appended there
/// - `len` is the offset the next `append` will write at
pub trait ByteStore: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::ReadPastEnd`] if the range is outside
    /// the store, or an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends `data` and returns the offset it was written at.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered writes down to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&self) -> StorageResult<()>;

    /// Returns the current size of the store in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn len(&self) -> StorageResult<u64>;

    /// Cuts the store back to `new_len` bytes.
    ///
    /// Used to drop a torn frame left behind by an interrupted append.
    ///
    /// # Errors
    ///
    /// Returns an error if `new_len` is past the end or the truncation fails.
    fn truncate(&self, new_len: u64) -> StorageResult<()>;

    /// Returns `true` if nothing was ever appended.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }
}

impl<S: ByteStore + ?Sized> ByteStore for Box<S> {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        (**self).read_at(offset, len)
    }

    fn append(&self, data: &[u8]) -> StorageResult<u64> {
        (**self).append(data)
    }

    fn flush(&self) -> StorageResult<()> {
        (**self).flush()
    }

    fn len(&self) -> StorageResult<u64> {
        (**self).len()
    }

    fn truncate(&self, new_len: u64) -> StorageResult<()> {
        (**self).truncate(new_len)
    }
}
