//! Key-value storage backends for enrollment persistence
//!
//! The enrollment engine only depends on this transactional contract, never
//! on a concrete storage engine:
//! - atomic single-key read/write
//! - all-or-nothing multi-key [`commit`](KvStore::commit) for the apply step
//!
//! Two backends ship with the crate: [`MemoryKvStore`] (transient, for tests
//! and ephemeral profiles) and [`FileKvStore`] (durable, crash-consistent
//! snapshot file).
//!
//! # Example
//!
//! ```rust
//! use cohorte::kv::{KvStore, MemoryKvStore, WriteOp};
//!
//! # fn example() -> cohorte::Result<()> {
//! let store = MemoryKvStore::new();
//! store.put("key", b"value".to_vec())?;
//! assert_eq!(store.get("key")?, Some(b"value".to_vec()));
//!
//! store.commit(vec![
//!     WriteOp::put("a", b"1".to_vec()),
//!     WriteOp::delete("key"),
//! ])?;
//! assert!(store.get("key")?.is_none());
//! # Ok(())
//! # }
//! ```

mod file;
mod memory;

pub use file::FileKvStore;
pub use memory::MemoryKvStore;

use crate::Result;

/// A single mutation inside an atomic batch commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Insert or overwrite a key.
    Put {
        /// Target key.
        key: String,
        /// Value bytes.
        value: Vec<u8>,
    },
    /// Remove a key; a no-op if absent.
    Delete {
        /// Target key.
        key: String,
    },
}

impl WriteOp {
    /// Convenience constructor for a put.
    #[must_use]
    pub fn put(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self::Put {
            key: key.into(),
            value,
        }
    }

    /// Convenience constructor for a delete.
    #[must_use]
    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }
}

/// Synchronous key-value store with atomic batch commit.
///
/// Callers serialize mutations externally (the client façade holds one mutex
/// around all state-mutating operations); implementations are responsible for
/// durability, not for cross-thread write ordering.
pub trait KvStore: Send + Sync {
    /// Get a value by key. Returns `None` if the key doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the backend cannot be read.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Set a value for a key, overwriting any existing value.
    ///
    /// # Errors
    /// Returns an error if the write cannot be made durable.
    fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Delete a key. No-op if the key doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the delete cannot be made durable.
    fn delete(&self, key: &str) -> Result<()>;

    /// All keys starting with `prefix`, in unspecified order.
    ///
    /// # Errors
    /// Returns an error if the backend cannot be read.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Apply every operation or none of them.
    ///
    /// After a crash mid-commit a durable backend must come back with either
    /// the full previous snapshot or the full new one, never a mix.
    ///
    /// # Errors
    /// Returns an error if the batch cannot be made durable; the previous
    /// snapshot stays in effect.
    fn commit(&self, ops: Vec<WriteOp>) -> Result<()>;
}
