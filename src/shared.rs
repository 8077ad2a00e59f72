//! Single-writer / many-reader access to the job index.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::index::JobIndex;

/// Split an index into its one writer and a cloneable reader.
pub fn shared(index: JobIndex) -> (IndexWriter, IndexReader) {
    let inner = Arc::new(RwLock::new(index));
    (
        IndexWriter {
            inner: inner.clone(),
        },
        IndexReader { inner },
    )
}

/// Exclusive mutation handle. Deliberately not `Clone`.
#[derive(Debug)]
pub struct IndexWriter {
    inner: Arc<RwLock<JobIndex>>,
}

impl IndexWriter {
    /// Run `f` with the index locked for writing.
    pub fn write<T>(&self, f: impl FnOnce(&mut JobIndex) -> T) -> T {
        let mut guard: RwLockWriteGuard<'_, JobIndex> =
            self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn reader(&self) -> IndexReader {
        IndexReader {
            inner: self.inner.clone(),
        }
    }
}

/// Shared read handle; each call sees one consistent state.
#[derive(Debug, Clone)]
pub struct IndexReader {
    inner: Arc<RwLock<JobIndex>>,
}

impl IndexReader {
    /// Run `f` under a read guard. Return owned data from `f`.
    pub fn read<T>(&self, f: impl FnOnce(&JobIndex) -> T) -> T {
        let guard: RwLockReadGuard<'_, JobIndex> =
            self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }
}
