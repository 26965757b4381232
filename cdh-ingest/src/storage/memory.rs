use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use cdh_core::Cursor;

use crate::storage::CursorStore;

/// In-memory cursor store.
/// This is primarily intended for testing and as a reference
/// implementation of the CursorStore trait.
#[derive(Clone, Default)]
pub struct MemoryCursorStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    cursor: Option<Cursor>,
    saves: usize,
}

/// Error type for MemoryCursorStore
#[derive(Debug)]
pub enum MemoryStoreError {
    MutexPoisoned(String),
}

impl std::error::Error for MemoryStoreError {}

impl fmt::Display for MemoryStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryStoreError::MutexPoisoned(msg) => write!(f, "Mutex poisoned: {}", msg),
        }
    }
}

impl<T> From<PoisonError<T>> for MemoryStoreError {
    fn from(err: PoisonError<T>) -> Self {
        MemoryStoreError::MutexPoisoned(err.to_string())
    }
}

impl MemoryCursorStore {
    /// A store that already holds `cursor`, as if left behind by a prior run.
    pub fn with_cursor(cursor: Cursor) -> Self {
        let store = Self::default();
        if let Ok(mut inner) = store.inner.lock() {
            inner.cursor = Some(cursor);
        }
        store
    }

    /// The currently stored cursor.
    pub fn current(&self) -> Option<Cursor> {
        self.inner.lock().ok().and_then(|inner| inner.cursor.clone())
    }

    /// Number of successful `save` calls.
    pub fn saves(&self) -> usize {
        self.inner.lock().map(|inner| inner.saves).unwrap_or_default()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    type Error = MemoryStoreError;

    async fn load(&self) -> Result<Option<Cursor>, Self::Error> {
        let inner = self.inner.lock()?;
        Ok(inner.cursor.clone())
    }

    async fn save(&self, cursor: &Cursor) -> Result<(), Self::Error> {
        let mut inner = self.inner.lock()?;
        inner.cursor = Some(cursor.clone());
        inner.saves += 1;
        Ok(())
    }

    async fn reset(&self) -> Result<(), Self::Error> {
        let mut inner = self.inner.lock()?;
        inner.cursor = None;
        Ok(())
    }
}
