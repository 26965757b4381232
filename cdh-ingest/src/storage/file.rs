use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use cdh_core::Cursor;
use tokio::fs;

use crate::storage::CursorStore;

/// Stores the cursor as a pretty-printed JSON document.
///
/// Writes go to a sibling temp file first and are renamed into place, so a
/// crash mid-write leaves the previous cursor intact.
#[derive(Debug, Clone)]
pub struct FileCursorStore {
    path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum FileStoreError {
    #[error("cursor file {path} io error: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cursor file {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl FileCursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_error(&self, source: std::io::Error) -> FileStoreError {
        FileStoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl CursorStore for FileCursorStore {
    type Error = FileStoreError;

    async fn load(&self) -> Result<Option<Cursor>, Self::Error> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };

        let cursor = serde_json::from_str(&content).map_err(|source| FileStoreError::Json {
            path: self.path.clone(),
            source,
        })?;

        Ok(Some(cursor))
    }

    async fn save(&self, cursor: &Cursor) -> Result<(), Self::Error> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }

        let json = serde_json::to_vec_pretty(cursor).map_err(|source| FileStoreError::Json {
            path: self.path.clone(),
            source,
        })?;

        let temp = self.temp_path();
        fs::write(&temp, json).await.map_err(|e| self.io_error(e))?;
        fs::rename(&temp, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;

        Ok(())
    }

    async fn reset(&self) -> Result<(), Self::Error> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }
}
