pub mod file;
pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use cdh_core::Cursor;

/// Durable home of the ingestion cursor.
///
/// Only the feed client writes through this trait. Implementations hold a
/// single record: every `save` replaces the previous one.
#[async_trait]
pub trait CursorStore: Send + Sync + 'static {
    /// Error type specific to this storage implementation
    type Error: std::error::Error + Send + Sync + 'static;

    /// Load the stored cursor, or `None` on a cold start.
    async fn load(&self) -> Result<Option<Cursor>, Self::Error>;

    /// Replace the stored cursor.
    async fn save(&self, cursor: &Cursor) -> Result<(), Self::Error>;

    /// Forget all progress. Operator action; the next run starts cold.
    async fn reset(&self) -> Result<(), Self::Error>;
}
