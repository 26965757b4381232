use std::path::Path;

use async_trait::async_trait;
use cdh_core::{Cursor, EventId};
use sqlx::{
    Row, SqlitePool,
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};

use crate::storage::CursorStore;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, thiserror::Error)]
pub enum SqliteStoreError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("negative counter {0}")]
    NegativeCounter(i64),
    #[error("counter {0} does not fit in a SQLite integer")]
    CounterOverflow(u64),
}

/// SQLite-backed cursor store. Keeps the cursor as a single row.
#[derive(Clone)]
pub struct SqliteCursorStore {
    pool: SqlitePool,
}

impl SqliteCursorStore {
    /// Opens or creates a SQLite database at the given path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, SqliteStoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn new_in_memory() -> Result<Self, SqliteStoreError> {
        // A single connection, otherwise every pooled connection would see
        // its own empty in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }
}

fn to_u64(value: i64) -> Result<u64, SqliteStoreError> {
    u64::try_from(value).map_err(|_| SqliteStoreError::NegativeCounter(value))
}

fn to_i64(value: u64) -> Result<i64, SqliteStoreError> {
    i64::try_from(value).map_err(|_| SqliteStoreError::CounterOverflow(value))
}

#[async_trait]
impl CursorStore for SqliteCursorStore {
    type Error = SqliteStoreError;

    async fn load(&self) -> Result<Option<Cursor>, Self::Error> {
        let row = sqlx::query(
            r#"
            SELECT last_event_id, event_sequence, last_saved, total_events_received
            FROM cursor WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| -> Result<Cursor, SqliteStoreError> {
            let last_saved = r.try_get::<String, _>("last_saved")?;
            let last_saved = last_saved
                .parse::<jiff::Timestamp>()
                .map_err(|_| SqliteStoreError::InvalidTimestamp(last_saved))?;

            Ok(Cursor {
                last_event_id: r
                    .try_get::<Option<String>, _>("last_event_id")?
                    .map(|id| EventId(id.into())),
                event_sequence: to_u64(r.try_get::<i64, _>("event_sequence")?)?,
                last_saved,
                total_events_received: to_u64(r.try_get::<i64, _>("total_events_received")?)?,
            })
        })
        .transpose()
    }

    async fn save(&self, cursor: &Cursor) -> Result<(), Self::Error> {
        let event_sequence = to_i64(cursor.event_sequence)?;
        let total_events_received = to_i64(cursor.total_events_received)?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO cursor
                (id, last_event_id, event_sequence, last_saved, total_events_received)
            VALUES (1, ?, ?, ?, ?)
            "#,
        )
        .bind(cursor.last_event_id.as_ref().map(|id| id.as_str().to_owned()))
        .bind(event_sequence)
        .bind(cursor.last_saved.to_string())
        .bind(total_events_received)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reset(&self) -> Result<(), Self::Error> {
        sqlx::query("DELETE FROM cursor")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
