//! Durable file and segment metadata backed by SQLite.

use crate::{
    models::{file::File, segment::Segment},
    services::storage_service::StorageResult,
};
use async_trait::async_trait;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Schema applied by `--migrate` and by tests.
pub const SCHEMA_SQL: &str = include_str!("../../migrations/0001_init.sql");

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn create_file(&self, file: &File) -> StorageResult<()>;

    async fn create_segment(&self, segment: &Segment) -> StorageResult<()>;

    /// Look up a file record. `None` when the id is unknown.
    async fn get_file(&self, file_id: Uuid) -> StorageResult<Option<File>>;

    /// All segments of `file_id`, ordered by `order_index` ascending.
    async fn get_segments(&self, file_id: Uuid) -> StorageResult<Vec<Segment>>;

    /// Persist a file together with all of its segments.
    ///
    /// The default inserts the file first and then each segment, so a failure
    /// part-way leaves a partial record set. Stores that support transactions
    /// should override this.
    async fn commit_file(&self, file: &File, segments: &[Segment]) -> StorageResult<()> {
        self.create_file(file).await?;
        for segment in segments {
            self.create_segment(segment).await?;
        }
        Ok(())
    }

    /// Readiness check.
    async fn ping(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// SQLite implementation using a shared sqlx pool.
#[derive(Clone)]
pub struct SqliteMetadataStore {
    pub db: Arc<SqlitePool>,
}

impl SqliteMetadataStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply `SCHEMA_SQL` statement by statement.
    pub async fn migrate(&self) -> StorageResult<usize> {
        let statements = SCHEMA_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        for stmt in &statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(statements.len())
    }

    async fn insert_file<'c, E>(executor: E, file: &File) -> StorageResult<()>
    where
        E: sqlx::Executor<'c, Database = Sqlite>,
    {
        sqlx::query(
            "INSERT INTO files (id, name, size, segment_count, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(file.id)
        .bind(&file.name)
        .bind(file.size)
        .bind(file.segment_count)
        .bind(file.created_at)
        .execute(executor)
        .await?;
        Ok(())
    }

    async fn insert_segment<'c, E>(executor: E, segment: &Segment) -> StorageResult<()>
    where
        E: sqlx::Executor<'c, Database = Sqlite>,
    {
        sqlx::query(
            "INSERT INTO segments (id, file_id, order_index, hash, blob_key, size)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(segment.id)
        .bind(segment.file_id)
        .bind(segment.order_index)
        .bind(&segment.hash)
        .bind(&segment.blob_key)
        .bind(segment.size)
        .execute(executor)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn create_file(&self, file: &File) -> StorageResult<()> {
        Self::insert_file(&*self.db, file).await
    }

    async fn create_segment(&self, segment: &Segment) -> StorageResult<()> {
        Self::insert_segment(&*self.db, segment).await
    }

    async fn get_file(&self, file_id: Uuid) -> StorageResult<Option<File>> {
        let file = sqlx::query_as::<_, File>(
            "SELECT id, name, size, segment_count, created_at FROM files WHERE id = ?",
        )
        .bind(file_id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(file)
    }

    async fn get_segments(&self, file_id: Uuid) -> StorageResult<Vec<Segment>> {
        let segments = sqlx::query_as::<_, Segment>(
            "SELECT id, file_id, order_index, hash, blob_key, size
             FROM segments
             WHERE file_id = ?
             ORDER BY order_index ASC",
        )
        .bind(file_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(segments)
    }

    /// File and segment rows go in one transaction; readers never see a file
    /// without its full segment set.
    async fn commit_file(&self, file: &File, segments: &[Segment]) -> StorageResult<()> {
        let mut tx: Transaction<'_, Sqlite> = self.db.begin().await?;
        Self::insert_file(&mut *tx, file).await?;
        for segment in segments {
            Self::insert_segment(&mut *tx, segment).await?;
        }
        tx.commit().await?;
        debug!(
            "committed file {} with {} segments",
            file.id,
            segments.len()
        );
        Ok(())
    }

    async fn ping(&self) -> StorageResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) async fn memory_store() -> SqliteMetadataStore {
    use sqlx::sqlite::SqlitePoolOptions;

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = SqliteMetadataStore::new(Arc::new(pool));
    store.migrate().await.unwrap();
    store
}
