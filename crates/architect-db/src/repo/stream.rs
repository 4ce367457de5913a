//! Stream store and stream output.

use async_trait::async_trait;
use architect_core::{ResourceId, Stream, StreamStore};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{DbError, DbResult};

/// A stream row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StreamRecord {
    pub id: uuid::Uuid,
    pub step_id: uuid::Uuid,
    pub stream_index: i32,
    pub name: String,
}

impl From<StreamRecord> for Stream {
    fn from(record: StreamRecord) -> Self {
        Stream {
            id: record.id.into(),
            step_id: record.step_id.into(),
            index: record.stream_index,
            name: record.name,
        }
    }
}

/// PostgreSQL implementation of [`StreamStore`].
pub struct PgStreamStore {
    pool: PgPool,
}

impl PgStreamStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, stream: &Stream) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO streams (id, step_id, stream_index, name) VALUES ($1, $2, $3, $4)",
        )
        .bind(stream.id.as_uuid())
        .bind(stream.step_id.as_uuid())
        .bind(stream.index)
        .bind(&stream.name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Number of lines stored for a stream.
    pub async fn line_count(&self, stream_id: ResourceId) -> DbResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM stream_lines WHERE stream_id = $1")
                .bind(stream_id.as_uuid())
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

#[async_trait]
impl StreamStore for PgStreamStore {
    async fn get_by_id(&self, id: ResourceId) -> architect_core::Result<Stream> {
        let record = sqlx::query_as::<_, StreamRecord>("SELECT * FROM streams WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| DbError::NotFound(format!("stream {}", id)))?;
        Ok(record.into())
    }

    async fn get_for_step(&self, step_id: ResourceId) -> architect_core::Result<Vec<Stream>> {
        let records = sqlx::query_as::<_, StreamRecord>(
            "SELECT * FROM streams WHERE step_id = $1 ORDER BY stream_index",
        )
        .bind(step_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(records.into_iter().map(Stream::from).collect())
    }

    async fn append_line(
        &self,
        stream: &Stream,
        number: i64,
        timestamp: DateTime<Utc>,
        output: &str,
    ) -> architect_core::Result<()> {
        // A builder re-sending an unacknowledged report must not duplicate the line.
        sqlx::query(
            r#"
            INSERT INTO stream_lines (stream_id, line_number, logged_at, output)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (stream_id, line_number) DO NOTHING
            "#,
        )
        .bind(stream.id.as_uuid())
        .bind(number)
        .bind(timestamp)
        .bind(output)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(())
    }
}
