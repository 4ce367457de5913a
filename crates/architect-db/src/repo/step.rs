//! Step store.

use async_trait::async_trait;
use architect_core::{ResourceId, Step, StepStore};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::parse_status;
use crate::{DbError, DbResult};

/// A step row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StepRecord {
    pub id: uuid::Uuid,
    pub build_id: uuid::Uuid,
    pub step_index: i32,
    pub name: String,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<StepRecord> for Step {
    type Error = DbError;

    fn try_from(record: StepRecord) -> DbResult<Self> {
        Ok(Step {
            id: record.id.into(),
            build_id: record.build_id.into(),
            index: record.step_index,
            name: record.name,
            status: parse_status(&record.status)?,
            started_at: record.started_at,
            finished_at: record.finished_at,
        })
    }
}

/// PostgreSQL implementation of [`StepStore`].
pub struct PgStepStore {
    pool: PgPool,
}

impl PgStepStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, step: &Step) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO steps (id, build_id, step_index, name, status, started_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(step.id.as_uuid())
        .bind(step.build_id.as_uuid())
        .bind(step.index)
        .bind(&step.name)
        .bind(step.status.as_str())
        .bind(step.started_at)
        .bind(step.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl StepStore for PgStepStore {
    async fn get_by_id(&self, id: ResourceId) -> architect_core::Result<Step> {
        let record = sqlx::query_as::<_, StepRecord>("SELECT * FROM steps WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| DbError::NotFound(format!("step {}", id)))?;
        Ok(Step::try_from(record)?)
    }

    async fn get_for_build(&self, build_id: ResourceId) -> architect_core::Result<Vec<Step>> {
        let records = sqlx::query_as::<_, StepRecord>(
            "SELECT * FROM steps WHERE build_id = $1 ORDER BY step_index",
        )
        .bind(build_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;
        let steps: DbResult<Vec<Step>> = records.into_iter().map(Step::try_from).collect();
        Ok(steps?)
    }

    async fn update(&self, step: &Step) -> architect_core::Result<()> {
        let result = sqlx::query(
            "UPDATE steps SET status = $2, started_at = $3, finished_at = $4 WHERE id = $1",
        )
        .bind(step.id.as_uuid())
        .bind(step.status.as_str())
        .bind(step.started_at)
        .bind(step.finished_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("step {}", step.id)).into());
        }
        Ok(())
    }
}
