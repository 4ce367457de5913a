//! Build store.

use async_trait::async_trait;
use architect_core::{Build, BuildStore, ResourceId, Status};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::parse_status;
use crate::{DbError, DbResult};

/// A build row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BuildRecord {
    pub id: uuid::Uuid,
    pub project_id: uuid::Uuid,
    pub number: i64,
    pub status: String,
    pub repository: Option<String>,
    pub commit_sha: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<BuildRecord> for Build {
    type Error = DbError;

    fn try_from(record: BuildRecord) -> DbResult<Self> {
        Ok(Build {
            id: record.id.into(),
            project_id: record.project_id.into(),
            number: record.number,
            status: parse_status(&record.status)?,
            repository: record.repository,
            commit: record.commit_sha,
            created_at: record.created_at,
            started_at: record.started_at,
            finished_at: record.finished_at,
        })
    }
}

/// PostgreSQL implementation of [`BuildStore`].
pub struct PgBuildStore {
    pool: PgPool,
}

impl PgBuildStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a new build.
    pub async fn create(&self, build: &Build) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO builds (id, project_id, number, status, repository, commit_sha,
                                created_at, started_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(build.id.as_uuid())
        .bind(build.project_id.as_uuid())
        .bind(build.number)
        .bind(build.status.as_str())
        .bind(&build.repository)
        .bind(&build.commit)
        .bind(build.created_at)
        .bind(build.started_at)
        .bind(build.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn with_status(&self, status: Status) -> DbResult<Vec<Build>> {
        let records = sqlx::query_as::<_, BuildRecord>(
            "SELECT * FROM builds WHERE status = $1 ORDER BY created_at, id",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(Build::try_from).collect()
    }
}

#[async_trait]
impl BuildStore for PgBuildStore {
    async fn get_by_id(&self, id: ResourceId) -> architect_core::Result<Build> {
        let record = sqlx::query_as::<_, BuildRecord>("SELECT * FROM builds WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?;
        Ok(Build::try_from(record)?)
    }

    async fn get_waiting(&self) -> architect_core::Result<Vec<Build>> {
        Ok(self.with_status(Status::Waiting).await?)
    }

    async fn get_running(&self) -> architect_core::Result<Vec<Build>> {
        Ok(self.with_status(Status::Running).await?)
    }

    async fn update(&self, build: &Build) -> architect_core::Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE builds
            SET status = $2, started_at = $3, finished_at = $4
            WHERE id = $1
            "#,
        )
        .bind(build.id.as_uuid())
        .bind(build.status.as_str())
        .bind(build.started_at)
        .bind(build.finished_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("build {}", build.id)).into());
        }
        Ok(())
    }
}
