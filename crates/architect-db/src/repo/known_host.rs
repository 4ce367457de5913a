//! Known-host store.

use async_trait::async_trait;
use architect_core::{KnownHost, KnownHostStore};
use sqlx::PgPool;

use crate::{DbError, DbResult};

/// PostgreSQL implementation of [`KnownHostStore`].
pub struct PgKnownHostStore {
    pool: PgPool,
}

impl PgKnownHostStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Add a host-key entry; adding an existing entry is a no-op.
    pub async fn add(&self, entry: &str) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO known_hosts (id, entry, created_at) VALUES ($1, $2, NOW()) ON CONFLICT (entry) DO NOTHING",
        )
        .bind(uuid::Uuid::now_v7())
        .bind(entry)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl KnownHostStore for PgKnownHostStore {
    async fn get_all(&self) -> architect_core::Result<Vec<KnownHost>> {
        let entries: Vec<String> =
            sqlx::query_scalar("SELECT entry FROM known_hosts ORDER BY created_at")
                .fetch_all(&self.pool)
                .await
                .map_err(DbError::from)?;
        Ok(entries.into_iter().map(|entry| KnownHost { entry }).collect())
    }
}
