//! PostgreSQL stores for the Architect build coordinator.

pub mod error;
pub mod repo;

use std::sync::Arc;

use architect_core::Stores;
pub use error::{DbError, DbResult};
pub use repo::*;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Every store backed by the same pool.
pub fn pg_stores(pool: PgPool) -> Stores {
    Stores {
        builds: Arc::new(PgBuildStore::new(pool.clone())),
        steps: Arc::new(PgStepStore::new(pool.clone())),
        streams: Arc::new(PgStreamStore::new(pool.clone())),
        known_hosts: Arc::new(PgKnownHostStore::new(pool)),
    }
}
