//! Store implementations.

pub mod build;
pub mod known_host;
pub mod step;
pub mod stream;

pub use build::{BuildRecord, PgBuildStore};
pub use known_host::PgKnownHostStore;
pub use step::{PgStepStore, StepRecord};
pub use stream::{PgStreamStore, StreamRecord};

use architect_core::Status;

use crate::{DbError, DbResult};

fn parse_status(raw: &str) -> DbResult<Status> {
    raw.parse()
        .map_err(|_| DbError::Corrupt(format!("unknown status '{raw}'")))
}

/// Pool for the `#[ignore]`d tests, which need `DATABASE_URL` to point at a
/// scratch PostgreSQL database.
#[cfg(test)]
pub(crate) async fn test_pool() -> sqlx::PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = crate::create_pool(&url).await.unwrap();
    crate::run_migrations(&pool).await.unwrap();
    pool
}
