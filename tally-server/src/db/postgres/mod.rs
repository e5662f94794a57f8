//! PostgreSQL repositories
//!
//! Runtime-checked `sqlx::query_as` against the schema in `migrations/`.
//! Status columns are stored as their SCREAMING_SNAKE_CASE names and parsed
//! back through `FromStr`.

mod credentials;
mod mappings;
mod orders;
mod postings;
mod settlements;
mod shipments;
mod stores;
mod sync_jobs;

use shared::models::ParseEnumError;
use sqlx::PgPool;
use std::str::FromStr;

use super::{RepoError, RepoResult};

#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> RepoResult<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> RepoResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| RepoError::Database(e.to_string()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub(super) fn parse_enum<T>(value: &str) -> RepoResult<T>
where
    T: FromStr<Err = ParseEnumError>,
{
    value
        .parse()
        .map_err(|e: ParseEnumError| RepoError::Database(e.to_string()))
}
