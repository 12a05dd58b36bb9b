//! PostgreSQL-backed state store

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use peggy_core::store::{StateStore, StoreError};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::error;

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

fn backend(op: &str, e: sqlx::Error) -> StoreError {
    error!("SQL error during {}: {:?}", op, e);
    StoreError::Backend(format!("{}: {}", op, e))
}

/// [`StateStore`] over the `relayer_state` table.
///
/// Every `set` is a single autocommit upsert, so it is durable once it returns.
#[derive(Clone)]
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect, migrate, and wrap the pool
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = create_pool(database_url).await?;
        run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let row = sqlx::query("SELECT value FROM relayer_state WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| backend("get", e))?;

        Ok(row.map(|r| r.get::<Vec<u8>, _>("value")))
    }

    async fn set(&self, key: &[u8], value: Vec<u8>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO relayer_state (key, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| backend("set", e))?;

        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT key FROM relayer_state
            WHERE substring(key FROM 1 FOR octet_length($1::BYTEA)) = $1::BYTEA
            ORDER BY key
            "#,
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| backend("keys_with_prefix", e))?;

        Ok(rows.iter().map(|r| r.get::<Vec<u8>, _>("key")).collect())
    }
}
