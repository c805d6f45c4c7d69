//! Postgres registry.
//!
//! Records are stored as JSONB next to the handful of columns the loops
//! filter on. Compare-and-swap is a conditional `UPDATE ... WHERE version = $n`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_id::WorkerPoolId;
use fleet_model::{
    Versioned, Worker, WorkerCredential, WorkerKey, WorkerPool, WorkerPoolError, WorkerState,
    INITIAL_VERSION,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::info;

use super::memory::check_new_worker;
use super::{Registry, RegistryError, RegistryResult};

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL.
    pub database_url: String,

    /// Maximum number of connections in the pool.
    pub max_connections: u32,

    /// Minimum number of idle connections.
    pub min_connections: u32,

    /// Connection acquire timeout.
    pub acquire_timeout: Duration,

    /// Idle connection timeout.
    pub idle_timeout: Duration,

    /// Maximum lifetime of a connection.
    pub max_lifetime: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/fleet".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

impl DbConfig {
    /// Load configuration from environment variables.
    ///
    /// Returns `None` when `DATABASE_URL` is unset.
    pub fn from_env() -> Option<Self> {
        let database_url = std::env::var("DATABASE_URL").ok()?;

        let max_connections = std::env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let min_connections = std::env::var("DB_MIN_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        Some(Self {
            database_url,
            max_connections,
            min_connections,
            ..Default::default()
        })
    }
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    pub async fn connect(config: &DbConfig) -> RegistryResult<Self> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect(&config.database_url)
            .await
            .map_err(RegistryError::Connect)?;

        info!("Database connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations, loaded from disk at runtime.
    pub async fn run_migrations(&self) -> RegistryResult<()> {
        info!("Running database migrations");

        let candidates = vec![
            std::path::PathBuf::from("./migrations"),
            std::path::PathBuf::from("services/worker-manager/migrations"),
            std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        ];
        let mut last_error: Option<sqlx::migrate::MigrateError> = None;

        for dir in &candidates {
            match sqlx::migrate::Migrator::new(dir.clone()).await {
                Ok(migrator) => {
                    info!(migrations_dir = %dir.display(), "Loaded migrations");
                    migrator
                        .run(&self.pool)
                        .await
                        .map_err(RegistryError::Migration)?;
                    info!("Database migrations complete");
                    return Ok(());
                }
                Err(e) => {
                    last_error = Some(e);
                }
            }
        }

        let tried = candidates
            .iter()
            .map(|dir| dir.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");

        Err(RegistryError::MigrationDirNotFound {
            tried,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    /// Get a registry handle.
    pub fn registry(&self) -> PgRegistry {
        PgRegistry::new(self.pool.clone())
    }
}

/// Registry backed by Postgres.
#[derive(Clone)]
pub struct PgRegistry {
    pool: PgPool,
}

impl PgRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn current_version(
        &self,
        sql: &str,
        binds: &[&str],
    ) -> RegistryResult<Option<i64>> {
        let mut query = sqlx::query(sql);
        for b in binds {
            query = query.bind(*b);
        }
        let row = query
            .fetch_optional(&self.pool)
            .await
            .map_err(RegistryError::Query)?;
        row.map(|r| r.try_get::<i64, _>("version"))
            .transpose()
            .map_err(RegistryError::Query)
    }
}

fn pool_from_row(row: &PgRow) -> RegistryResult<Versioned<WorkerPool>> {
    let version: i64 = row.try_get("version").map_err(RegistryError::Query)?;
    let Json(record): Json<WorkerPool> = row.try_get("record").map_err(RegistryError::Query)?;
    Ok(Versioned::new(version, record))
}

fn worker_from_row(row: &PgRow) -> RegistryResult<Versioned<Worker>> {
    let version: i64 = row.try_get("version").map_err(RegistryError::Query)?;
    let Json(record): Json<Worker> = row.try_get("record").map_err(RegistryError::Query)?;
    Ok(Versioned::new(version, record))
}

fn record_from_row<T: serde::de::DeserializeOwned>(row: &PgRow) -> RegistryResult<T> {
    let Json(record): Json<T> = row.try_get("record").map_err(RegistryError::Query)?;
    Ok(record)
}

#[async_trait]
impl Registry for PgRegistry {
    async fn health_check(&self) -> RegistryResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(RegistryError::Query)?;
        Ok(())
    }

    async fn get_worker_pool(
        &self,
        id: &WorkerPoolId,
    ) -> RegistryResult<Option<Versioned<WorkerPool>>> {
        let row = sqlx::query("SELECT record, version FROM worker_pools WHERE worker_pool_id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(RegistryError::Query)?;
        row.as_ref().map(pool_from_row).transpose()
    }

    async fn list_worker_pools(&self) -> RegistryResult<Vec<Versioned<WorkerPool>>> {
        let rows = sqlx::query("SELECT record, version FROM worker_pools ORDER BY worker_pool_id")
            .fetch_all(&self.pool)
            .await
            .map_err(RegistryError::Query)?;
        rows.iter().map(pool_from_row).collect()
    }

    async fn create_worker_pool(&self, pool: WorkerPool) -> RegistryResult<Versioned<WorkerPool>> {
        pool.validate()?;
        let result = sqlx::query(
            r#"
            INSERT INTO worker_pools (worker_pool_id, provider_id, record, version)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (worker_pool_id) DO NOTHING
            "#,
        )
        .bind(pool.worker_pool_id.to_string())
        .bind(pool.provider_id.as_str())
        .bind(Json(&pool))
        .bind(INITIAL_VERSION)
        .execute(&self.pool)
        .await
        .map_err(RegistryError::Query)?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::already_exists(
                "worker pool",
                &pool.worker_pool_id,
            ));
        }
        Ok(Versioned::new(INITIAL_VERSION, pool))
    }

    async fn update_worker_pool(
        &self,
        pool: WorkerPool,
        expected_version: i64,
    ) -> RegistryResult<Versioned<WorkerPool>> {
        pool.validate()?;
        let id = pool.worker_pool_id.to_string();
        let row = sqlx::query(
            r#"
            UPDATE worker_pools
            SET provider_id = $2, record = $3, version = version + 1, updated_at = now()
            WHERE worker_pool_id = $1 AND version = $4
            RETURNING version
            "#,
        )
        .bind(&id)
        .bind(pool.provider_id.as_str())
        .bind(Json(&pool))
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await
        .map_err(RegistryError::Query)?;

        if let Some(row) = row {
            let version: i64 = row.try_get("version").map_err(RegistryError::Query)?;
            return Ok(Versioned::new(version, pool));
        }
        match self
            .current_version(
                "SELECT version FROM worker_pools WHERE worker_pool_id = $1",
                &[&id],
            )
            .await?
        {
            Some(actual) => Err(RegistryError::conflict(
                "worker pool",
                &id,
                expected_version,
                actual,
            )),
            None => Err(RegistryError::not_found("worker pool", &id)),
        }
    }

    async fn delete_worker_pool(
        &self,
        id: &WorkerPoolId,
        expected_version: i64,
    ) -> RegistryResult<()> {
        let id = id.to_string();
        let mut tx = self.pool.begin().await.map_err(RegistryError::Query)?;

        let row = sqlx::query("SELECT version FROM worker_pools WHERE worker_pool_id = $1 FOR UPDATE")
            .bind(&id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(RegistryError::Query)?;
        let Some(row) = row else {
            return Err(RegistryError::not_found("worker pool", &id));
        };
        let actual: i64 = row.try_get("version").map_err(RegistryError::Query)?;
        if actual != expected_version {
            return Err(RegistryError::conflict(
                "worker pool",
                &id,
                expected_version,
                actual,
            ));
        }

        let live: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM workers WHERE worker_pool_id = $1 AND state <> 'stopped')",
        )
        .bind(&id)
        .fetch_one(&mut *tx)
        .await
        .map_err(RegistryError::Query)?;
        if live {
            return Err(RegistryError::PoolNotEmpty(id));
        }

        sqlx::query("DELETE FROM workers WHERE worker_pool_id = $1")
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(RegistryError::Query)?;
        sqlx::query("DELETE FROM worker_pools WHERE worker_pool_id = $1")
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(RegistryError::Query)?;

        tx.commit().await.map_err(RegistryError::Query)?;
        Ok(())
    }

    async fn get_worker(&self, key: &WorkerKey) -> RegistryResult<Option<Versioned<Worker>>> {
        let row = sqlx::query(
            r#"
            SELECT record, version FROM workers
            WHERE worker_pool_id = $1 AND worker_group = $2 AND worker_id = $3
            "#,
        )
        .bind(key.worker_pool_id.to_string())
        .bind(key.worker_group.as_str())
        .bind(key.worker_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(RegistryError::Query)?;
        row.as_ref().map(worker_from_row).transpose()
    }

    async fn create_worker(&self, worker: Worker) -> RegistryResult<Versioned<Worker>> {
        check_new_worker(&worker)?;
        let key = worker.key();
        let pool_id = key.worker_pool_id.to_string();
        let result = sqlx::query(
            r#"
            INSERT INTO workers (
                worker_pool_id, worker_group, worker_id, provider_id,
                state, expires, last_modified, record, version
            )
            SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9
            WHERE EXISTS (SELECT 1 FROM worker_pools WHERE worker_pool_id = $1)
            ON CONFLICT (worker_pool_id, worker_group, worker_id) DO NOTHING
            "#,
        )
        .bind(&pool_id)
        .bind(key.worker_group.as_str())
        .bind(key.worker_id.as_str())
        .bind(worker.provider_id.as_str())
        .bind(worker.state.as_str())
        .bind(worker.expires)
        .bind(worker.last_modified)
        .bind(Json(&worker))
        .bind(INITIAL_VERSION)
        .execute(&self.pool)
        .await
        .map_err(RegistryError::Query)?;

        if result.rows_affected() == 0 {
            let pool_exists = self
                .current_version(
                    "SELECT version FROM worker_pools WHERE worker_pool_id = $1",
                    &[&pool_id],
                )
                .await?
                .is_some();
            return Err(if pool_exists {
                RegistryError::already_exists("worker", &key)
            } else {
                RegistryError::not_found("worker pool", &pool_id)
            });
        }
        Ok(Versioned::new(INITIAL_VERSION, worker))
    }

    async fn update_worker(
        &self,
        worker: Worker,
        expected_version: i64,
    ) -> RegistryResult<Versioned<Worker>> {
        let key = worker.key();
        let pool_id = key.worker_pool_id.to_string();
        let row = sqlx::query(
            r#"
            UPDATE workers
            SET state = $4, expires = $5, last_modified = $6, record = $7, version = version + 1
            WHERE worker_pool_id = $1 AND worker_group = $2 AND worker_id = $3 AND version = $8
            RETURNING version
            "#,
        )
        .bind(&pool_id)
        .bind(key.worker_group.as_str())
        .bind(key.worker_id.as_str())
        .bind(worker.state.as_str())
        .bind(worker.expires)
        .bind(worker.last_modified)
        .bind(Json(&worker))
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await
        .map_err(RegistryError::Query)?;

        if let Some(row) = row {
            let version: i64 = row.try_get("version").map_err(RegistryError::Query)?;
            return Ok(Versioned::new(version, worker));
        }
        match self
            .current_version(
                r#"
                SELECT version FROM workers
                WHERE worker_pool_id = $1 AND worker_group = $2 AND worker_id = $3
                "#,
                &[&pool_id, key.worker_group.as_str(), key.worker_id.as_str()],
            )
            .await?
        {
            Some(actual) => Err(RegistryError::conflict(
                "worker",
                &key,
                expected_version,
                actual,
            )),
            None => Err(RegistryError::not_found("worker", &key)),
        }
    }

    async fn list_workers(
        &self,
        pool: &WorkerPoolId,
        states: &[WorkerState],
    ) -> RegistryResult<Vec<Versioned<Worker>>> {
        let states: Vec<&str> = states.iter().map(|s| s.as_str()).collect();
        let rows = sqlx::query(
            r#"
            SELECT record, version FROM workers
            WHERE worker_pool_id = $1
              AND (cardinality($2::text[]) = 0 OR state = ANY($2::text[]))
            ORDER BY worker_group, worker_id
            "#,
        )
        .bind(pool.to_string())
        .bind(states)
        .fetch_all(&self.pool)
        .await
        .map_err(RegistryError::Query)?;
        rows.iter().map(worker_from_row).collect()
    }

    async fn purge_stopped_workers(&self, before: DateTime<Utc>) -> RegistryResult<u64> {
        let result =
            sqlx::query("DELETE FROM workers WHERE state = 'stopped' AND last_modified < $1")
                .bind(before)
                .execute(&self.pool)
                .await
                .map_err(RegistryError::Query)?;
        Ok(result.rows_affected())
    }

    async fn record_error(&self, error: WorkerPoolError) -> RegistryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO worker_pool_errors (error_id, worker_pool_id, reported_at, record)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(error.error_id.to_string())
        .bind(error.worker_pool_id.to_string())
        .bind(error.reported_at)
        .bind(Json(&error))
        .execute(&self.pool)
        .await
        .map_err(RegistryError::Query)?;
        Ok(())
    }

    async fn list_errors(&self, pool: &WorkerPoolId) -> RegistryResult<Vec<WorkerPoolError>> {
        let rows = sqlx::query(
            r#"
            SELECT record FROM worker_pool_errors
            WHERE worker_pool_id = $1
            ORDER BY reported_at DESC
            "#,
        )
        .bind(pool.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(RegistryError::Query)?;
        rows.iter().map(record_from_row).collect()
    }

    async fn insert_credential(&self, credential: WorkerCredential) -> RegistryResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO worker_credentials (token_hash, credential_id, worker_pool_id, expires_at, record)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&credential.token_hash)
        .bind(credential.credential_id.to_string())
        .bind(credential.worker_pool_id.to_string())
        .bind(credential.expires_at)
        .bind(Json(&credential))
        .execute(&self.pool)
        .await
        .map_err(RegistryError::Query)?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::already_exists(
                "credential",
                &credential.credential_id,
            ));
        }
        Ok(())
    }

    async fn find_credential(&self, token_hash: &str) -> RegistryResult<Option<WorkerCredential>> {
        let row = sqlx::query("SELECT record FROM worker_credentials WHERE token_hash = $1")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(RegistryError::Query)?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn purge_expired_credentials(&self, before: DateTime<Utc>) -> RegistryResult<u64> {
        let result = sqlx::query("DELETE FROM worker_credentials WHERE expires_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await
            .map_err(RegistryError::Query)?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_config_defaults() {
        let config = DbConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 1);
    }
}
