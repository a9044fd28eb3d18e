pub mod transaction;

use crate::config::AppConfig;
use crate::errors::ServiceError;
use metrics::{counter, gauge, histogram};
use sea_orm::{ConnectOptions, Database, DatabaseConnection, DatabaseTransaction, DbErr};
use sea_orm_migration::MigratorTrait;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub use transaction::{transaction_scope, BoxFuture};

/// Type alias for a database connection pool
pub type DbPool = DatabaseConnection;

/// Backoff step between read retries; attempt `n` waits `n * READ_RETRY_BACKOFF`.
const READ_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Configuration for database connection
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL
    pub url: String,
    /// Maximum number of connections
    pub max_connections: u32,
    /// Minimum number of connections
    pub min_connections: u32,
    /// Connection timeout duration
    pub connect_timeout: Duration,
    /// Idle timeout duration
    pub idle_timeout: Duration,
    /// Whether sqlx should log every statement
    pub sqlx_logging: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            sqlx_logging: false,
        }
    }
}

impl From<&AppConfig> for DbConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            url: cfg.database_url.clone(),
            max_connections: cfg.db_max_connections,
            min_connections: cfg.db_min_connections,
            connect_timeout: Duration::from_secs(cfg.db_connect_timeout_secs),
            ..Default::default()
        }
    }
}

/// Establishes a connection pool to the database with custom configuration
///
/// # Errors
/// Returns a `StoreError` if the connection cannot be established
pub async fn establish_connection_with_config(config: &DbConfig) -> Result<DbPool, ServiceError> {
    debug!("Configuring database connection with: {:?}", config);

    let mut opt = ConnectOptions::new(config.url.clone());
    opt.max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .connect_timeout(config.connect_timeout)
        .idle_timeout(config.idle_timeout)
        .sqlx_logging(config.sqlx_logging);

    gauge!("costura_db.max_connections", config.max_connections as f64);

    info!(
        "Connecting to database with max_connections={}",
        config.max_connections
    );

    let db_pool = Database::connect(opt).await.map_err(|e| {
        error!("Database connection establishment failed: {}", e);
        ServiceError::StoreError(e)
    })?;

    info!("Database connection pool established successfully");
    Ok(db_pool)
}

/// Establish DB pool using AppConfig tuning
pub async fn establish_connection_from_app_config(cfg: &AppConfig) -> Result<DbPool, ServiceError> {
    let db_cfg: DbConfig = cfg.into();
    establish_connection_with_config(&db_cfg).await
}

/// Runs the embedded migrations
pub async fn run_migrations(pool: &DbPool) -> Result<(), ServiceError> {
    info!("Running database migrations");
    let start = Instant::now();

    let result = crate::migrator::Migrator::up(pool, None)
        .await
        .map_err(ServiceError::StoreError);

    let elapsed = start.elapsed();
    match &result {
        Ok(_) => info!("Database migrations completed successfully in {:?}", elapsed),
        Err(e) => error!("Database migrations failed after {:?}: {}", elapsed, e),
    }

    result
}

/// Client for the remote store.
///
/// Every call runs under the configured deadline and fails with
/// [`ServiceError::Timeout`] past it. Reads are retried on transient
/// failures; writes and transactions never are, so a slow checkout cannot
/// turn into two orders.
#[derive(Debug, Clone)]
pub struct StoreClient {
    pool: Arc<DbPool>,
    request_timeout: Duration,
    read_retries: u32,
}

impl StoreClient {
    pub fn new(pool: Arc<DbPool>, request_timeout: Duration, read_retries: u32) -> Self {
        Self {
            pool,
            request_timeout,
            read_retries,
        }
    }

    pub fn from_config(pool: Arc<DbPool>, cfg: &AppConfig) -> Self {
        Self::new(pool, cfg.request_timeout(), cfg.read_retries)
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Runs a read, retrying up to `read_retries` times on timeouts and
    /// connection-level failures with linear backoff.
    pub async fn read<F, Fut, T>(&self, operation: &str, f: F) -> Result<T, ServiceError>
    where
        F: Fn(DbPool) -> Fut,
        Fut: Future<Output = Result<T, DbErr>>,
    {
        let mut attempt = 0;
        loop {
            match self.run(operation, f((*self.pool).clone())).await {
                Err(err) if err.is_retryable() && attempt < self.read_retries => {
                    attempt += 1;
                    warn!(operation = %operation, attempt, error = %err, "Retrying read");
                    counter!("costura_db.read.retry", 1, "operation" => operation.to_string());
                    tokio::time::sleep(READ_RETRY_BACKOFF * attempt).await;
                }
                result => return result,
            }
        }
    }

    /// Runs a single write under the deadline. Never retried.
    pub async fn write<F, Fut, T>(&self, operation: &str, f: F) -> Result<T, ServiceError>
    where
        F: FnOnce(DbPool) -> Fut,
        Fut: Future<Output = Result<T, DbErr>>,
    {
        self.run(operation, f((*self.pool).clone())).await
    }

    /// Runs `f` as one atomic transaction under the deadline. A deadline hit
    /// drops the transaction, which rolls it back.
    pub async fn transaction<F, T>(&self, operation: &str, f: F) -> Result<T, ServiceError>
    where
        F: for<'c> FnOnce(&'c DatabaseTransaction) -> BoxFuture<'c, Result<T, ServiceError>>
            + Send,
        T: Send,
    {
        let start = Instant::now();
        debug!(operation = %operation, "Starting database transaction");

        let result = match tokio::time::timeout(
            self.request_timeout,
            transaction_scope(&self.pool, f),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ServiceError::Timeout(operation.to_string())),
        };

        let elapsed = start.elapsed();
        histogram!("costura_db.transaction.duration", elapsed.as_secs_f64());
        match &result {
            Ok(_) => {
                counter!("costura_db.transaction.committed", 1);
                debug!(operation = %operation, "Transaction committed in {:?}", elapsed);
            }
            Err(e) => {
                counter!("costura_db.transaction.rolled_back", 1);
                warn!(operation = %operation, error = %e, "Transaction rolled back after {:?}", elapsed);
            }
        }

        result
    }

    async fn run<Fut, T>(&self, operation: &str, fut: Fut) -> Result<T, ServiceError>
    where
        Fut: Future<Output = Result<T, DbErr>>,
    {
        let start = Instant::now();
        let result = match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                error!(operation = %operation, error = %e, "Database operation failed");
                counter!("costura_db.operation.error", 1, "operation" => operation.to_string());
                Err(ServiceError::StoreError(e))
            }
            Err(_) => {
                warn!(operation = %operation, timeout = ?self.request_timeout, "Database operation timed out");
                counter!("costura_db.operation.timeout", 1, "operation" => operation.to_string());
                Err(ServiceError::Timeout(operation.to_string()))
            }
        };

        histogram!(
            "costura_db.operation.duration",
            start.elapsed().as_secs_f64(),
            "operation" => operation.to_string()
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn client(timeout: Duration, retries: u32) -> StoreClient {
        let pool = establish_connection_with_config(&DbConfig {
            url: "sqlite::memory:".into(),
            max_connections: 1,
            ..Default::default()
        })
        .await
        .unwrap();
        StoreClient::new(Arc::new(pool), timeout, retries)
    }

    #[tokio::test]
    async fn slow_reads_time_out_and_are_retried() {
        let store = client(Duration::from_millis(20), 2).await;
        let calls = AtomicU32::new(0);

        let result: Result<(), ServiceError> = store
            .read("slow", |_db| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(())
                }
            })
            .await;

        assert!(matches!(result, Err(ServiceError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn writes_are_not_retried() {
        let store = client(Duration::from_millis(20), 2).await;
        let calls = AtomicU32::new(0);

        let result: Result<(), ServiceError> = store
            .write("slow", |_db| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(())
                }
            })
            .await;

        assert!(matches!(result, Err(ServiceError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn store_errors_are_not_retried() {
        let store = client(Duration::from_secs(1), 2).await;
        let calls = AtomicU32::new(0);

        let result: Result<(), ServiceError> = store
            .read("broken", |_db| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(DbErr::Custom("constraint failed".into())) }
            })
            .await;

        assert!(matches!(result, Err(ServiceError::StoreError(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
