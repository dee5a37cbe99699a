use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pdoflow_migrations::migrate;
use pdoflow_registry::JobRegistry;
use pdoflow_shutdown_signal::{os_shutdown_signal, ShutdownSignal};
use rand::Rng;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use thiserror::Error;

use crate::failure_cache::{
    FailureCache, DEFAULT_FAILURE_BUDGET, DEFAULT_MAX_JOBS_PER_POSTING, DEFAULT_MAX_POSTINGS,
};
use crate::utils::escape_identifier;
use crate::worker::{ExceptionLogging, Worker};

pub const DEFAULT_SCHEMA: &str = "pdoflow";
pub const DEFAULT_BATCH_SIZE: i64 = 10;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_PROFILE_RATE: f64 = 0.1;

/// Builder for [`Worker`].
///
/// A worker needs a registry and one way to reach the database. When given a
/// url or connect options it builds its own pool capped at a single
/// connection; a caller-provided pool is taken as-is, so cap it yourself if
/// the one-connection-per-worker property matters to you.
#[derive(Default)]
pub struct WorkerOptions {
    schema: Option<String>,
    batch_size: Option<i64>,
    poll_interval: Option<Duration>,
    exception_logging: Option<ExceptionLogging>,
    profile_rate: Option<f64>,
    failure_budget: Option<u32>,
    registry: Option<Arc<JobRegistry>>,
    pg_pool: Option<PgPool>,
    pg_connect_options: Option<PgConnectOptions>,
    database_url: Option<String>,
    shutdown_signal: Option<ShutdownSignal>,
}

#[derive(Error, Debug)]
pub enum WorkerBuildError {
    #[error("Error occured while connecting to the postgres database: {0}")]
    ConnectError(#[from] sqlx::Error),
    #[error("Error occured while preparing the worker: {0}")]
    QueryError(#[from] crate::errors::PdoflowError),
    #[error("Error occured while migrating: {0}")]
    MigrateError(#[from] pdoflow_migrations::MigrateError),
    #[error("No database configured: provide a pool, connect options or a database url")]
    MissingDatabase,
    #[error("A worker needs a registry of callables")]
    MissingRegistry,
}

impl WorkerOptions {
    pub async fn init(self) -> Result<Worker, WorkerBuildError> {
        let registry = self.registry.ok_or(WorkerBuildError::MissingRegistry)?;

        let pg_pool = match (self.pg_pool, self.pg_connect_options, self.database_url) {
            (Some(pool), _, _) => pool,
            (None, Some(options), _) => {
                PgPoolOptions::new()
                    .max_connections(1)
                    .connect_with(options)
                    .await?
            }
            (None, None, Some(url)) => {
                PgPoolOptions::new()
                    .max_connections(1)
                    .connect(&url)
                    .await?
            }
            (None, None, None) => return Err(WorkerBuildError::MissingDatabase),
        };

        let schema = self.schema.unwrap_or_else(|| DEFAULT_SCHEMA.to_string());
        let escaped_schema = escape_identifier(&pg_pool, &schema).await?;

        migrate(&pg_pool, &escaped_schema).await?;

        let failure_budget = self.failure_budget.unwrap_or(DEFAULT_FAILURE_BUDGET);
        let worker = Worker {
            worker_id: format!("pdoflow_worker_{:016x}", rand::thread_rng().gen::<u64>()),
            pg_pool,
            escaped_schema,
            registry,
            batch_size: self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            poll_interval: self.poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL),
            exception_logging: self.exception_logging.unwrap_or_default(),
            profile_rate: self.profile_rate.unwrap_or(DEFAULT_PROFILE_RATE),
            failure_cache: FailureCache::with_limits(
                DEFAULT_MAX_POSTINGS,
                DEFAULT_MAX_JOBS_PER_POSTING,
                failure_budget,
            ),
            resolution_cache: HashMap::new(),
            shutdown_signal: self.shutdown_signal.unwrap_or_else(os_shutdown_signal),
        };

        Ok(worker)
    }

    pub fn schema(mut self, value: &str) -> Self {
        self.schema = Some(value.into());
        self
    }

    pub fn batch_size(mut self, value: i64) -> Self {
        self.batch_size = Some(value);
        self
    }

    pub fn poll_interval(mut self, value: Duration) -> Self {
        self.poll_interval = Some(value);
        self
    }

    pub fn exception_logging(mut self, value: ExceptionLogging) -> Self {
        self.exception_logging = Some(value);
        self
    }

    /// Probability in `[0.0, 1.0]` that a unit runs under the profiler.
    pub fn profile_rate(mut self, value: f64) -> Self {
        self.profile_rate = Some(value.clamp(0.0, 1.0));
        self
    }

    pub fn failure_budget(mut self, value: u32) -> Self {
        self.failure_budget = Some(value);
        self
    }

    pub fn registry(mut self, value: Arc<JobRegistry>) -> Self {
        self.registry = Some(value);
        self
    }

    pub fn pg_pool(mut self, value: PgPool) -> Self {
        self.pg_pool = Some(value);
        self
    }

    pub fn pg_connect_options(mut self, value: PgConnectOptions) -> Self {
        self.pg_connect_options = Some(value);
        self
    }

    pub fn database_url(mut self, value: &str) -> Self {
        self.database_url = Some(value.into());
        self
    }

    pub fn shutdown_signal(mut self, value: ShutdownSignal) -> Self {
        self.shutdown_signal = Some(value);
        self
    }
}
