use std::sync::Arc;
use std::time::Duration;

use pdoflow_migrations::migrate;
use pdoflow_registry::JobRegistry;
use pdoflow_shutdown_signal::{ShutdownController, ShutdownSignal};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::builder::{WorkerBuildError, WorkerOptions, DEFAULT_SCHEMA};
use crate::errors::{PdoflowError, Result};
use crate::sql::posting::{posting_snapshot, PostingSnapshot};
use crate::utils::escape_identifier;
use crate::worker::ExceptionLogging;

pub const DEFAULT_UPKEEP_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// What every spawned worker is configured with.
#[derive(Clone)]
struct WorkerTemplate {
    schema: String,
    batch_size: Option<i64>,
    poll_interval: Option<Duration>,
    exception_logging: Option<ExceptionLogging>,
    profile_rate: Option<f64>,
    failure_budget: Option<u32>,
    registry: Arc<JobRegistry>,
    connect_options: PgConnectOptions,
}

impl WorkerTemplate {
    fn to_options(&self, shutdown_signal: ShutdownSignal) -> WorkerOptions {
        let mut options = WorkerOptions::default()
            .schema(&self.schema)
            .registry(self.registry.clone())
            .pg_connect_options(self.connect_options.clone())
            .shutdown_signal(shutdown_signal);

        if let Some(batch_size) = self.batch_size {
            options = options.batch_size(batch_size);
        }
        if let Some(poll_interval) = self.poll_interval {
            options = options.poll_interval(poll_interval);
        }
        if let Some(exception_logging) = self.exception_logging {
            options = options.exception_logging(exception_logging);
        }
        if let Some(profile_rate) = self.profile_rate {
            options = options.profile_rate(profile_rate);
        }
        if let Some(failure_budget) = self.failure_budget {
            options = options.failure_budget(failure_budget);
        }
        options
    }
}

/// Builder for [`WorkerPool`].
#[derive(Default)]
pub struct PoolOptions {
    max_workers: Option<usize>,
    upkeep_interval: Option<Duration>,
    grace_period: Option<Duration>,
    schema: Option<String>,
    batch_size: Option<i64>,
    poll_interval: Option<Duration>,
    exception_logging: Option<ExceptionLogging>,
    profile_rate: Option<f64>,
    failure_budget: Option<u32>,
    registry: Option<Arc<JobRegistry>>,
    pg_connect_options: Option<PgConnectOptions>,
    database_url: Option<String>,
}

impl PoolOptions {
    /// Connects, migrates, and spawns the initial complement of workers.
    pub async fn init(self) -> std::result::Result<WorkerPool, WorkerBuildError> {
        let registry = self.registry.ok_or(WorkerBuildError::MissingRegistry)?;

        let connect_options = match (self.pg_connect_options, self.database_url) {
            (Some(options), _) => options,
            (None, Some(url)) => url.parse::<PgConnectOptions>()?,
            (None, None) => return Err(WorkerBuildError::MissingDatabase),
        };

        let management_pool = PgPoolOptions::new()
            .max_connections(2)
            .connect_with(connect_options.clone())
            .await?;

        let schema = self.schema.unwrap_or_else(|| DEFAULT_SCHEMA.to_string());
        let escaped_schema = escape_identifier(&management_pool, &schema).await?;
        migrate(&management_pool, &escaped_schema).await?;

        let max_workers = self.max_workers.unwrap_or_else(num_cpus::get);
        let mut pool = WorkerPool {
            slots: (0..max_workers).map(|_| None).collect(),
            shutdown: ShutdownController::new(),
            template: WorkerTemplate {
                schema,
                batch_size: self.batch_size,
                poll_interval: self.poll_interval,
                exception_logging: self.exception_logging,
                profile_rate: self.profile_rate,
                failure_budget: self.failure_budget,
                registry,
                connect_options,
            },
            management_pool,
            escaped_schema,
            upkeep_interval: self.upkeep_interval.unwrap_or(DEFAULT_UPKEEP_INTERVAL),
            grace_period: self.grace_period.unwrap_or(DEFAULT_GRACE_PERIOD),
            closed: false,
        };

        pool.upkeep().await;
        Ok(pool)
    }

    pub fn max_workers(mut self, value: usize) -> Self {
        self.max_workers = Some(value);
        self
    }

    /// How often `run` inspects its workers, as an interval.
    pub fn upkeep_interval(mut self, value: Duration) -> Self {
        self.upkeep_interval = Some(value);
        self
    }

    /// Time workers get to finish their current unit during `close`.
    pub fn grace_period(mut self, value: Duration) -> Self {
        self.grace_period = Some(value);
        self
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

    pub fn profile_rate(mut self, value: f64) -> Self {
        self.profile_rate = Some(value);
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

    pub fn pg_connect_options(mut self, value: PgConnectOptions) -> Self {
        self.pg_connect_options = Some(value);
        self
    }

    pub fn database_url(mut self, value: &str) -> Self {
        self.database_url = Some(value.into());
        self
    }
}

/// Spawns and babysits a target count of workers.
///
/// Each slot holds at most one running worker task; `upkeep` reaps exited
/// workers and refills empty slots. Every worker builds its own
/// single-connection pool, so the supervisor shares no database state with
/// its workers after spawn.
pub struct WorkerPool {
    slots: Vec<Option<JoinHandle<()>>>,
    shutdown: ShutdownController,
    template: WorkerTemplate,
    management_pool: PgPool,
    escaped_schema: String,
    upkeep_interval: Duration,
    grace_period: Duration,
    closed: bool,
}

impl WorkerPool {
    pub fn options() -> PoolOptions {
        PoolOptions::default()
    }

    fn spawn_worker(&self, slot: usize) -> JoinHandle<()> {
        let options = self.template.to_options(self.shutdown.signal());

        tokio::spawn(async move {
            match options.init().await {
                Ok(worker) => {
                    if let Err(e) = worker.run().await {
                        error!(slot, error = ?e, "Worker exited with error");
                    }
                }
                Err(e) => {
                    error!(slot, error = ?e, "Worker failed to start");
                }
            }
        })
    }

    /// One inspection pass: reap exited workers, refill empty slots up to
    /// the target count. Returns the number of live workers afterwards.
    pub async fn upkeep(&mut self) -> usize {
        if self.closed {
            return 0;
        }

        for slot in &mut self.slots {
            let exited = slot.as_ref().map(JoinHandle::is_finished).unwrap_or(false);
            if exited {
                if let Some(handle) = slot.take() {
                    match handle.await {
                        Ok(()) => info!("Reaped exited worker"),
                        Err(e) => warn!(error = ?e, "Reaped dead worker"),
                    }
                }
            }
        }

        for index in 0..self.slots.len() {
            if self.slots[index].is_none() {
                debug!(slot = index, "Spawning worker");
                self.slots[index] = Some(self.spawn_worker(index));
            }
        }

        self.live_workers()
    }

    /// Count of workers currently running.
    pub fn live_workers(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false))
            .count()
    }

    pub fn max_workers(&self) -> usize {
        self.slots.len()
    }

    /// Forcefully kills the worker in the given slot, as if its process
    /// died. The next `upkeep` resurrects the slot.
    pub fn terminate_worker(&mut self, index: usize) -> bool {
        match self.slots.get_mut(index).and_then(Option::take) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Drives upkeep at the configured rate until the given signal resolves,
    /// then closes the pool.
    pub async fn run_until(&mut self, stop: ShutdownSignal) {
        loop {
            self.upkeep().await;

            let stop = stop.clone();
            tokio::select! {
                _ = sleep(self.upkeep_interval) => (),
                _ = stop => {
                    self.close().await;
                    return;
                }
            }
        }
    }

    /// Cooperative stop: signals every worker, waits up to the grace period
    /// for them to finish their current unit, then terminates stragglers.
    /// Safe to call more than once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shutdown.trigger();

        let deadline = Instant::now() + self.grace_period;
        for slot in &mut self.slots {
            let Some(mut handle) = slot.take() else {
                continue;
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, &mut handle).await {
                Ok(Ok(())) => (),
                Ok(Err(e)) => warn!(error = ?e, "Worker died during shutdown"),
                Err(_elapsed) => {
                    warn!("Worker exceeded the grace period, terminating");
                    handle.abort();
                }
            }
        }

        info!("Worker pool closed");
    }

    /// Drives upkeep and polls until the posting reaches a terminal status
    /// (or full completion), or `max_wait` elapses.
    pub async fn await_posting_completion(
        &mut self,
        posting_id: Uuid,
        poll_time: Duration,
        max_wait: Option<Duration>,
    ) -> Result<PostingSnapshot> {
        let started = Instant::now();

        loop {
            self.upkeep().await;

            let snapshot =
                posting_snapshot(&self.management_pool, &self.escaped_schema, posting_id)
                    .await?
                    .ok_or(PdoflowError::PostingNotFound(posting_id))?;

            if snapshot.status().is_terminal() || snapshot.percent_done() >= 100.0 {
                return Ok(snapshot);
            }

            if let Some(max_wait) = max_wait {
                if started.elapsed() > max_wait {
                    return Err(PdoflowError::Timeout(max_wait));
                }
            }

            sleep(poll_time).await;
        }
    }

    /// The supervisor's own database handle, for observers running in the
    /// submitting process.
    pub fn management_pool(&self) -> &PgPool {
        &self.management_pool
    }

    pub fn escaped_schema(&self) -> &str {
        &self.escaped_schema
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // No awaiting in drop; signal and terminate so children never leak.
        self.shutdown.trigger();
        for slot in &mut self.slots {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}
