use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use getset::Getters;
use pdoflow_registry::{JobRegistry, RegisteredJob, RegistryError};
use pdoflow_shutdown_signal::ShutdownSignal;
use rand::Rng;
use sqlx::PgPool;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::builder::WorkerOptions;
use crate::errors::Result;
use crate::failure_cache::FailureCache;
use crate::profiling::{CallGraphStats, WallClockProfiler};
use crate::sql::claim_batch::{claim_batch, ClaimedJob};
use crate::sql::posting::posting_snapshots;
use crate::sql::profile::persist_profile;
use crate::sql::release_job::{
    complete_job, fail_job, mark_job_bad, return_job, sync_posting_status,
};

const BASE_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const MAX_JITTER_MS: u64 = 100;

/// Severity at which user-function failures are emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExceptionLogging {
    None,
    Debug,
    Info,
    #[default]
    Warn,
    Error,
}

impl FromStr for ExceptionLogging {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "none" => Ok(ExceptionLogging::None),
            "debug" => Ok(ExceptionLogging::Debug),
            "info" => Ok(ExceptionLogging::Info),
            "warn" | "warning" => Ok(ExceptionLogging::Warn),
            "error" => Ok(ExceptionLogging::Error),
            other => Err(format!("'{other}' is not a log severity")),
        }
    }
}

/// A single-threaded cooperative claim/execute/commit loop.
///
/// Each worker owns exactly one private database connection for its entire
/// life; all cross-worker coordination happens through row state and SKIP
/// LOCKED claims. User failures are expected and never fatal to the worker.
#[derive(Getters)]
#[getset(get = "pub")]
pub struct Worker {
    /// Unique identifier for this worker instance
    pub(crate) worker_id: String,
    /// Single-connection pool private to this worker
    pub(crate) pg_pool: PgPool,
    /// Schema name, quoted for direct SQL interpolation
    pub(crate) escaped_schema: String,
    /// Registry used to resolve claimed units into callables
    #[getset(skip)]
    pub(crate) registry: Arc<JobRegistry>,
    /// Units claimed per cycle
    pub(crate) batch_size: i64,
    /// Sleep between empty claims
    pub(crate) poll_interval: Duration,
    /// Severity for user-function failures
    pub(crate) exception_logging: ExceptionLogging,
    /// Probability a unit is executed under the profiler
    pub(crate) profile_rate: f64,
    #[getset(skip)]
    pub(crate) failure_cache: FailureCache,
    #[getset(skip)]
    pub(crate) resolution_cache: HashMap<(String, String), Arc<RegisteredJob>>,
    #[getset(skip)]
    pub(crate) shutdown_signal: ShutdownSignal,
}

impl Worker {
    pub fn options() -> WorkerOptions {
        WorkerOptions::default()
    }

    /// Runs until the shutdown signal triggers. A worker finishes the unit
    /// it is executing, returns the rest of its claimed batch to the queue,
    /// and exits.
    pub async fn run(mut self) -> Result<()> {
        info!(worker_id = %self.worker_id, "Worker started");
        let mut backoff = BASE_BACKOFF;

        'outer: while !self.shutdown_requested() {
            let skip = self.failure_cache.blacklisted_postings();
            let batch = match claim_batch(
                &self.pg_pool,
                &self.escaped_schema,
                self.batch_size,
                &skip,
            )
            .await
            {
                Ok(batch) => {
                    backoff = BASE_BACKOFF;
                    batch
                }
                Err(e) => {
                    error!(worker_id = %self.worker_id, error = ?e, "Claim failed, backing off");
                    self.sleep_or_shutdown(with_jitter(backoff)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            if batch.is_empty() {
                debug!(worker_id = %self.worker_id, "Nothing claimed, waiting");
                self.purge_settled_postings().await;
                self.sleep_or_shutdown(with_jitter(self.poll_interval)).await;
                continue;
            }

            let mut units = batch.into_iter();
            while let Some(job) = units.next() {
                self.process_job(job).await;

                if self.shutdown_requested() {
                    self.release_unprocessed(units.collect()).await;
                    break 'outer;
                }
            }
        }

        info!(worker_id = %self.worker_id, "Worker stopped");
        Ok(())
    }

    async fn process_job(&mut self, job: ClaimedJob) {
        let job_id = *job.record().id();
        let posting_id = *job.record().posting_id();

        if self.failure_cache.is_blacklisted(&posting_id) {
            // This worker already gave up on the posting; settle the unit
            // without burning an execution on it.
            if let Err(e) = self.release_bad(job_id, posting_id).await {
                error!(job_id = %job_id, error = ?e, "Failed to settle blacklisted unit");
            }
            return;
        }

        let (outcome, stats) = self.execute_unit(&job).await;

        let released = match outcome {
            Ok(()) => {
                debug!(job_id = %job_id, worker_id = %self.worker_id, "Unit succeeded");
                self.release_success(job_id, posting_id, stats).await
            }
            Err(message) => self.release_failure(&job, &message).await,
        };

        if let Err(e) = released {
            // The transaction rolled back; the row resurfaces on its own.
            error!(job_id = %job_id, error = ?e, "Failed to commit unit outcome");
        }
    }

    /// Executes the unit's callable, optionally under the profiler. Panics
    /// inside user code are contained by running it on its own task.
    async fn execute_unit(
        &mut self,
        job: &ClaimedJob,
    ) -> (std::result::Result<(), String>, Option<CallGraphStats>) {
        let registered = match self.resolve(job.entry_point(), job.target_function()) {
            Ok(registered) => registered,
            Err(e) => return (Err(format!("resolution failed: {e}")), None),
        };

        let fut = registered.call(job.record().pos_args(), job.record().kwargs());
        let handle = tokio::spawn(fut);
        let isolated = async move {
            match handle.await {
                Ok(result) => result,
                Err(join_error) => Err(format!("user function panicked: {join_error}")),
            }
        };

        if self.should_profile() {
            let profiler = WallClockProfiler::new(registered.site().clone());
            let (result, stats) = profiler.profile(isolated).await;
            (result, Some(stats))
        } else {
            (isolated.await, None)
        }
    }

    fn resolve(
        &mut self,
        entry_point: &str,
        target_function: &str,
    ) -> std::result::Result<Arc<RegisteredJob>, RegistryError> {
        let key = (entry_point.to_string(), target_function.to_string());
        if let Some(job) = self.resolution_cache.get(&key) {
            return Ok(job.clone());
        }

        let job = self.registry.resolve(entry_point, target_function)?;
        self.resolution_cache.insert(key, job.clone());
        Ok(job)
    }

    fn should_profile(&self) -> bool {
        self.profile_rate > 0.0 && rand::thread_rng().gen::<f64>() < self.profile_rate
    }

    async fn release_success(
        &self,
        job_id: Uuid,
        posting_id: Uuid,
        stats: Option<CallGraphStats>,
    ) -> Result<()> {
        if let Some(stats) = stats {
            match self
                .commit_success_with_profile(job_id, posting_id, &stats)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    // The outcome must survive even when the profile write
                    // does not.
                    warn!(job_id = %job_id, error = ?e, "Profile persistence failed, skipping profile");
                }
            }
        }

        let mut tx = self.pg_pool.begin().await?;
        complete_job(tx.as_mut(), &self.escaped_schema, job_id).await?;
        sync_posting_status(tx.as_mut(), &self.escaped_schema, posting_id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn commit_success_with_profile(
        &self,
        job_id: Uuid,
        posting_id: Uuid,
        stats: &CallGraphStats,
    ) -> Result<()> {
        let mut tx = self.pg_pool.begin().await?;
        complete_job(tx.as_mut(), &self.escaped_schema, job_id).await?;
        persist_profile(&mut tx, &self.escaped_schema, job_id, stats).await?;
        sync_posting_status(tx.as_mut(), &self.escaped_schema, posting_id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn release_failure(&mut self, job: &ClaimedJob, message: &str) -> Result<()> {
        let job_id = *job.record().id();
        let posting_id = *job.record().posting_id();

        let mut tx = self.pg_pool.begin().await?;
        let updated = fail_job(tx.as_mut(), &self.escaped_schema, job_id).await?;
        sync_posting_status(tx.as_mut(), &self.escaped_schema, posting_id).await?;
        tx.commit().await?;

        self.log_user_failure(job, message, updated.tries_remaining());

        let budget = self.failure_cache.record_failure(posting_id, job_id);
        if budget == 0 {
            warn!(
                posting_id = %posting_id,
                worker_id = %self.worker_id,
                "Posting exhausted this worker's failure budget, blacklisting locally"
            );
        }

        Ok(())
    }

    fn log_user_failure(&self, job: &ClaimedJob, message: &str, tries_remaining: &i32) {
        let job_id = job.record().id();
        let target_function = job.target_function();

        if *tries_remaining == 0 {
            warn!(job_id = %job_id, target_function, message, "Unit failed with no tries left");
            return;
        }

        match self.exception_logging {
            ExceptionLogging::None => {}
            ExceptionLogging::Debug => {
                debug!(job_id = %job_id, target_function, message, tries_remaining, "Unit failed")
            }
            ExceptionLogging::Info => {
                info!(job_id = %job_id, target_function, message, tries_remaining, "Unit failed")
            }
            ExceptionLogging::Warn => {
                warn!(job_id = %job_id, target_function, message, tries_remaining, "Unit failed")
            }
            ExceptionLogging::Error => {
                error!(job_id = %job_id, target_function, message, tries_remaining, "Unit failed")
            }
        }
    }

    async fn release_bad(&self, job_id: Uuid, posting_id: Uuid) -> Result<()> {
        let mut tx = self.pg_pool.begin().await?;
        mark_job_bad(tx.as_mut(), &self.escaped_schema, job_id).await?;
        sync_posting_status(tx.as_mut(), &self.escaped_schema, posting_id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn release_unprocessed(&self, jobs: Vec<ClaimedJob>) {
        for job in &jobs {
            let job_id = *job.record().id();
            if let Err(e) = return_job(&self.pg_pool, &self.escaped_schema, job_id).await {
                error!(job_id = %job_id, error = ?e, "Failed to return claimed unit on shutdown");
            }
        }
        if !jobs.is_empty() {
            info!(
                worker_id = %self.worker_id,
                returned = jobs.len(),
                "Returned unprocessed units to the queue"
            );
        }
    }

    /// Drops failure-cache entries for postings that reached a terminal
    /// status since this worker last looked.
    async fn purge_settled_postings(&mut self) {
        let tracked = self.failure_cache.tracked_postings();
        if tracked.is_empty() {
            return;
        }

        match posting_snapshots(&self.pg_pool, &self.escaped_schema, &tracked).await {
            Ok(snapshots) => {
                for snapshot in snapshots {
                    if snapshot.status().is_terminal() {
                        self.failure_cache.purge(snapshot.id());
                    }
                }
            }
            Err(e) => {
                debug!(error = ?e, "Could not refresh failure-cache postings");
            }
        }
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown_signal.clone().now_or_never().is_some()
    }

    async fn sleep_or_shutdown(&self, duration: Duration) {
        let shutdown = self.shutdown_signal.clone();
        tokio::select! {
            _ = sleep(duration) => (),
            _ = shutdown => (),
        }
    }
}

fn with_jitter(duration: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..=MAX_JITTER_MS);
    duration + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_logging_parses_aliases() {
        assert_eq!(
            "warning".parse::<ExceptionLogging>().unwrap(),
            ExceptionLogging::Warn
        );
        assert_eq!(
            "NONE".parse::<ExceptionLogging>().unwrap(),
            ExceptionLogging::None
        );
        assert!("verbose".parse::<ExceptionLogging>().is_err());
    }

    #[test]
    fn jitter_stays_bounded() {
        let base = Duration::from_secs(1);
        for _ in 0..32 {
            let jittered = with_jitter(base);
            assert!(jittered >= base);
            assert!(jittered <= base + Duration::from_millis(MAX_JITTER_MS));
        }
    }
}
