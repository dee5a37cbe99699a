use std::time::Duration;

use futures::Stream;
use pdoflow_migrations::migrate;
use pdoflow_registry::{JobRegistry, RegisteredJob};
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::errors::{PdoflowError, Result};
use crate::observer;
use crate::sql::claim_batch::claim_job_by_id;
use crate::sql::job_record::{get_job_record, JobRecord};
use crate::sql::posting::{
    count_jobs_with_status, delete_posting, get_posting, list_posting_snapshots, post_work,
    posting_snapshot, posting_snapshots, priority_stats, set_posting_status, PostedWork, Posting,
    PostingSnapshot, PriorityBand, WorkUnit,
};
use crate::sql::release_job::{complete_job, fail_job, sync_posting_status};
use crate::status::Status;
use crate::utils::escape_identifier;

/// Producer- and operator-facing operations against the queue.
///
/// This is the programmatic surface the CLI wraps: posting work, inspecting
/// and steering postings, and the observer sequences. Bound to one pool and
/// one schema.
pub struct PdoflowUtils {
    pg_pool: PgPool,
    escaped_schema: String,
}

impl PdoflowUtils {
    pub async fn new(pg_pool: PgPool, schema: &str) -> Result<Self> {
        let escaped_schema = escape_identifier(&pg_pool, schema).await?;
        Ok(Self {
            pg_pool,
            escaped_schema,
        })
    }

    pub fn pg_pool(&self) -> &PgPool {
        &self.pg_pool
    }

    pub fn escaped_schema(&self) -> &str {
        &self.escaped_schema
    }

    /// Brings the schema up to the newest embedded revision.
    pub async fn migrate(&self) -> Result<()> {
        migrate(&self.pg_pool, &self.escaped_schema).await?;
        Ok(())
    }

    /// Materializes a posting with its work units; returns the new ids.
    /// The poster is recorded from `$USER` when available.
    pub async fn post_work(
        &self,
        entry_point: &str,
        target_function: &str,
        units: Vec<WorkUnit>,
    ) -> Result<PostedWork> {
        let poster = std::env::var("USER").ok();
        post_work(
            &self.pg_pool,
            &self.escaped_schema,
            poster.as_deref(),
            entry_point,
            target_function,
            units,
        )
        .await
    }

    /// Posts work against an already-registered callable.
    pub async fn post_registered(
        &self,
        job: &RegisteredJob,
        units: Vec<WorkUnit>,
    ) -> Result<PostedWork> {
        self.post_work(job.entry_point(), job.target_function(), units)
            .await
    }

    pub async fn posting(&self, posting_id: Uuid) -> Result<Posting> {
        get_posting(&self.pg_pool, &self.escaped_schema, posting_id)
            .await?
            .ok_or(PdoflowError::PostingNotFound(posting_id))
    }

    pub async fn posting_snapshot(&self, posting_id: Uuid) -> Result<PostingSnapshot> {
        posting_snapshot(&self.pg_pool, &self.escaped_schema, posting_id)
            .await?
            .ok_or(PdoflowError::PostingNotFound(posting_id))
    }

    pub async fn posting_snapshots(&self, posting_ids: &[Uuid]) -> Result<Vec<PostingSnapshot>> {
        posting_snapshots(&self.pg_pool, &self.escaped_schema, posting_ids).await
    }

    pub async fn list_postings(&self) -> Result<Vec<PostingSnapshot>> {
        list_posting_snapshots(&self.pg_pool, &self.escaped_schema).await
    }

    /// Administrative status transition.
    pub async fn set_posting_status(&self, posting_id: Uuid, status: Status) -> Result<()> {
        let updated =
            set_posting_status(&self.pg_pool, &self.escaped_schema, posting_id, status).await?;
        if updated == 0 {
            return Err(PdoflowError::PostingNotFound(posting_id));
        }
        Ok(())
    }

    /// Workers stop claiming a cancelled posting's units but finish any unit
    /// already mid-execution.
    pub async fn cancel_posting(&self, posting_id: Uuid) -> Result<()> {
        self.set_posting_status(posting_id, Status::Cancelled).await
    }

    /// Removes the posting; its units and their profiles cascade away.
    pub async fn delete_posting(&self, posting_id: Uuid) -> Result<()> {
        let deleted = delete_posting(&self.pg_pool, &self.escaped_schema, posting_id).await?;
        if deleted == 0 {
            return Err(PdoflowError::PostingNotFound(posting_id));
        }
        Ok(())
    }

    pub async fn priority_stats(&self) -> Result<Vec<PriorityBand>> {
        priority_stats(&self.pg_pool, &self.escaped_schema).await
    }

    pub async fn count_jobs(&self, posting_id: Uuid, status: Status) -> Result<i64> {
        count_jobs_with_status(&self.pg_pool, &self.escaped_schema, posting_id, status).await
    }

    pub async fn job_record(&self, job_id: Uuid) -> Result<JobRecord> {
        get_job_record(&self.pg_pool, &self.escaped_schema, job_id)
            .await?
            .ok_or(PdoflowError::JobNotFound(job_id))
    }

    /// Runs one unit in-process for debugging, recording its outcome exactly
    /// as a worker would. The outer `Result` carries infrastructure errors;
    /// the inner one is the user function's own outcome.
    pub async fn execute_job(
        &self,
        registry: &JobRegistry,
        job_id: Uuid,
    ) -> Result<std::result::Result<(), String>> {
        let record = self.job_record(job_id).await?;
        let posting = self.posting(*record.posting_id()).await?;
        let registered = registry.resolve(posting.entry_point(), posting.target_function())?;

        claim_job_by_id(&self.pg_pool, &self.escaped_schema, job_id).await?;

        let outcome = registered.call(record.pos_args(), record.kwargs()).await;

        let mut tx = self.pg_pool.begin().await?;
        match &outcome {
            Ok(()) => {
                complete_job(tx.as_mut(), &self.escaped_schema, job_id).await?;
            }
            Err(_) => {
                fail_job(tx.as_mut(), &self.escaped_schema, job_id).await?;
            }
        }
        sync_posting_status(tx.as_mut(), &self.escaped_schema, *record.posting_id()).await?;
        tx.commit().await?;

        info!(job_id = %job_id, ok = outcome.is_ok(), "Executed unit in-process");
        Ok(outcome)
    }

    pub async fn poll_posting(
        &self,
        posting_id: Uuid,
    ) -> Result<impl Stream<Item = PostingSnapshot>> {
        observer::poll_posting(self.pg_pool.clone(), self.escaped_schema.clone(), posting_id).await
    }

    pub async fn poll_posting_percent(
        &self,
        posting_id: Uuid,
    ) -> Result<impl Stream<Item = f64>> {
        observer::poll_posting_percent(
            self.pg_pool.clone(),
            self.escaped_schema.clone(),
            posting_id,
        )
        .await
    }

    pub async fn poll_job_status_count(
        &self,
        posting_id: Uuid,
        status: Status,
    ) -> Result<impl Stream<Item = i64>> {
        observer::poll_job_status_count(
            self.pg_pool.clone(),
            self.escaped_schema.clone(),
            posting_id,
            status,
        )
        .await
    }

    pub async fn await_for_status_threshold<P>(
        &self,
        posting_id: Uuid,
        status: Status,
        predicate: P,
        poll_time: Duration,
        max_wait: Option<Duration>,
    ) -> Result<i64>
    where
        P: Fn(i64) -> bool,
    {
        observer::await_for_status_threshold(
            &self.pg_pool,
            &self.escaped_schema,
            posting_id,
            status,
            predicate,
            poll_time,
            max_wait,
        )
        .await
    }

    pub async fn await_posting_completion(
        &self,
        posting_id: Uuid,
        poll_time: Duration,
        max_wait: Option<Duration>,
    ) -> Result<PostingSnapshot> {
        observer::await_posting_completion(
            &self.pg_pool,
            &self.escaped_schema,
            posting_id,
            poll_time,
            max_wait,
        )
        .await
    }
}
