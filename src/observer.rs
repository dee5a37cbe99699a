//! Lazy polling sequences over posting aggregates.
//!
//! Every observation is one short SELECT; no locks or transactions are held
//! between yields, so these streams are safe to drive at whatever cadence a
//! progress UI wants. Callers control pacing by sleeping between pulls.

use std::time::Duration;

use futures::{stream, Stream};
use sqlx::PgPool;
use tokio::time::{sleep, Instant};
use tracing::error;
use uuid::Uuid;

use crate::errors::{PdoflowError, Result};
use crate::sql::posting::{count_jobs_with_status, posting_snapshot, PostingSnapshot};
use crate::status::Status;

struct PollState {
    pg_pool: PgPool,
    escaped_schema: String,
    posting_id: Uuid,
    pending: Option<PostingSnapshot>,
    finished: bool,
}

impl PollState {
    fn new(
        pg_pool: PgPool,
        escaped_schema: String,
        posting_id: Uuid,
        first: PostingSnapshot,
    ) -> Self {
        Self {
            pg_pool,
            escaped_schema,
            posting_id,
            pending: Some(first),
            finished: false,
        }
    }

    /// The snapshot to yield next: the eagerly fetched one on the first
    /// pull, a fresh SELECT afterwards. `None` ends the stream (posting
    /// deleted mid-watch, or the database went away).
    async fn next_snapshot(&mut self) -> Option<PostingSnapshot> {
        if let Some(first) = self.pending.take() {
            return Some(first);
        }

        match posting_snapshot(&self.pg_pool, &self.escaped_schema, self.posting_id).await {
            Ok(Some(snapshot)) => Some(snapshot),
            Ok(None) => None,
            Err(e) => {
                error!(posting_id = %self.posting_id, error = ?e, "Observer query failed");
                None
            }
        }
    }
}

/// Successive snapshots of a posting, ending once it reaches a terminal
/// status. Fails with `PostingNotFound` if the id is unknown at first read.
pub async fn poll_posting(
    pg_pool: PgPool,
    escaped_schema: String,
    posting_id: Uuid,
) -> Result<impl Stream<Item = PostingSnapshot>> {
    let first = posting_snapshot(&pg_pool, &escaped_schema, posting_id)
        .await?
        .ok_or(PdoflowError::PostingNotFound(posting_id))?;

    let state = PollState::new(pg_pool, escaped_schema, posting_id, first);
    Ok(stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }

        let snapshot = state.next_snapshot().await?;
        if snapshot.status().is_terminal() {
            state.finished = true;
        }
        Some((snapshot, state))
    }))
}

/// Successive completion percentages in `[0.0, 100.0]`, non-decreasing,
/// ending once 100.0 has been yielded. An empty posting yields 100.0 exactly
/// once. Fails with `PostingNotFound` if the id is unknown at first read.
pub async fn poll_posting_percent(
    pg_pool: PgPool,
    escaped_schema: String,
    posting_id: Uuid,
) -> Result<impl Stream<Item = f64>> {
    let first = posting_snapshot(&pg_pool, &escaped_schema, posting_id)
        .await?
        .ok_or(PdoflowError::PostingNotFound(posting_id))?;

    let state = PollState::new(pg_pool, escaped_schema, posting_id, first);
    Ok(stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }

        let snapshot = state.next_snapshot().await?;
        let percent = snapshot.percent_done();
        if percent >= 100.0 {
            state.finished = true;
        }
        Some((percent, state))
    }))
}

/// The count of the posting's units in the given status, forever; the
/// caller decides when to stop pulling. Fails with `PostingNotFound` if the
/// id is unknown at first read.
pub async fn poll_job_status_count(
    pg_pool: PgPool,
    escaped_schema: String,
    posting_id: Uuid,
    status: Status,
) -> Result<impl Stream<Item = i64>> {
    posting_snapshot(&pg_pool, &escaped_schema, posting_id)
        .await?
        .ok_or(PdoflowError::PostingNotFound(posting_id))?;

    Ok(stream::unfold(
        (pg_pool, escaped_schema, posting_id, status),
        |(pg_pool, escaped_schema, posting_id, status)| async move {
            let count =
                match count_jobs_with_status(&pg_pool, &escaped_schema, posting_id, status).await {
                    Ok(count) => count,
                    Err(e) => {
                        error!(posting_id = %posting_id, error = ?e, "Observer query failed");
                        return None;
                    }
                };
            Some((count, (pg_pool, escaped_schema, posting_id, status)))
        },
    ))
}

/// Blocks (with polling) until `predicate(count)` holds for the count of
/// units in the given status; returns the satisfying count. Honors
/// `max_wait` as a wall-clock deadline.
pub async fn await_for_status_threshold<P>(
    pg_pool: &PgPool,
    escaped_schema: &str,
    posting_id: Uuid,
    status: Status,
    predicate: P,
    poll_time: Duration,
    max_wait: Option<Duration>,
) -> Result<i64>
where
    P: Fn(i64) -> bool,
{
    posting_snapshot(pg_pool, escaped_schema, posting_id)
        .await?
        .ok_or(PdoflowError::PostingNotFound(posting_id))?;

    let started = Instant::now();
    loop {
        let count = count_jobs_with_status(pg_pool, escaped_schema, posting_id, status).await?;
        if predicate(count) {
            return Ok(count);
        }

        if let Some(max_wait) = max_wait {
            if started.elapsed() > max_wait {
                return Err(PdoflowError::Timeout(max_wait));
            }
        }

        sleep(poll_time).await;
    }
}

/// Blocks until the posting settles (terminal status or full completion) or
/// `max_wait` elapses.
pub async fn await_posting_completion(
    pg_pool: &PgPool,
    escaped_schema: &str,
    posting_id: Uuid,
    poll_time: Duration,
    max_wait: Option<Duration>,
) -> Result<PostingSnapshot> {
    let started = Instant::now();

    loop {
        let snapshot = posting_snapshot(pg_pool, escaped_schema, posting_id)
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
