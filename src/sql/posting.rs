use chrono::{DateTime, Utc};
use getset::Getters;
use indoc::formatdoc;
use serde_json::{Map, Value};
use sqlx::{query, query_as, query_scalar, FromRow, PgExecutor, PgPool, QueryBuilder};
use tracing::info;
use uuid::Uuid;

use crate::errors::Result;
use crate::status::Status;

/// Rows are inserted in chunks to stay well under the bind-parameter cap.
const INSERT_CHUNK: usize = 1000;

/// A named batch of work as stored in the database.
#[derive(FromRow, Getters, Debug, Clone)]
#[getset(get = "pub")]
pub struct Posting {
    id: Uuid,
    poster: Option<String>,
    target_function: String,
    entry_point: String,
    status: Status,
    created_on: DateTime<Utc>,
}

/// A posting plus its per-unit progress aggregates, produced by one SELECT.
#[derive(FromRow, Getters, Debug, Clone)]
#[getset(get = "pub")]
pub struct PostingSnapshot {
    id: Uuid,
    status: Status,
    created_on: DateTime<Utc>,
    total_jobs: i64,
    /// Units in a terminal status (done, errored_out or cancelled)
    jobs_settled: i64,
}

impl PostingSnapshot {
    /// Completion percentage in `[0.0, 100.0]`. A posting with no units
    /// counts as fully complete.
    pub fn percent_done(&self) -> f64 {
        if self.total_jobs == 0 {
            return 100.0;
        }
        (self.jobs_settled as f64 / self.total_jobs as f64) * 100.0
    }
}

/// One work unit to be posted.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub positional_arguments: Vec<Value>,
    pub keyword_arguments: Map<String, Value>,
    pub priority: i32,
    pub tries_remaining: i32,
}

impl WorkUnit {
    pub fn new(positional_arguments: Vec<Value>) -> Self {
        Self {
            positional_arguments,
            keyword_arguments: Map::new(),
            priority: 0,
            tries_remaining: 3,
        }
    }

    pub fn kwargs(mut self, keyword_arguments: Map<String, Value>) -> Self {
        self.keyword_arguments = keyword_arguments;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn tries(mut self, tries_remaining: i32) -> Self {
        self.tries_remaining = tries_remaining;
        self
    }
}

/// Identifiers handed back to the producer after a successful post.
#[derive(Debug, Clone)]
pub struct PostedWork {
    pub posting_id: Uuid,
    pub job_ids: Vec<Uuid>,
}

/// Materializes a posting and its work units in one transaction.
///
/// The posting is created in `executing` so workers may claim its units
/// immediately; pause it afterwards to stage work instead.
pub async fn post_work(
    pool: &PgPool,
    escaped_schema: &str,
    poster: Option<&str>,
    entry_point: &str,
    target_function: &str,
    units: Vec<WorkUnit>,
) -> Result<PostedWork> {
    let mut tx = pool.begin().await?;

    let posting_sql = formatdoc!(
        r#"
            insert into {escaped_schema}.job_postings
                (poster, target_function, entry_point, status)
                values ($1, $2, $3, 'executing')
                returning id
        "#
    );
    let posting_id: Uuid = query_scalar(&posting_sql)
        .bind(poster)
        .bind(target_function)
        .bind(entry_point)
        .fetch_one(tx.as_mut())
        .await?;

    let mut job_ids = Vec::with_capacity(units.len());
    for chunk in units.chunks(INSERT_CHUNK) {
        let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(format!(
            "insert into {escaped_schema}.job_records \
             (posting_id, priority, positional_arguments, keyword_arguments, tries_remaining) "
        ));
        builder.push_values(chunk, |mut row, unit| {
            let kwargs = if unit.keyword_arguments.is_empty() {
                None
            } else {
                Some(Value::Object(unit.keyword_arguments.clone()))
            };
            row.push_bind(posting_id)
                .push_bind(unit.priority)
                .push_bind(Value::Array(unit.positional_arguments.clone()))
                .push_bind(kwargs)
                .push_bind(unit.tries_remaining);
        });
        builder.push(" returning id");

        let ids: Vec<Uuid> = builder
            .build_query_scalar()
            .fetch_all(tx.as_mut())
            .await?;
        job_ids.extend(ids);
    }

    tx.commit().await?;

    info!(
        posting_id = %posting_id,
        entry_point,
        target_function,
        units = job_ids.len(),
        "Posted work"
    );

    Ok(PostedWork {
        posting_id,
        job_ids,
    })
}

pub async fn get_posting<'e>(
    executor: impl PgExecutor<'e>,
    escaped_schema: &str,
    posting_id: Uuid,
) -> Result<Option<Posting>> {
    let sql = format!(
        r#"
            select * from {escaped_schema}.job_postings
                where id = $1::uuid
        "#
    );

    let posting = query_as(&sql)
        .bind(posting_id)
        .fetch_optional(executor)
        .await?;
    Ok(posting)
}

fn snapshot_sql(escaped_schema: &str, where_clause: &str) -> String {
    formatdoc!(
        r#"
            select
                postings.id,
                postings.status,
                postings.created_on,
                count(records.id) as total_jobs,
                count(records.id) filter (
                    where records.status in ('done', 'errored_out', 'cancelled')
                ) as jobs_settled
            from {escaped_schema}.job_postings as postings
            left join {escaped_schema}.job_records as records
                on records.posting_id = postings.id
            {where_clause}
            group by postings.id
            order by postings.created_on asc
        "#
    )
}

pub async fn posting_snapshot<'e>(
    executor: impl PgExecutor<'e>,
    escaped_schema: &str,
    posting_id: Uuid,
) -> Result<Option<PostingSnapshot>> {
    let sql = snapshot_sql(escaped_schema, "where postings.id = $1::uuid");
    let snapshot = query_as(&sql)
        .bind(posting_id)
        .fetch_optional(executor)
        .await?;
    Ok(snapshot)
}

pub async fn posting_snapshots<'e>(
    executor: impl PgExecutor<'e>,
    escaped_schema: &str,
    posting_ids: &[Uuid],
) -> Result<Vec<PostingSnapshot>> {
    let sql = snapshot_sql(escaped_schema, "where postings.id = any($1::uuid[])");
    let snapshots = query_as(&sql)
        .bind(posting_ids)
        .fetch_all(executor)
        .await?;
    Ok(snapshots)
}

pub async fn list_posting_snapshots<'e>(
    executor: impl PgExecutor<'e>,
    escaped_schema: &str,
) -> Result<Vec<PostingSnapshot>> {
    let sql = snapshot_sql(escaped_schema, "");
    let snapshots = query_as(&sql).fetch_all(executor).await?;
    Ok(snapshots)
}

/// Administrative status transition; returns the number of rows updated so
/// callers can distinguish an unknown id.
pub async fn set_posting_status<'e>(
    executor: impl PgExecutor<'e>,
    escaped_schema: &str,
    posting_id: Uuid,
    status: Status,
) -> Result<u64> {
    let sql = format!(
        r#"
            update {escaped_schema}.job_postings
                set status = $2
                where id = $1::uuid
        "#
    );

    let result = query(&sql)
        .bind(posting_id)
        .bind(status)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

pub async fn count_jobs_with_status<'e>(
    executor: impl PgExecutor<'e>,
    escaped_schema: &str,
    posting_id: Uuid,
    status: Status,
) -> Result<i64> {
    let sql = format!(
        r#"
            select count(*) from {escaped_schema}.job_records
                where posting_id = $1::uuid and status = $2
        "#
    );

    let count = query_scalar(&sql)
        .bind(posting_id)
        .bind(status)
        .fetch_one(executor)
        .await?;
    Ok(count)
}

/// Distribution of waiting work by priority band.
#[derive(FromRow, Getters, Debug, Clone)]
#[getset(get = "pub")]
pub struct PriorityBand {
    priority: i32,
    waiting: i64,
    oldest: DateTime<Utc>,
}

pub async fn priority_stats<'e>(
    executor: impl PgExecutor<'e>,
    escaped_schema: &str,
) -> Result<Vec<PriorityBand>> {
    let sql = formatdoc!(
        r#"
            select
                records.priority,
                count(records.id) as waiting,
                min(records.created_on) as oldest
            from {escaped_schema}.job_records as records
            where records.status = 'waiting'
            and records.tries_remaining > 0
            group by records.priority
            order by records.priority desc
        "#
    );

    let bands = query_as(&sql).fetch_all(executor).await?;
    Ok(bands)
}

/// Deletes a posting; owned job records and their profiles cascade.
pub async fn delete_posting<'e>(
    executor: impl PgExecutor<'e>,
    escaped_schema: &str,
    posting_id: Uuid,
) -> Result<u64> {
    let sql = format!(
        r#"
            delete from {escaped_schema}.job_postings
                where id = $1::uuid
        "#
    );

    let result = query(&sql).bind(posting_id).execute(executor).await?;
    Ok(result.rows_affected())
}
