use chrono::{DateTime, Utc};
use getset::Getters;
use serde_json::{Map, Value};
use sqlx::{query_as, FromRow, PgExecutor};
use uuid::Uuid;

use crate::errors::Result;
use crate::status::Status;

/// A single work unit as stored in the database.
#[derive(FromRow, Getters, Debug, Clone)]
#[getset(get = "pub")]
pub struct JobRecord {
    id: Uuid,
    posting_id: Uuid,
    /// Higher runs sooner
    priority: i32,
    positional_arguments: Value,
    keyword_arguments: Option<Value>,
    tries_remaining: i32,
    status: Status,
    /// Set on completion: true for success, false for errored_out
    exited_ok: Option<bool>,
    work_started_on: Option<DateTime<Utc>>,
    completed_on: Option<DateTime<Utc>>,
    created_on: DateTime<Utc>,
    updated_on: DateTime<Utc>,
}

impl JobRecord {
    /// Positional arguments as the sequence the user function receives.
    pub fn pos_args(&self) -> Vec<Value> {
        match &self.positional_arguments {
            Value::Array(values) => values.clone(),
            other => vec![other.clone()],
        }
    }

    /// Keyword arguments, empty when none were posted.
    pub fn kwargs(&self) -> Map<String, Value> {
        match &self.keyword_arguments {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        }
    }
}

/// A posting's units in dispatch order, for status displays.
pub async fn list_job_records<'e>(
    executor: impl PgExecutor<'e>,
    escaped_schema: &str,
    posting_id: Uuid,
) -> Result<Vec<JobRecord>> {
    let sql = format!(
        r#"
            select * from {escaped_schema}.job_records
                where posting_id = $1::uuid
                order by priority desc, created_on asc, id asc
        "#
    );

    let records = query_as(&sql)
        .bind(posting_id)
        .fetch_all(executor)
        .await?;
    Ok(records)
}

pub async fn get_job_record<'e>(
    executor: impl PgExecutor<'e>,
    escaped_schema: &str,
    job_id: Uuid,
) -> Result<Option<JobRecord>> {
    let sql = format!(
        r#"
            select * from {escaped_schema}.job_records
                where id = $1::uuid
        "#
    );

    let record = query_as(&sql).bind(job_id).fetch_optional(executor).await?;
    Ok(record)
}
