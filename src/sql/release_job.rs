use indoc::formatdoc;
use sqlx::{query, query_as, PgExecutor};
use uuid::Uuid;

use crate::errors::{PdoflowError, Result};
use crate::sql::job_record::JobRecord;

/// Records a successful execution: the unit becomes `done` terminally.
pub async fn complete_job<'e>(
    executor: impl PgExecutor<'e>,
    escaped_schema: &str,
    job_id: Uuid,
) -> Result<()> {
    let sql = formatdoc!(
        r#"
            update {escaped_schema}.job_records as records
                set
                    status = 'done',
                    exited_ok = true,
                    completed_on = now(),
                    updated_on = now()
                where records.id = $1::uuid
        "#
    );

    query(&sql).bind(job_id).execute(executor).await?;
    Ok(())
}

/// Records a failed execution.
///
/// One try is consumed; with tries left the unit returns to `waiting` and
/// becomes eligible for re-dispatch (possibly by another worker), otherwise
/// it settles as `errored_out`. Returns the post-update row so the caller
/// can observe which branch was taken.
pub async fn fail_job<'e>(
    executor: impl PgExecutor<'e>,
    escaped_schema: &str,
    job_id: Uuid,
) -> Result<JobRecord> {
    let sql = formatdoc!(
        r#"
            update {escaped_schema}.job_records as records
                set
                    tries_remaining = records.tries_remaining - 1,
                    status = case
                        when records.tries_remaining > 1 then 'waiting'
                        else 'errored_out'
                    end,
                    exited_ok = case
                        when records.tries_remaining > 1 then null
                        else false
                    end,
                    work_started_on = case
                        when records.tries_remaining > 1 then null
                        else records.work_started_on
                    end,
                    completed_on = case
                        when records.tries_remaining > 1 then null
                        else now()
                    end,
                    updated_on = now()
                where records.id = $1::uuid
                and records.tries_remaining > 0
                returning records.*
        "#
    );

    let record = query_as(&sql)
        .bind(job_id)
        .fetch_optional(executor)
        .await?;
    record.ok_or(PdoflowError::JobNotFound(job_id))
}

/// Terminal administrative failure: no tries left, `errored_out` now.
pub async fn mark_job_bad<'e>(
    executor: impl PgExecutor<'e>,
    escaped_schema: &str,
    job_id: Uuid,
) -> Result<()> {
    let sql = formatdoc!(
        r#"
            update {escaped_schema}.job_records as records
                set
                    status = 'errored_out',
                    tries_remaining = 0,
                    exited_ok = false,
                    completed_on = now(),
                    updated_on = now()
                where records.id = $1::uuid
        "#
    );

    query(&sql).bind(job_id).execute(executor).await?;
    Ok(())
}

/// Hands a claimed-but-unexecuted unit back to the queue; used when a worker
/// drains a partially processed batch during shutdown.
pub async fn return_job<'e>(
    executor: impl PgExecutor<'e>,
    escaped_schema: &str,
    job_id: Uuid,
) -> Result<()> {
    let sql = formatdoc!(
        r#"
            update {escaped_schema}.job_records as records
                set
                    status = 'waiting',
                    work_started_on = null,
                    updated_on = now()
                where records.id = $1::uuid
                and records.status = 'executing'
        "#
    );

    query(&sql).bind(job_id).execute(executor).await?;
    Ok(())
}

/// Recomputes a posting's derived status after unit outcomes were written.
///
/// While any unit remains waiting/executing/paused the posting is left
/// alone. Once everything settled: any errored_out unit makes the posting
/// errored_out, otherwise it is done. Administratively paused or cancelled
/// postings are never touched.
pub async fn sync_posting_status<'e>(
    executor: impl PgExecutor<'e>,
    escaped_schema: &str,
    posting_id: Uuid,
) -> Result<()> {
    let sql = formatdoc!(
        r#"
            update {escaped_schema}.job_postings as postings
                set status = summary.next_status
                from (
                    select
                        case
                            when count(*) filter (
                                where records.status in ('waiting', 'executing', 'paused')
                            ) > 0 then null
                            when count(*) filter (
                                where records.status = 'errored_out'
                            ) > 0 then 'errored_out'
                            else 'done'
                        end as next_status
                    from {escaped_schema}.job_records as records
                    where records.posting_id = $1::uuid
                ) as summary
                where postings.id = $1::uuid
                and postings.status in ('waiting', 'executing')
                and summary.next_status is not null
        "#
    );

    query(&sql).bind(posting_id).execute(executor).await?;
    Ok(())
}
