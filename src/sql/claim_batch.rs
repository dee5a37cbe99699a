use getset::Getters;
use indoc::formatdoc;
use sqlx::{query, query_as, FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::errors::Result;
use crate::sql::job_record::JobRecord;

/// A claimed work unit joined with the resolution address of its posting,
/// so the worker never refetches the posting row per unit.
#[derive(FromRow, Getters, Debug, Clone)]
#[getset(get = "pub")]
pub struct ClaimedJob {
    #[sqlx(flatten)]
    record: JobRecord,
    entry_point: String,
    target_function: String,
}

fn get_skip_clause(skip_postings: &[Uuid], param_ord: u8) -> String {
    if !skip_postings.is_empty() {
        return format!("and records.posting_id <> all(${param_ord}::uuid[])");
    }
    String::new()
}

/// Claims up to `batch_size` waiting units inside the given transaction.
///
/// One statement selects claimable rows in dispatch order (priority desc,
/// created_on asc, id asc) under `for update skip locked` and flips them to
/// `executing`; concurrent claimers partition the queue without waiting on
/// each other. A second statement promotes owning postings still `waiting`
/// to `executing`.
///
/// Units of postings in `paused` or `cancelled` are never selected, nor are
/// units whose posting id appears in `skip_postings` (the claimer's local
/// blacklist).
pub async fn claim_batch_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    escaped_schema: &str,
    batch_size: i64,
    skip_postings: &[Uuid],
) -> Result<Vec<ClaimedJob>> {
    let skip_clause = get_skip_clause(skip_postings, 2);

    let sql = formatdoc!(
        r#"
            with claimable as (
                select records.id
                    from {escaped_schema}.job_records as records
                    join {escaped_schema}.job_postings as postings
                        on postings.id = records.posting_id
                    where records.status = 'waiting'
                    and records.tries_remaining > 0
                    and postings.status in ('waiting', 'executing')
                    {skip_clause}
                    order by records.priority desc, records.created_on asc, records.id asc
                    limit $1
                    for update of records skip locked
            ), claimed as (
                update {escaped_schema}.job_records as records
                    set
                        status = 'executing',
                        work_started_on = now(),
                        updated_on = now()
                    from claimable
                    where records.id = claimable.id
                    returning records.*
            )
            select claimed.*, postings.entry_point, postings.target_function
                from claimed
                join {escaped_schema}.job_postings as postings
                    on postings.id = claimed.posting_id
        "#
    );

    let mut q = query_as(&sql).bind(batch_size);
    if !skip_postings.is_empty() {
        q = q.bind(skip_postings);
    }

    let mut jobs: Vec<ClaimedJob> = q.fetch_all(tx.as_mut()).await?;

    // `update ... returning` does not preserve the CTE's ordering; restore
    // dispatch order before handing the batch to the runtime.
    jobs.sort_by(|a, b| {
        b.record()
            .priority()
            .cmp(a.record().priority())
            .then_with(|| a.record().created_on().cmp(b.record().created_on()))
            .then_with(|| a.record().id().cmp(b.record().id()))
    });

    if !jobs.is_empty() {
        let posting_ids: Vec<Uuid> = {
            let mut ids: Vec<Uuid> = jobs.iter().map(|j| *j.record().posting_id()).collect();
            ids.sort_unstable();
            ids.dedup();
            ids
        };

        let promote_sql = formatdoc!(
            r#"
                update {escaped_schema}.job_postings as postings
                    set status = 'executing'
                    where postings.status = 'waiting'
                    and postings.id = any($1::uuid[])
            "#
        );
        query(&promote_sql)
            .bind(&posting_ids)
            .execute(tx.as_mut())
            .await?;
    }

    Ok(jobs)
}

/// Forcibly claims one unit by id, regardless of queue order or posting
/// state. Debugging path: lets an operator run a single unit in-process.
pub async fn claim_job_by_id<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    escaped_schema: &str,
    job_id: Uuid,
) -> Result<bool> {
    let sql = formatdoc!(
        r#"
            update {escaped_schema}.job_records as records
                set
                    status = 'executing',
                    work_started_on = now(),
                    updated_on = now()
                where records.id = $1::uuid
        "#
    );

    let result = query(&sql).bind(job_id).execute(executor).await?;
    Ok(result.rows_affected() > 0)
}

/// Claims a batch in its own transaction and commits it. The returned units
/// are `executing` and owned by the caller until released.
pub async fn claim_batch(
    pool: &PgPool,
    escaped_schema: &str,
    batch_size: i64,
    skip_postings: &[Uuid],
) -> Result<Vec<ClaimedJob>> {
    let mut tx = pool.begin().await?;
    let jobs = claim_batch_in_tx(&mut tx, escaped_schema, batch_size, skip_postings).await?;
    tx.commit().await?;
    Ok(jobs)
}
