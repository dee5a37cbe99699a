use std::collections::HashMap;

use indoc::formatdoc;
use pdoflow_registry::FunctionSite;
use sqlx::{query, query_scalar, Postgres, Transaction};
use uuid::Uuid;

use crate::errors::Result;
use crate::profiling::CallGraphStats;

/// Reduces a call-statistics graph into profile rows.
///
/// Runs on the same transaction as the unit's outcome update so profiles and
/// outcomes stay consistent. Function rows are shared across profiles:
/// upserted by their (filename, line_number, function_name) tuple.
pub async fn persist_profile(
    tx: &mut Transaction<'_, Postgres>,
    escaped_schema: &str,
    job_record_id: Uuid,
    stats: &CallGraphStats,
) -> Result<Uuid> {
    let profile_sql = formatdoc!(
        r#"
            insert into {escaped_schema}.job_profiles
                (job_record_id, total_calls, total_time)
                values ($1::uuid, $2, $3)
                returning id
        "#
    );
    let profile_id: Uuid = query_scalar(&profile_sql)
        .bind(job_record_id)
        .bind(stats.total_calls())
        .bind(stats.total_time())
        .fetch_one(tx.as_mut())
        .await?;

    // The DO UPDATE arm is a no-op rewrite so the statement always returns
    // the row id, inserted or preexisting.
    let function_sql = formatdoc!(
        r#"
            insert into {escaped_schema}.function_defs
                (filename, line_number, function_name)
                values ($1, $2, $3)
                on conflict on constraint unique_function_site
                do update set function_name = excluded.function_name
                returning id
        "#
    );

    let mut function_ids: HashMap<FunctionSite, Uuid> = HashMap::new();
    for (site, _) in stats.functions() {
        let function_id: Uuid = query_scalar(&function_sql)
            .bind(site.file())
            .bind(*site.line() as i32)
            .bind(site.name())
            .fetch_one(tx.as_mut())
            .await?;
        function_ids.insert(site.clone(), function_id);
    }

    let stat_sql = formatdoc!(
        r#"
            insert into {escaped_schema}.function_stats
                (profile_id, function_id, n_calls, primitive_calls, total_time, cumulative_time)
                values ($1::uuid, $2::uuid, $3, $4, $5, $6)
        "#
    );
    for (site, timing) in stats.functions() {
        query(&stat_sql)
            .bind(profile_id)
            .bind(function_ids[site])
            .bind(timing.n_calls)
            .bind(timing.primitive_calls)
            .bind(timing.total_time)
            .bind(timing.cumulative_time)
            .execute(tx.as_mut())
            .await?;
    }

    let edge_sql = formatdoc!(
        r#"
            insert into {escaped_schema}.function_call_map
                (profile_id, caller_id, callee_id, n_calls)
                values ($1::uuid, $2::uuid, $3::uuid, $4)
        "#
    );
    for (caller, callee, n_calls) in stats.edges() {
        query(&edge_sql)
            .bind(profile_id)
            .bind(function_ids[caller])
            .bind(function_ids[callee])
            .bind(n_calls)
            .execute(tx.as_mut())
            .await?;
    }

    Ok(profile_id)
}
