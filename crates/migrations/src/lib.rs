pub mod sql;

use indoc::formatdoc;
use sql::PDOFLOW_MIGRATIONS;
use sqlx::{query, query_as, Acquire, Error as SqlxError, FromRow, PgExecutor, Postgres};
use thiserror::Error;
use tracing::info;

/// `gen_random_uuid()` is built in from PostgreSQL 13 onwards.
const MINIMUM_PG_VERSION: u32 = 130000;

#[derive(Error, Debug)]
pub enum MigrateError {
    #[error("PDOFlow requires PostgreSQL v13.0 or greater (detected `server_version_num` = {0})")]
    IncompatibleVersion(u32),
    #[error("Error occured while parsing postgres version: {0}")]
    ParseVersionError(#[from] std::num::ParseIntError),
    #[error("Error occured while migrating: {0}")]
    SqlError(#[from] sqlx::Error),
}

/// Creates the PDOFlow schema and its migration-tracking table.
async fn install_schema<'e, E>(executor: E, escaped_schema: &str) -> Result<(), MigrateError>
where
    E: PgExecutor<'e> + Acquire<'e, Database = Postgres> + Clone,
{
    info!(schema = escaped_schema, "Installing PDOFlow schema");

    let create_schema_query = formatdoc!(
        r#"
            create schema if not exists {escaped_schema};
        "#
    );
    let create_migration_table_query = formatdoc!(
        r#"
            create table if not exists {escaped_schema}.migrations (
                id int primary key,
                ts timestamptz not null default now()
            );
        "#
    );

    let mut tx = executor.begin().await?;
    query(&create_schema_query).execute(tx.as_mut()).await?;
    query(&create_migration_table_query)
        .execute(tx.as_mut())
        .await?;
    tx.commit().await?;

    Ok(())
}

#[derive(FromRow, Default)]
struct LastMigration {
    server_version_num: String,
    id: Option<i32>,
}

/// Fetches the last applied migration, installing the schema first if it is
/// not there yet.
async fn get_last_migration<'e, E>(
    executor: &E,
    escaped_schema: &str,
) -> Result<LastMigration, MigrateError>
where
    E: PgExecutor<'e> + Acquire<'e, Database = Postgres> + Send + Sync + Clone,
{
    let status_query = formatdoc!(
        r#"
            select current_setting('server_version_num') as server_version_num,
                (select id from {escaped_schema}.migrations order by id desc limit 1) as id;
        "#
    );

    match query_as::<_, LastMigration>(&status_query)
        .fetch_one(executor.clone())
        .await
    {
        Ok(row) => Ok(row),
        Err(SqlxError::Database(e)) => {
            // 3F000: schema missing, 42P01: migrations table missing.
            let recoverable = e
                .code()
                .map(|code| code == "3F000" || code == "42P01")
                .unwrap_or(false);
            if !recoverable {
                return Err(MigrateError::SqlError(SqlxError::Database(e)));
            }

            install_schema(executor.clone(), escaped_schema).await?;
            let row = query_as::<_, LastMigration>(&status_query)
                .fetch_one(executor.clone())
                .await?;
            Ok(row)
        }
        Err(e) => Err(MigrateError::SqlError(e)),
    }
}

fn check_postgres_version(server_version_num: &str) -> Result<u32, MigrateError> {
    let version: u32 = server_version_num.parse()?;
    if version < MINIMUM_PG_VERSION {
        return Err(MigrateError::IncompatibleVersion(version));
    }
    Ok(version)
}

/// Brings the database up to the newest embedded revision. Safe to run from
/// every worker and producer at startup; already-applied migrations are
/// skipped.
pub async fn migrate<'e, E>(executor: E, escaped_schema: &str) -> Result<(), MigrateError>
where
    E: PgExecutor<'e> + Acquire<'e, Database = Postgres> + Send + Sync + Clone,
{
    let last_migration = get_last_migration(&executor, escaped_schema).await?;
    check_postgres_version(&last_migration.server_version_num)?;

    let applied_up_to = last_migration.id.unwrap_or(0);
    let mut migrated = false;

    for migration in PDOFLOW_MIGRATIONS.iter() {
        if migration.number() as i32 <= applied_up_to {
            continue;
        }

        migrated = true;
        info!(
            migration_number = migration.number(),
            migration_name = migration.name(),
            "Running migration"
        );

        let mut tx = executor.clone().begin().await?;
        migration.execute(&mut tx, escaped_schema).await?;
        let track_sql = format!("insert into {escaped_schema}.migrations (id) values ($1)");
        query(&track_sql)
            .bind(migration.number() as i32)
            .execute(tx.as_mut())
            .await?;
        tx.commit().await?;
    }

    if migrated {
        info!("Migrations complete");
    }

    Ok(())
}
