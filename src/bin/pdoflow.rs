//! Command-line front-end over the programmatic facade.
//!
//! Exit codes: 0 success, 1 generic error, 2 invalid argument, 3 not found.
//!
//! `pool` and `execute-job` resolve callables from the registry linked into
//! this binary; deployments embed their own registrations by building a
//! binary that constructs the registry before handing it over.

use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use pdoflow::sql::job_record::list_job_records;
use pdoflow::table::{render, TableFormat};
use pdoflow::worker::ExceptionLogging;
use pdoflow::{
    os_shutdown_signal, DbConfig, JobRegistry, PdoflowError, PdoflowUtils, PostingSnapshot,
    Status, WorkerPool, DEFAULT_SCHEMA,
};

#[derive(Parser)]
#[command(name = "pdoflow", version, about = "Postgres-backed distributed job queue")]
struct Cli {
    /// Connection string; overrides ~/.config/pdoflow/db.conf
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Schema holding the queue tables
    #[arg(long, global = true, default_value = DEFAULT_SCHEMA)]
    schema: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a worker pool until interrupted
    Pool {
        #[arg(long, default_value_t = num_cpus::get())]
        max_workers: usize,

        /// Worker inspections per second
        #[arg(long, default_value_t = 1.0)]
        upkeep_rate: f64,

        /// Units claimed per worker cycle
        #[arg(long, default_value_t = 10)]
        batchsize: i64,

        /// Severity for user-function failures (none|debug|info|warn|error)
        #[arg(long, default_value = "warn", value_parser = parse_exception_logging)]
        exception_logging: ExceptionLogging,

        /// Probability a unit runs under the profiler
        #[arg(long, default_value_t = 0.1)]
        profile_rate: f64,
    },

    /// Show status for one or more postings
    PostingStatus {
        #[arg(required = true, value_parser = parse_uuid)]
        uuid: Vec<Uuid>,

        /// Also list each posting's units
        #[arg(long)]
        show_jobs: bool,

        #[arg(long, default_value = "simple", value_parser = parse_format)]
        format: TableFormat,
    },

    /// Show every posting
    ListPostings {
        #[arg(long, default_value = "simple", value_parser = parse_format)]
        format: TableFormat,
    },

    /// Administratively transition a posting
    SetPostingStatus {
        #[arg(value_parser = parse_uuid)]
        uuid: Uuid,

        #[arg(value_parser = parse_status)]
        status: Status,
    },

    /// Priority distribution of waiting work
    PriorityStats {
        #[arg(long, default_value = "simple", value_parser = parse_format)]
        format: TableFormat,
    },

    /// Run one unit in-process for debugging
    ExecuteJob {
        #[arg(value_parser = parse_uuid)]
        uuid: Uuid,
    },
}

fn parse_uuid(value: &str) -> Result<Uuid, String> {
    Uuid::from_str(value).map_err(|e| format!("'{value}' is not a uuid: {e}"))
}

fn parse_status(value: &str) -> Result<Status, String> {
    Status::from_str(value).map_err(|e| e.to_string())
}

fn parse_format(value: &str) -> Result<TableFormat, String> {
    TableFormat::from_str(value).map_err(|e| e.to_string())
}

fn parse_exception_logging(value: &str) -> Result<ExceptionLogging, String> {
    ExceptionLogging::from_str(value)
}

/// Callables available to `pool` and `execute-job`. The stock binary ships
/// none; linked deployments register theirs here before the pool boots.
fn build_registry() -> JobRegistry {
    JobRegistry::new()
}

async fn connect(cli: &Cli) -> anyhow::Result<PgPool> {
    let options = match &cli.database_url {
        Some(url) => url
            .parse()
            .map_err(|e| PdoflowError::InvalidArgument(format!("invalid database url: {e}")))?,
        None => DbConfig::load()
            .context("no --database-url given and the configuration could not be loaded")?
            .connect_options(),
    };

    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .context("could not connect to the database")?;
    Ok(pool)
}

fn snapshot_rows(snapshots: &[PostingSnapshot]) -> Vec<Vec<String>> {
    snapshots
        .iter()
        .map(|s| {
            vec![
                s.id().to_string(),
                s.created_on().to_rfc3339(),
                s.status().to_string(),
                format!("{:.1}", s.percent_done()),
            ]
        })
        .collect()
}

const SNAPSHOT_HEADERS: [&str; 4] = ["id", "created_on", "status", "percent_done"];

async fn run(cli: Cli) -> anyhow::Result<()> {
    let pg_pool = connect(&cli).await?;
    let utils = PdoflowUtils::new(pg_pool.clone(), &cli.schema).await?;
    utils.migrate().await?;

    match cli.command {
        Command::Pool {
            max_workers,
            upkeep_rate,
            batchsize,
            exception_logging,
            profile_rate,
        } => {
            if upkeep_rate <= 0.0 {
                return Err(PdoflowError::InvalidArgument(
                    "--upkeep-rate must be positive".to_string(),
                )
                .into());
            }

            let mut pool = WorkerPool::options()
                .max_workers(max_workers)
                .upkeep_interval(Duration::from_secs_f64(1.0 / upkeep_rate))
                .batch_size(batchsize)
                .exception_logging(exception_logging)
                .profile_rate(profile_rate)
                .schema(&cli.schema)
                .registry(Arc::new(build_registry()))
                .pg_connect_options(match &cli.database_url {
                    Some(url) => url.parse()?,
                    None => DbConfig::load()?.connect_options(),
                })
                .init()
                .await?;

            pool.run_until(os_shutdown_signal()).await;
        }

        Command::PostingStatus {
            uuid,
            show_jobs,
            format,
        } => {
            let snapshots = utils.posting_snapshots(&uuid).await?;
            if snapshots.is_empty() {
                return Err(PdoflowError::PostingNotFound(uuid[0]).into());
            }

            println!("{}", render(format, &SNAPSHOT_HEADERS, &snapshot_rows(&snapshots)));

            if show_jobs {
                for snapshot in &snapshots {
                    let records =
                        list_job_records(&pg_pool, utils.escaped_schema(), *snapshot.id()).await?;
                    if records.is_empty() {
                        continue;
                    }

                    let rows: Vec<Vec<String>> = records
                        .iter()
                        .map(|r| {
                            vec![
                                r.id().to_string(),
                                r.priority().to_string(),
                                r.status().to_string(),
                                r.tries_remaining().to_string(),
                                r.created_on().to_rfc3339(),
                            ]
                        })
                        .collect();

                    println!("Posting {}:", snapshot.id());
                    println!(
                        "{}",
                        render(
                            format,
                            &["id", "priority", "status", "tries_remaining", "created_on"],
                            &rows,
                        )
                    );
                }
            }
        }

        Command::ListPostings { format } => {
            let snapshots = utils.list_postings().await?;
            println!("{}", render(format, &SNAPSHOT_HEADERS, &snapshot_rows(&snapshots)));
        }

        Command::SetPostingStatus { uuid, status } => {
            utils.set_posting_status(uuid, status).await?;
            println!("Posting {uuid} set to {status}");
        }

        Command::PriorityStats { format } => {
            let bands = utils.priority_stats().await?;
            if bands.is_empty() {
                println!("No waiting jobs found.");
                return Ok(());
            }

            let rows: Vec<Vec<String>> = bands
                .iter()
                .map(|b| {
                    vec![
                        b.priority().to_string(),
                        b.waiting().to_string(),
                        b.oldest().to_rfc3339(),
                    ]
                })
                .collect();
            println!(
                "{}",
                render(format, &["priority", "waiting", "oldest"], &rows)
            );
        }

        Command::ExecuteJob { uuid } => {
            let registry = build_registry();
            match utils.execute_job(&registry, uuid).await? {
                Ok(()) => println!("Job record {uuid} successfully executed"),
                Err(message) => {
                    return Err(anyhow::anyhow!(
                        "job record {uuid} encountered an error: {message}"
                    ));
                }
            }
        }
    }

    Ok(())
}

fn exit_code_for(error: &anyhow::Error) -> ExitCode {
    match error.downcast_ref::<PdoflowError>() {
        Some(PdoflowError::PostingNotFound(_)) | Some(PdoflowError::JobNotFound(_)) => {
            ExitCode::from(3)
        }
        Some(PdoflowError::InvalidArgument(_)) => ExitCode::from(2),
        _ => ExitCode::from(1),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("pdoflow: {error:#}");
            exit_code_for(&error)
        }
    }
}
