//! PDOFlow is a distributed job queue whose single source of truth is
//! PostgreSQL. Producers submit postings (named batches of work units);
//! long-lived workers claim units with `FOR UPDATE SKIP LOCKED`, execute
//! them, and record outcomes, optionally with execution profiles. The
//! database alone coordinates workers: no broker, no shared memory, no
//! master.
//!
//! The crate splits into a data-access layer over the schema ([`sql`]), the
//! worker runtime ([`Worker`]), a pool supervisor ([`WorkerPool`]), lazy
//! observer sequences ([`observer`]) and the producer/operator facade
//! ([`PdoflowUtils`]).
//!
//! ```no_run
//! use std::sync::Arc;
//! use pdoflow::{JobRegistry, PdoflowUtils, WorkUnit, WorkerPool};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut registry = JobRegistry::new();
//! registry.add_typed_job("demo::math", "add", |(a, b): (i64, i64)| async move {
//!     println!("{}", a + b);
//!     Ok::<(), String>(())
//! })?;
//! let registry = Arc::new(registry);
//!
//! let mut pool = WorkerPool::options()
//!     .max_workers(2)
//!     .registry(registry)
//!     .database_url("postgres://flow@localhost/flow")
//!     .init()
//!     .await?;
//!
//! let utils = PdoflowUtils::new(pool.management_pool().clone(), "pdoflow").await?;
//! let posted = utils
//!     .post_work(
//!         "demo::math",
//!         "add",
//!         (0..10).map(|i| WorkUnit::new(vec![i.into(), i.into()])).collect(),
//!     )
//!     .await?;
//!
//! pool.await_posting_completion(posted.posting_id, std::time::Duration::from_millis(500), None)
//!     .await?;
//! pool.close().await;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod config;
pub mod errors;
pub mod failure_cache;
pub mod observer;
pub mod pool;
pub mod profiling;
pub mod sql;
pub mod status;
pub mod table;
mod utils;
pub mod worker;
pub mod worker_utils;

pub use builder::{WorkerBuildError, WorkerOptions, DEFAULT_SCHEMA};
pub use config::DbConfig;
pub use errors::{PdoflowError, Result};
pub use failure_cache::FailureCache;
pub use pool::{PoolOptions, WorkerPool};
pub use profiling::{CallGraphStats, FunctionTiming, WallClockProfiler};
pub use sql::claim_batch::ClaimedJob;
pub use sql::job_record::JobRecord;
pub use sql::posting::{PostedWork, Posting, PostingSnapshot, PriorityBand, WorkUnit};
pub use status::Status;
pub use table::TableFormat;
pub use worker::{ExceptionLogging, Worker};
pub use worker_utils::PdoflowUtils;

pub use pdoflow_migrations::migrate;
pub use pdoflow_registry::{FunctionSite, JobRegistry, RegisteredJob, RegistryError};
pub use pdoflow_shutdown_signal::{
    merged, os_shutdown_signal, ShutdownController, ShutdownSignal,
};
