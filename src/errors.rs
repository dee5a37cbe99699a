use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by PDOFlow operations.
///
/// Worker-internal failures (user exceptions, transient DB errors) are
/// handled inside the worker loop and never reach this enum; what callers
/// see here is the producer-facing taxonomy: SQL/serialization problems,
/// not-found lookups, timeouts and invalid arguments.
#[derive(Error, Debug)]
pub enum PdoflowError {
    /// An error occurred while executing an SQL query
    #[error("Error occured while query: {0}")]
    SqlError(#[from] sqlx::Error),

    /// An error occurred while serializing or deserializing job arguments
    #[error("Error while serializing arguments: {0}")]
    JsonSerializeError(#[from] serde_json::Error),

    /// Schema migration failed
    #[error("Error occured while migrating: {0}")]
    MigrateError(#[from] pdoflow_migrations::MigrateError),

    /// Registration or resolution through the registry boundary failed
    #[error(transparent)]
    RegistryError(#[from] pdoflow_registry::RegistryError),

    /// Loading the database configuration failed
    #[error("Error occured while loading configuration: {0}")]
    ConfigError(#[from] config::ConfigError),

    /// The given posting id matched no posting
    #[error("No posting found for id {0}")]
    PostingNotFound(Uuid),

    /// The given job-record id matched no job record
    #[error("No job record found for id {0}")]
    JobNotFound(Uuid),

    /// A wall-clock deadline elapsed before the awaited condition held
    #[error("Timed out after waiting {0:?}")]
    Timeout(Duration),

    /// A caller-supplied value was rejected at the API boundary
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// A Result type alias for PdoflowError.
pub type Result<T> = core::result::Result<T, PdoflowError>;
