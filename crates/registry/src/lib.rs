//! The registry boundary between producers and workers.
//!
//! User code registers callables under an `(entry_point, target_function)`
//! address at startup; the worker runtime resolves the same address from a
//! claimed job record back into something invokable. Registration is
//! explicit: there is no module-scope global, producers and workers share a
//! registry by constructing one and passing it around.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::panic::Location;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use getset::Getters;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;

/// Future returned by an invoked job function. The error is an opaque
/// rendering of whatever the user function failed with.
pub type JobFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

type JobFn = Box<dyn Fn(Vec<Value>, Map<String, Value>) -> JobFuture + Send + Sync>;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("callable '{target_function}' already registered under entry point '{entry_point}'")]
    Duplicate {
        entry_point: String,
        target_function: String,
    },
    #[error("no callable registered for entry point '{entry_point}' and target '{target_function}'")]
    NotFound {
        entry_point: String,
        target_function: String,
    },
}

/// Where a callable was registered, used as its identity in execution
/// profiles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Getters)]
#[getset(get = "pub")]
pub struct FunctionSite {
    file: String,
    line: u32,
    name: String,
}

impl FunctionSite {
    pub fn new(file: impl Into<String>, line: u32, name: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            line,
            name: name.into(),
        }
    }
}

/// A resolved callable plus the metadata the worker needs around it.
#[derive(Getters)]
#[getset(get = "pub")]
pub struct RegisteredJob {
    entry_point: String,
    target_function: String,
    site: FunctionSite,
    #[getset(skip)]
    job_fn: JobFn,
}

impl RegisteredJob {
    pub fn call(&self, args: Vec<Value>, kwargs: Map<String, Value>) -> JobFuture {
        (self.job_fn)(args, kwargs)
    }
}

impl Debug for RegisteredJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredJob")
            .field("entry_point", &self.entry_point)
            .field("target_function", &self.target_function)
            .field("site", &self.site)
            .finish_non_exhaustive()
    }
}

/// Maps `(entry_point, target_function)` to registered callables.
///
/// Build one, register everything, then share it as `Arc<JobRegistry>` with
/// workers and producers. Names are kept unique per entry point purely for
/// readability of the database records, as in the interface contract.
#[derive(Default)]
pub struct JobRegistry {
    jobs: HashMap<(String, String), Arc<RegisteredJob>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callable taking raw positional and keyword arguments.
    ///
    /// The registration site (file, line) is captured and later reused as
    /// the callable's identity in execution profiles.
    #[track_caller]
    pub fn add_job<F, Fut, E>(
        &mut self,
        entry_point: &str,
        target_function: &str,
        job_fn: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(Vec<Value>, Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Debug,
    {
        let location = Location::caller();
        let site = FunctionSite::new(location.file(), location.line(), target_function);
        let erased: JobFn = Box::new(move |args, kwargs| {
            job_fn(args, kwargs)
                .map(|res| res.map_err(|e| format!("{e:?}")))
                .boxed()
        });
        self.insert(entry_point, target_function, site, erased)
    }

    /// Register a callable taking a typed argument deserialized from the
    /// positional-argument array. A payload that does not deserialize fails
    /// the job like any other user error.
    #[track_caller]
    pub fn add_typed_job<T, F, Fut, E>(
        &mut self,
        entry_point: &str,
        target_function: &str,
        job_fn: F,
    ) -> Result<(), RegistryError>
    where
        T: DeserializeOwned + Send,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Debug,
    {
        let location = Location::caller();
        let site = FunctionSite::new(location.file(), location.line(), target_function);
        let job_fn = Arc::new(job_fn);
        let erased: JobFn = Box::new(move |args, _kwargs| {
            let job_fn = job_fn.clone();
            async move {
                match serde_json::from_value(Value::Array(args)) {
                    Err(e) => Err(format!("{e:?}")),
                    Ok(payload) => job_fn(payload).await.map_err(|e| format!("{e:?}")),
                }
            }
            .boxed()
        });
        self.insert(entry_point, target_function, site, erased)
    }

    fn insert(
        &mut self,
        entry_point: &str,
        target_function: &str,
        site: FunctionSite,
        job_fn: JobFn,
    ) -> Result<(), RegistryError> {
        let key = (entry_point.to_string(), target_function.to_string());
        if self.jobs.contains_key(&key) {
            return Err(RegistryError::Duplicate {
                entry_point: entry_point.into(),
                target_function: target_function.into(),
            });
        }

        self.jobs.insert(
            key,
            Arc::new(RegisteredJob {
                entry_point: entry_point.into(),
                target_function: target_function.into(),
                site,
                job_fn,
            }),
        );
        Ok(())
    }

    /// Resolve an address back into an invokable.
    pub fn resolve(
        &self,
        entry_point: &str,
        target_function: &str,
    ) -> Result<Arc<RegisteredJob>, RegistryError> {
        self.jobs
            .get(&(entry_point.to_string(), target_function.to_string()))
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                entry_point: entry_point.into(),
                target_function: target_function.into(),
            })
    }

    pub fn contains(&self, entry_point: &str, target_function: &str) -> bool {
        self.jobs
            .contains_key(&(entry_point.to_string(), target_function.to_string()))
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.jobs.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[i64]) -> Vec<Value> {
        values.iter().map(|v| Value::from(*v)).collect()
    }

    #[tokio::test]
    async fn registers_and_resolves() {
        let mut registry = JobRegistry::new();
        registry
            .add_job("demo::math", "add", |args, _kwargs| async move {
                let a = args[0].as_i64().unwrap();
                let b = args[1].as_i64().unwrap();
                if a + b >= 0 {
                    Ok(())
                } else {
                    Err("negative")
                }
            })
            .unwrap();

        let job = registry.resolve("demo::math", "add").unwrap();
        assert_eq!(job.target_function(), "add");
        assert_eq!(job.site().name(), "add");
        assert!(job.site().file().ends_with("lib.rs"));

        job.call(args(&[1, 2]), Map::new()).await.unwrap();
        let err = job.call(args(&[-5, 2]), Map::new()).await.unwrap_err();
        assert!(err.contains("negative"));
    }

    #[tokio::test]
    async fn typed_registration_deserializes_positional_arguments() {
        let mut registry = JobRegistry::new();
        registry
            .add_typed_job("demo::math", "sum_pair", |(a, b): (i64, i64)| async move {
                assert_eq!(a + b, 3);
                Ok::<(), String>(())
            })
            .unwrap();

        let job = registry.resolve("demo::math", "sum_pair").unwrap();
        job.call(args(&[1, 2]), Map::new()).await.unwrap();

        // Wrong arity fails like a user error, not a panic.
        let err = job.call(args(&[1]), Map::new()).await.unwrap_err();
        assert!(!err.is_empty());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = JobRegistry::new();
        registry
            .add_job("demo", "noop", |_, _| async { Ok::<(), String>(()) })
            .unwrap();
        let err = registry
            .add_job("demo", "noop", |_, _| async { Ok::<(), String>(()) })
            .unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate { .. }));
    }

    #[test]
    fn unknown_address_is_not_found() {
        let registry = JobRegistry::new();
        let err = registry.resolve("ghost", "missing").unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
    }
}
