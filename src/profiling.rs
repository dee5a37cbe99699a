use std::collections::HashMap;
use std::future::Future;
use std::time::Instant;

use pdoflow_registry::FunctionSite;

/// Timing totals for one function within a sampled execution.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FunctionTiming {
    pub n_calls: i64,
    pub primitive_calls: i64,
    /// Time spent in the function itself
    pub total_time: f64,
    /// Time spent in the function and everything it called
    pub cumulative_time: f64,
}

/// A call-statistics graph produced by profiling one work unit: per-function
/// timings plus caller->callee edges with call counts.
///
/// Any profiler that can fill this in plugs into the persistence path; the
/// reducer into database rows is the portable part.
#[derive(Debug, Clone, Default)]
pub struct CallGraphStats {
    functions: HashMap<FunctionSite, FunctionTiming>,
    edges: HashMap<(FunctionSite, FunctionSite), i64>,
}

impl CallGraphStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges a timing observation for the given function.
    pub fn record(&mut self, site: FunctionSite, timing: FunctionTiming) {
        let entry = self.functions.entry(site).or_default();
        entry.n_calls += timing.n_calls;
        entry.primitive_calls += timing.primitive_calls;
        entry.total_time += timing.total_time;
        entry.cumulative_time += timing.cumulative_time;
    }

    /// Merges a caller->callee observation. Both endpoints gain a function
    /// entry if they have none yet, so every edge resolves in the graph.
    pub fn record_edge(&mut self, caller: FunctionSite, callee: FunctionSite, n_calls: i64) {
        self.functions.entry(caller.clone()).or_default();
        self.functions.entry(callee.clone()).or_default();
        *self.edges.entry((caller, callee)).or_insert(0) += n_calls;
    }

    pub fn functions(&self) -> impl Iterator<Item = (&FunctionSite, &FunctionTiming)> {
        self.functions.iter()
    }

    pub fn edges(&self) -> impl Iterator<Item = (&FunctionSite, &FunctionSite, i64)> {
        self.edges
            .iter()
            .map(|((caller, callee), calls)| (caller, callee, *calls))
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Aggregate primitive calls across all functions.
    pub fn total_calls(&self) -> i64 {
        self.functions.values().map(|t| t.primitive_calls).sum()
    }

    /// Aggregate cumulative time across all functions.
    pub fn total_time(&self) -> f64 {
        self.functions.values().map(|t| t.cumulative_time).sum()
    }
}

/// The built-in sampler: wraps a unit's execution and records the resolved
/// callable as a single node in the graph, timed wall-clock. Failures are
/// profiled the same as successes.
#[derive(Debug, Clone)]
pub struct WallClockProfiler {
    site: FunctionSite,
}

impl WallClockProfiler {
    pub fn new(site: FunctionSite) -> Self {
        Self { site }
    }

    pub async fn profile<F>(self, fut: F) -> (Result<(), String>, CallGraphStats)
    where
        F: Future<Output = Result<(), String>>,
    {
        let start = Instant::now();
        let result = fut.await;
        let elapsed = start.elapsed().as_secs_f64();

        let mut stats = CallGraphStats::new();
        stats.record(
            self.site,
            FunctionTiming {
                n_calls: 1,
                primitive_calls: 1,
                total_time: elapsed,
                cumulative_time: elapsed,
            },
        );

        (result, stats)
    }
}
