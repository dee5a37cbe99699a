use std::collections::{HashMap, HashSet, VecDeque};

use uuid::Uuid;

pub const DEFAULT_MAX_POSTINGS: usize = 1024;
pub const DEFAULT_MAX_JOBS_PER_POSTING: usize = 128;
/// Failures a worker tolerates from one posting before blacklisting it
/// locally.
pub const DEFAULT_FAILURE_BUDGET: u32 = 10;

#[derive(Debug)]
struct PostingFailures {
    jobs: HashSet<Uuid>,
    budget_left: u32,
}

/// Per-worker memory of which units failed under it, keyed by posting.
///
/// Strictly process-private: its job is to keep this worker from pulling the
/// same doomed units in a tight retry loop and to locally blacklist postings
/// that keep failing. Other workers still attempt them. Bounded: at most
/// `max_postings` postings tracked (least-recently-touched evicted first)
/// and at most `max_jobs_per_posting` job ids remembered per posting.
#[derive(Debug)]
pub struct FailureCache {
    max_postings: usize,
    max_jobs_per_posting: usize,
    failure_budget: u32,
    entries: HashMap<Uuid, PostingFailures>,
    // least-recently-touched first
    order: VecDeque<Uuid>,
}

impl Default for FailureCache {
    fn default() -> Self {
        Self::new()
    }
}

impl FailureCache {
    pub fn new() -> Self {
        Self::with_limits(
            DEFAULT_MAX_POSTINGS,
            DEFAULT_MAX_JOBS_PER_POSTING,
            DEFAULT_FAILURE_BUDGET,
        )
    }

    pub fn with_limits(
        max_postings: usize,
        max_jobs_per_posting: usize,
        failure_budget: u32,
    ) -> Self {
        Self {
            max_postings,
            max_jobs_per_posting,
            failure_budget,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Notes a failed unit and burns one strike off its posting's budget.
    /// Returns the budget remaining afterwards.
    pub fn record_failure(&mut self, posting_id: Uuid, job_id: Uuid) -> u32 {
        let failure_budget = self.failure_budget;
        let max_jobs = self.max_jobs_per_posting;

        let entry = self
            .entries
            .entry(posting_id)
            .or_insert_with(|| PostingFailures {
                jobs: HashSet::new(),
                budget_left: failure_budget,
            });
        if entry.jobs.len() < max_jobs {
            entry.jobs.insert(job_id);
        }
        entry.budget_left = entry.budget_left.saturating_sub(1);
        let remaining = entry.budget_left;

        self.touch(posting_id);
        self.evict_over_capacity();
        remaining
    }

    /// Budget remaining for the posting; untracked postings have the full
    /// budget.
    pub fn budget_left(&self, posting_id: &Uuid) -> u32 {
        self.entries
            .get(posting_id)
            .map(|entry| entry.budget_left)
            .unwrap_or(self.failure_budget)
    }

    pub fn is_blacklisted(&self, posting_id: &Uuid) -> bool {
        self.budget_left(posting_id) == 0
    }

    /// Forces the posting onto the local blacklist.
    pub fn blacklist(&mut self, posting_id: Uuid) {
        let entry = self
            .entries
            .entry(posting_id)
            .or_insert_with(|| PostingFailures {
                jobs: HashSet::new(),
                budget_left: 0,
            });
        entry.budget_left = 0;
        self.touch(posting_id);
        self.evict_over_capacity();
    }

    pub fn has_failed(&self, posting_id: &Uuid, job_id: &Uuid) -> bool {
        self.entries
            .get(posting_id)
            .map(|entry| entry.jobs.contains(job_id))
            .unwrap_or(false)
    }

    /// Every posting this cache currently remembers.
    pub fn tracked_postings(&self) -> Vec<Uuid> {
        self.entries.keys().copied().collect()
    }

    /// Postings this worker currently blacklists; claims exclude them.
    pub fn blacklisted_postings(&self) -> Vec<Uuid> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.budget_left == 0)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Drops a posting's memory entirely; called once the posting is
    /// observed in a terminal status.
    pub fn purge(&mut self, posting_id: &Uuid) {
        if self.entries.remove(posting_id).is_some() {
            self.order.retain(|id| id != posting_id);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn touch(&mut self, posting_id: Uuid) {
        self.order.retain(|id| *id != posting_id);
        self.order.push_back(posting_id);
    }

    fn evict_over_capacity(&mut self) {
        while self.entries.len() > self.max_postings {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_runs_out_and_blacklists() {
        let mut cache = FailureCache::with_limits(16, 16, 3);
        let posting = Uuid::new_v4();

        assert_eq!(cache.budget_left(&posting), 3);
        assert_eq!(cache.record_failure(posting, Uuid::new_v4()), 2);
        assert_eq!(cache.record_failure(posting, Uuid::new_v4()), 1);
        assert!(!cache.is_blacklisted(&posting));
        assert_eq!(cache.record_failure(posting, Uuid::new_v4()), 0);
        assert!(cache.is_blacklisted(&posting));
        assert_eq!(cache.blacklisted_postings(), vec![posting]);
    }

    #[test]
    fn remembers_failed_jobs_up_to_the_cap() {
        let mut cache = FailureCache::with_limits(16, 2, 10);
        let posting = Uuid::new_v4();
        let jobs: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();

        for job in &jobs {
            cache.record_failure(posting, *job);
        }

        assert!(cache.has_failed(&posting, &jobs[0]));
        assert!(cache.has_failed(&posting, &jobs[1]));
        // Third job fell outside the per-posting cap.
        assert!(!cache.has_failed(&posting, &jobs[2]));
    }

    #[test]
    fn evicts_least_recently_touched_posting() {
        let mut cache = FailureCache::with_limits(2, 16, 10);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let third = Uuid::new_v4();

        cache.record_failure(first, Uuid::new_v4());
        cache.record_failure(second, Uuid::new_v4());
        // Touch `first` so `second` is the eviction candidate.
        cache.record_failure(first, Uuid::new_v4());
        cache.record_failure(third, Uuid::new_v4());

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.budget_left(&second), 10);
        assert!(cache.budget_left(&first) < 10);
    }

    #[test]
    fn purge_forgets_the_posting() {
        let mut cache = FailureCache::new();
        let posting = Uuid::new_v4();
        let job = Uuid::new_v4();

        cache.record_failure(posting, job);
        assert!(cache.has_failed(&posting, &job));

        cache.purge(&posting);
        assert!(cache.is_empty());
        assert!(!cache.has_failed(&posting, &job));
        assert_eq!(cache.budget_left(&posting), DEFAULT_FAILURE_BUDGET);
    }

    #[test]
    fn blacklist_is_immediate() {
        let mut cache = FailureCache::new();
        let posting = Uuid::new_v4();
        cache.blacklist(posting);
        assert!(cache.is_blacklisted(&posting));
    }
}
