//! Self-test result cache with time-to-live (TTL) support.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use super::TestResult;

/// Cached data with timestamp.
#[derive(Debug, Clone)]
struct CachedData<T> {
    data: T,
    cached_at: DateTime<Utc>,
}

/// Results of the most recent run per principal (`None` = anonymous run).
#[derive(Debug, Clone)]
pub struct ResultCache {
    ttl: Duration,
    runs: HashMap<Option<String>, CachedData<Vec<TestResult>>>,
}

impl ResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            runs: HashMap::new(),
        }
    }

    /// Get cached results if still valid.
    pub fn get(&self, principal_id: Option<&str>) -> Option<&Vec<TestResult>> {
        self.runs
            .get(&principal_id.map(str::to_string))
            .filter(|cached| self.is_valid(&cached.cached_at))
            .map(|cached| &cached.data)
    }

    /// Store the results of a run and drop expired runs.
    pub fn set(&mut self, principal_id: Option<&str>, results: Vec<TestResult>) {
        let now = Utc::now();
        let ttl = self.ttl;
        self.runs.retain(|_, cached| now - cached.cached_at < ttl);
        self.runs.insert(
            principal_id.map(str::to_string),
            CachedData {
                data: results,
                cached_at: Utc::now(),
            },
        );
    }

    /// Get when the results for `principal_id` were cached.
    pub fn cached_at(&self, principal_id: Option<&str>) -> Option<DateTime<Utc>> {
        self.runs
            .get(&principal_id.map(str::to_string))
            .map(|c| c.cached_at)
    }

    /// Invalidate every cached run.
    pub fn invalidate(&mut self) {
        self.runs.clear();
    }

    fn is_valid(&self, cached_at: &DateTime<Utc>) -> bool {
        Utc::now() - *cached_at < self.ttl
    }
}
