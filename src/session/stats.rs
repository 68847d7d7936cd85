//! Classified error history

use std::collections::{BTreeMap, VecDeque};

use parking_lot::Mutex;
use serde::Serialize;

use crate::classify::{ClassifiedError, ErrorCategory, Severity};

/// Aggregate view over every recorded error
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorStatistics {
    /// Errors recorded since creation
    pub total: u64,
    /// Count per category
    pub by_category: BTreeMap<ErrorCategory, u64>,
    /// Count per severity
    pub by_severity: BTreeMap<Severity, u64>,
    /// Errors that were recoverable
    pub recoverable: u64,
    /// Retry attempts scheduled
    pub retries: u64,
    /// Most recent errors, oldest first
    pub recent: Vec<ClassifiedError>,
}

struct State {
    stats: ErrorStatistics,
    history: VecDeque<ClassifiedError>,
}

/// Thread-safe recorder with a capped history
pub struct ErrorLog {
    capacity: usize,
    state: Mutex<State>,
}

impl ErrorLog {
    /// Keep at most `capacity` errors in the history
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(State {
                stats: ErrorStatistics::default(),
                history: VecDeque::new(),
            }),
        }
    }

    /// Record an error
    pub fn record(&self, error: &ClassifiedError) {
        let mut state = self.state.lock();
        state.stats.total += 1;
        *state.stats.by_category.entry(error.category()).or_default() += 1;
        *state.stats.by_severity.entry(error.severity()).or_default() += 1;
        if error.is_recoverable() {
            state.stats.recoverable += 1;
        }
        if state.history.len() == self.capacity {
            state.history.pop_front();
        }
        state.history.push_back(error.clone());
    }

    /// Count a scheduled retry
    pub fn record_retry(&self) {
        self.state.lock().stats.retries += 1;
    }

    /// Most recent error
    #[must_use]
    pub fn last(&self) -> Option<ClassifiedError> {
        self.state.lock().history.back().cloned()
    }

    /// Snapshot
    #[must_use]
    pub fn statistics(&self) -> ErrorStatistics {
        let state = self.state.lock();
        let mut stats = state.stats.clone();
        stats.recent = state.history.iter().cloned().collect();
        stats
    }
}
