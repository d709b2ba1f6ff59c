//! Query filters for audit entries.

use crate::audit::entry::AuditEntry;
use crate::core::{IdentityId, Timestamp};
use serde::{Deserialize, Serialize};

/// Filter for querying audit entries.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuditFilter {
    /// Filter by leader
    pub leader: Option<IdentityId>,
    /// Filter by term
    pub term: Option<u64>,
    /// Lowest log index, inclusive
    pub index_from: Option<u64>,
    /// Highest log index, inclusive
    pub index_to: Option<u64>,
    /// Only detections
    pub detections_only: bool,
    /// Filter by date from
    pub date_from: Option<Timestamp>,
    /// Filter by date to
    pub date_to: Option<Timestamp>,
    /// Maximum results
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_leader(mut self, leader: &str) -> Self {
        self.leader = Some(IdentityId::new(leader));
        self
    }

    pub fn by_term(mut self, term: u64) -> Self {
        self.term = Some(term);
        self
    }

    /// Filter by inclusive index range.
    pub fn by_index_range(mut self, from: u64, to: u64) -> Self {
        self.index_from = Some(from);
        self.index_to = Some(to);
        self
    }

    pub fn detections(mut self) -> Self {
        self.detections_only = true;
        self
    }

    pub fn by_date_range(mut self, from: Timestamp, to: Timestamp) -> Self {
        self.date_from = Some(from);
        self.date_to = Some(to);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check if an entry matches this filter.
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(leader) = &self.leader {
            if &entry.round.leader != leader {
                return false;
            }
        }

        if let Some(term) = self.term {
            if entry.round.term != term {
                return false;
            }
        }

        if self.index_from.is_some_and(|from| entry.round.index < from)
            || self.index_to.is_some_and(|to| entry.round.index > to)
        {
            return false;
        }

        if self.detections_only && !entry.kind.is_detection() {
            return false;
        }

        if let Some(from) = self.date_from {
            if entry.recorded_at < from {
                return false;
            }
        }

        if let Some(to) = self.date_to {
            if entry.recorded_at > to {
                return false;
            }
        }

        true
    }

    /// Apply the filter and limit to a sequence of entries.
    pub fn apply<'a>(&self, entries: impl IntoIterator<Item = &'a AuditEntry>) -> Vec<AuditEntry> {
        let matching = entries.into_iter().filter(|e| self.matches(e)).cloned();
        match self.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        }
    }
}
