//! Leader tenure limiting.
//!
//! Independent of Byzantine detection: a leader that holds office longer than
//! the configured maximum is asked to step down on every check until the
//! leadership changes.

use crate::core::{IdentityId, Timestamp};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Current leader and when it took office.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderTenureState {
    /// Current leader
    pub leader: IdentityId,
    /// Term the leader holds
    pub term: u64,
    /// When leadership was assumed
    pub since: Timestamp,
}

/// Result of a tenure check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TenureCheck {
    /// No leader known
    NoLeader,
    /// Leader within its tenure
    WithinTenure { remaining: chrono::Duration },
    /// Leader exceeded its tenure
    StepDownRequired {
        leader: IdentityId,
        term: u64,
        held_for: chrono::Duration,
    },
}

impl TenureCheck {
    pub fn requires_step_down(&self) -> bool {
        matches!(self, TenureCheck::StepDownRequired { .. })
    }
}

/// Tracks leader tenure against a maximum.
#[derive(Debug)]
pub struct LeaderTenureGuard {
    max_tenure: chrono::Duration,
    state: Option<LeaderTenureState>,
}

impl LeaderTenureGuard {
    pub fn new(max_tenure_secs: u64) -> Self {
        Self {
            max_tenure: chrono::Duration::seconds(max_tenure_secs as i64),
            state: None,
        }
    }

    pub fn max_tenure(&self) -> chrono::Duration {
        self.max_tenure
    }

    pub fn state(&self) -> Option<&LeaderTenureState> {
        self.state.as_ref()
    }

    /// Record a leadership change. Re-announcing the same leader and term
    /// keeps the original start time.
    pub fn on_leader_change(&mut self, leader: &IdentityId, term: u64, at: Timestamp) {
        if let Some(state) = &self.state {
            if &state.leader == leader && state.term == term {
                return;
            }
        }
        info!(leader = %leader, term, "leader tenure started");
        self.state = Some(LeaderTenureState {
            leader: leader.clone(),
            term,
            since: at,
        });
    }

    /// Forget the current leader.
    pub fn clear(&mut self) {
        self.state = None;
    }

    /// Compare elapsed tenure against the maximum.
    pub fn check(&self, now: Timestamp) -> TenureCheck {
        let Some(state) = &self.state else {
            return TenureCheck::NoLeader;
        };
        let held_for = now - state.since;
        if held_for > self.max_tenure {
            warn!(
                leader = %state.leader,
                term = state.term,
                held_secs = held_for.num_seconds(),
                "leader tenure exceeded"
            );
            TenureCheck::StepDownRequired {
                leader: state.leader.clone(),
                term: state.term,
                held_for,
            }
        } else {
            TenureCheck::WithinTenure {
                remaining: self.max_tenure - held_for,
            }
        }
    }
}
