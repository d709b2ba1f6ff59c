//! Governance events and the step-down sink.
//!
//! Byzantine detections and tenure limits are reported here rather than
//! returned as errors from the calls that observe them.

use crate::approval::{OperationKind, RequestId, RequestStatus};
use crate::audit::{ByzantineSuspicion, EntryId, RoundKey};
use crate::core::IdentityId;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Why a leader is asked to step down.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepDownReason {
    /// Held office past the tenure limit
    TenureExceeded { held_secs: i64 },
    /// Clear divergence detected in a round
    ByzantineDetected { entry_id: EntryId },
    /// Approvers signed off on a revocation
    RevocationApproved { request_id: RequestId },
}

/// Step-down request handed to the consensus layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDownRequest {
    /// Leader to step down
    pub leader: IdentityId,
    /// Term it holds
    pub term: u64,
    /// Trigger
    pub reason: StepDownReason,
}

/// Receiver of step-down requests, implemented by the consensus layer.
pub trait StepDownSink: Send + Sync {
    fn request_step_down(&self, request: StepDownRequest);
}

/// Sink that only logs.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl StepDownSink for TracingSink {
    fn request_step_down(&self, request: StepDownRequest) {
        warn!(leader = %request.leader, term = request.term, reason = ?request.reason, "step-down requested");
    }
}

/// Sink that keeps every request it receives.
#[derive(Debug, Default)]
pub struct RecordingSink {
    requests: Mutex<Vec<StepDownRequest>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<StepDownRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl StepDownSink for RecordingSink {
    fn request_step_down(&self, request: StepDownRequest) {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
    }
}

/// Operational event.
#[derive(Clone, Debug)]
pub enum GovernanceEvent {
    /// Replicas disagreed on a round
    ByzantineSuspected(ByzantineSuspicion),
    /// Too few timely reports to judge a round
    RoundInconclusive { round: RoundKey, reported: usize },
    /// Leadership changed
    LeaderChanged { leader: IdentityId, term: u64 },
    /// A step-down was requested
    StepDownRequested(StepDownRequest),
    /// A revocation request was opened for human approval
    RevocationRequested {
        request_id: RequestId,
        leader: IdentityId,
        term: u64,
    },
    /// A request reached a terminal state
    RequestFinalized {
        request_id: RequestId,
        kind: OperationKind,
        status: RequestStatus,
    },
    /// A terminal request could not be archived; retried on the next sweep
    ArchiveFailed { request_id: RequestId, error: String },
}

/// Broadcast fan-out for [`GovernanceEvent`]s.
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<GovernanceEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GovernanceEvent> {
        self.sender.subscribe()
    }

    /// Publish to current subscribers. Events with no subscriber are dropped.
    pub fn publish(&self, event: GovernanceEvent) {
        if self.sender.send(event).is_err() {
            debug!("governance event dropped, no subscribers");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
