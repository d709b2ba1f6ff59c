//! Approval request record.
//!
//! Holds the decision slots, the running counters and the status. All
//! mutators are crate-private and driven by the engine while it holds the
//! request's lock; terminal requests refuse every mutation.

use crate::approval::policy::{ApprovalPolicy, OperationKind, PolicyId, ThresholdRule};
use crate::approval::proof::{MultiSigProof, ProofSignature};
use crate::core::{Hash256, IdentityId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unique request identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new(id: &str) -> Self {
        Self(id.to_string())
    }

    /// Generate a unique ID.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestStatus::Pending => write!(f, "pending"),
            RequestStatus::Approved => write!(f, "approved"),
            RequestStatus::Denied => write!(f, "denied"),
            RequestStatus::Expired => write!(f, "expired"),
        }
    }
}

/// A recorded decision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Approved { signature: Vec<u8> },
    Denied { reason: String },
}

/// Per-approver decision slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionSlot {
    /// Decision, if any
    pub decision: Option<Decision>,
    /// When the decision was recorded
    pub decided_at: Option<Timestamp>,
    /// Weight snapshotted from the policy
    pub weight: u32,
}

/// Which side just moved, so its condition is checked first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Side {
    Approve,
    Deny,
}

/// A threshold that was met.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Resolution {
    pub status: RequestStatus,
    pub required: u64,
}

/// A privileged operation awaiting multi-party approval.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Request ID
    pub id: RequestId,
    /// Governing policy
    pub policy_id: PolicyId,
    /// Operation kind
    pub kind: OperationKind,
    /// Who asked for the operation
    pub initiator: IdentityId,
    /// Opaque operation descriptor
    pub descriptor: Vec<u8>,
    /// Hash approvers sign
    pub operation_hash: Hash256,
    /// Creation time
    pub created_at: Timestamp,
    /// Expiry deadline
    pub deadline: Timestamp,
    /// End of the availability window (dynamic policies)
    pub window_closes_at: Option<Timestamp>,
    slots: BTreeMap<IdentityId, DecisionSlot>,
    approved_points: u64,
    denied_count: u32,
    status: RequestStatus,
    finalized_at: Option<Timestamp>,
    proof: Option<MultiSigProof>,
}

impl ApprovalRequest {
    pub(crate) fn new(
        id: RequestId,
        policy: &ApprovalPolicy,
        initiator: IdentityId,
        descriptor: Vec<u8>,
        operation_hash: Hash256,
        now: Timestamp,
    ) -> Self {
        let slots = policy
            .approvers
            .iter()
            .map(|a| {
                (
                    a.clone(),
                    DecisionSlot {
                        decision: None,
                        decided_at: None,
                        weight: policy.weight_of(a),
                    },
                )
            })
            .collect();
        let window_closes_at = match &policy.rule {
            ThresholdRule::DynamicQuorum {
                availability_window_secs,
                ..
            } => Some(now + chrono::Duration::seconds(*availability_window_secs as i64)),
            _ => None,
        };

        Self {
            id,
            policy_id: policy.id.clone(),
            kind: policy.kind.clone(),
            initiator,
            descriptor,
            operation_hash,
            created_at: now,
            deadline: now + chrono::Duration::seconds(policy.timeout_secs as i64),
            window_closes_at,
            slots,
            approved_points: 0,
            denied_count: 0,
            status: RequestStatus::Pending,
            finalized_at: None,
            proof: None,
        }
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn approved_points(&self) -> u64 {
        self.approved_points
    }

    pub fn denied_count(&self) -> u32 {
        self.denied_count
    }

    pub fn finalized_at(&self) -> Option<Timestamp> {
        self.finalized_at
    }

    pub fn proof(&self) -> Option<&MultiSigProof> {
        self.proof.as_ref()
    }

    pub fn is_eligible(&self, id: &IdentityId) -> bool {
        self.slots.contains_key(id)
    }

    pub fn slot(&self, id: &IdentityId) -> Option<&DecisionSlot> {
        self.slots.get(id)
    }

    pub fn slots(&self) -> impl Iterator<Item = (&IdentityId, &DecisionSlot)> {
        self.slots.iter()
    }

    /// Approvers that recorded any decision.
    pub fn respondents(&self) -> usize {
        self.slots.values().filter(|s| s.decision.is_some()).count()
    }

    /// Weight of approvers that recorded any decision.
    pub fn responded_points(&self) -> u64 {
        self.slots
            .values()
            .filter(|s| s.decision.is_some())
            .map(|s| s.weight as u64)
            .sum()
    }

    pub fn window_closed(&self, now: Timestamp) -> bool {
        self.window_closes_at.is_some_and(|closes| now >= closes)
    }

    /// Transition to Expired if the deadline passed. Returns true only on
    /// the call that performs the transition.
    pub(crate) fn expire_if_due(&mut self, now: Timestamp) -> bool {
        if self.status == RequestStatus::Pending && now > self.deadline {
            self.status = RequestStatus::Expired;
            self.finalized_at = Some(now);
            return true;
        }
        false
    }

    pub(crate) fn record(&mut self, approver: &IdentityId, decision: Decision, now: Timestamp) {
        let Some(slot) = self.slots.get_mut(approver) else {
            return;
        };
        if slot.decision.is_some() {
            return;
        }
        match &decision {
            Decision::Approved { .. } => self.approved_points += slot.weight as u64,
            Decision::Denied { .. } => self.denied_count += 1,
        }
        slot.decision = Some(decision);
        slot.decided_at = Some(now);
    }

    /// Clear a decision and roll back its counter.
    pub(crate) fn clear(&mut self, approver: &IdentityId) -> Option<Decision> {
        let slot = self.slots.get_mut(approver)?;
        let decision = slot.decision.take()?;
        slot.decided_at = None;
        match &decision {
            Decision::Approved { .. } => self.approved_points -= slot.weight as u64,
            Decision::Denied { .. } => self.denied_count -= 1,
        }
        Some(decision)
    }

    /// Approval threshold in effect at `now`.
    pub(crate) fn approval_threshold(&self, policy: &ApprovalPolicy, now: Timestamp) -> u64 {
        if let ThresholdRule::DynamicQuorum {
            min_respondents, ..
        } = &policy.rule
        {
            if self.window_closed(now) && self.respondents() >= *min_respondents as usize {
                return self.responded_points() / 2 + 1;
            }
        }
        policy.required_points()
    }

    fn denial_met(&self, policy: &ApprovalPolicy, now: Timestamp) -> bool {
        if self.denied_count >= policy.effective_deny_threshold() {
            return true;
        }
        if let ThresholdRule::DynamicQuorum {
            min_respondents, ..
        } = &policy.rule
        {
            let respondents = self.respondents();
            return self.window_closed(now)
                && respondents >= *min_respondents as usize
                && self.denied_count as usize * 2 > respondents;
        }
        false
    }

    /// Check both thresholds, the side that just moved first.
    pub(crate) fn resolve(
        &self,
        policy: &ApprovalPolicy,
        now: Timestamp,
        first: Side,
    ) -> Option<Resolution> {
        if self.status.is_terminal() {
            return None;
        }
        let required = self.approval_threshold(policy, now);
        let approved = self.approved_points >= required;
        let denied = self.denial_met(policy, now);

        let pick = |side| match side {
            Side::Approve if approved => Some(Resolution {
                status: RequestStatus::Approved,
                required,
            }),
            Side::Deny if denied => Some(Resolution {
                status: RequestStatus::Denied,
                required,
            }),
            _ => None,
        };
        let second = match first {
            Side::Approve => Side::Deny,
            Side::Deny => Side::Approve,
        };
        pick(first).or_else(|| pick(second))
    }

    /// Move to a terminal state. Approval assembles the proof from every
    /// approving slot.
    pub(crate) fn finalize(&mut self, resolution: Resolution, now: Timestamp) {
        if self.status.is_terminal() {
            return;
        }
        self.status = resolution.status;
        self.finalized_at = Some(now);

        if resolution.status == RequestStatus::Approved {
            let signatures = self
                .slots
                .iter()
                .filter_map(|(id, slot)| match (&slot.decision, slot.decided_at) {
                    (Some(Decision::Approved { signature }), Some(at)) => Some(ProofSignature {
                        approver: id.clone(),
                        signature: signature.clone(),
                        signed_at: at,
                        weight: slot.weight,
                    }),
                    _ => None,
                })
                .collect();
            self.proof = Some(MultiSigProof::assemble(
                self.id.as_str(),
                self.operation_hash.clone(),
                signatures,
                resolution.required,
            ));
        }
    }
}
