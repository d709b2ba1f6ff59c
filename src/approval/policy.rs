//! Approval policies and the policy registry.
//!
//! A policy is validated once when it enters the registry and is shared as
//! an `Arc` afterwards; requests reference it by [`PolicyId`].

use crate::core::{Error, IdentityId, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Upper bound on the eligible-approver set.
pub const MAX_APPROVERS: usize = 64;

/// Upper bound on a single approver weight.
pub const MAX_WEIGHT: u32 = 1_000;

/// Kind of privileged operation a policy governs.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// Remove the current consensus leader
    RevokeLeader,
    /// Promote an identity to administrator
    PromoteAdmin,
    /// Grant a capability to an identity
    GrantCapability,
    /// Roll replicated state back to an earlier index
    Rollback,
    /// Deployment-specific operation
    Custom(String),
}

impl OperationKind {
    /// Stable label, also fed into the operation hash.
    pub fn label(&self) -> &str {
        match self {
            OperationKind::RevokeLeader => "revoke_leader",
            OperationKind::PromoteAdmin => "promote_admin",
            OperationKind::GrantCapability => "grant_capability",
            OperationKind::Rollback => "rollback",
            OperationKind::Custom(name) => name.as_str(),
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Policy identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolicyId(pub String);

impl PolicyId {
    pub fn new(id: &str) -> Self {
        Self(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PolicyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the approval threshold is computed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThresholdRule {
    /// m-of-n: `required` approvals, each worth one point
    Fixed { required: u32 },
    /// Sum of approver weights must reach `required_points`.
    /// Approvers missing from `weights` count 1.
    Weighted {
        required_points: u64,
        weights: BTreeMap<IdentityId, u32>,
    },
    /// `fallback_required` approvals while the availability window is open;
    /// afterwards a majority of those who responded, once at least
    /// `min_respondents` have responded.
    DynamicQuorum {
        fallback_required: u32,
        availability_window_secs: u64,
        min_respondents: u32,
    },
}

/// Immutable approval policy for one operation kind.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    /// Policy ID
    pub id: PolicyId,
    /// Operation kind governed
    pub kind: OperationKind,
    /// Eligible approvers
    pub approvers: Vec<IdentityId>,
    /// Threshold function
    pub rule: ThresholdRule,
    /// Denials needed to reject; derived from the rule when unset
    pub deny_threshold: Option<u32>,
    /// Time from creation to deadline
    pub timeout_secs: u64,
    /// Permission the initiator must hold
    pub required_permission: String,
}

impl ApprovalPolicy {
    fn base(id: &str, kind: OperationKind, approvers: &[&str], rule: ThresholdRule) -> Self {
        let required_permission = format!("governance.{}", kind.label());
        Self {
            id: PolicyId::new(id),
            kind,
            approvers: approvers.iter().map(|a| IdentityId::new(a)).collect(),
            rule,
            deny_threshold: None,
            timeout_secs: 3600,
            required_permission,
        }
    }

    /// m-of-n policy.
    pub fn fixed(id: &str, kind: OperationKind, approvers: &[&str], required: u32) -> Self {
        Self::base(id, kind, approvers, ThresholdRule::Fixed { required })
    }

    /// Weighted-points policy.
    pub fn weighted(
        id: &str,
        kind: OperationKind,
        approvers: &[&str],
        weights: &[(&str, u32)],
        required_points: u64,
    ) -> Self {
        let weights = weights
            .iter()
            .map(|(a, w)| (IdentityId::new(a), *w))
            .collect();
        Self::base(
            id,
            kind,
            approvers,
            ThresholdRule::Weighted {
                required_points,
                weights,
            },
        )
    }

    /// Dynamic quorum-of-available policy.
    pub fn dynamic(
        id: &str,
        kind: OperationKind,
        approvers: &[&str],
        fallback_required: u32,
        availability_window_secs: u64,
        min_respondents: u32,
    ) -> Self {
        Self::base(
            id,
            kind,
            approvers,
            ThresholdRule::DynamicQuorum {
                fallback_required,
                availability_window_secs,
                min_respondents,
            },
        )
    }

    /// Set an explicit denial threshold.
    pub fn with_deny_threshold(mut self, deny_threshold: u32) -> Self {
        self.deny_threshold = Some(deny_threshold);
        self
    }

    /// Set the timeout.
    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Set the permission the initiator must hold.
    pub fn with_permission(mut self, permission: &str) -> Self {
        self.required_permission = permission.to_string();
        self
    }

    pub fn is_eligible(&self, id: &IdentityId) -> bool {
        self.approvers.contains(id)
    }

    /// Weight of one approver's decision.
    pub fn weight_of(&self, id: &IdentityId) -> u32 {
        match &self.rule {
            ThresholdRule::Weighted { weights, .. } => weights.get(id).copied().unwrap_or(1),
            _ => 1,
        }
    }

    /// Sum of all eligible approvers' weights.
    pub fn total_points(&self) -> u64 {
        self.approvers.iter().map(|a| self.weight_of(a) as u64).sum()
    }

    /// Points required before any dynamic recomputation.
    pub fn required_points(&self) -> u64 {
        match &self.rule {
            ThresholdRule::Fixed { required } => *required as u64,
            ThresholdRule::Weighted {
                required_points, ..
            } => *required_points,
            ThresholdRule::DynamicQuorum {
                fallback_required,
                ..
            } => *fallback_required as u64,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self.rule, ThresholdRule::DynamicQuorum { .. })
    }

    /// Denials that reject a request.
    ///
    /// When unset this is the smallest number of denials after which the
    /// remaining approvers can no longer reach the approval threshold.
    pub fn effective_deny_threshold(&self) -> u32 {
        if let Some(explicit) = self.deny_threshold {
            return explicit;
        }
        let mut weights: Vec<u64> = self
            .approvers
            .iter()
            .map(|a| self.weight_of(a) as u64)
            .collect();
        weights.sort_unstable();

        let total = self.total_points();
        let required = self.required_points();
        let mut removed = 0u64;
        for (k, weight) in weights.iter().enumerate() {
            removed += weight;
            if total - removed < required {
                return (k + 1) as u32;
            }
        }
        self.approvers.len() as u32
    }

    /// Check structural constraints.
    pub fn validate(&self) -> Result<()> {
        let n = self.approvers.len();
        if n == 0 {
            return Err(self.invalid("no eligible approvers"));
        }
        if n > MAX_APPROVERS {
            return Err(self.invalid(&format!("{} approvers exceeds {}", n, MAX_APPROVERS)));
        }
        let unique: HashSet<&IdentityId> = self.approvers.iter().collect();
        if unique.len() != n {
            return Err(self.invalid("duplicate approver"));
        }
        if self.timeout_secs == 0 {
            return Err(self.invalid("timeout must be positive"));
        }
        if self.required_permission.is_empty() {
            return Err(self.invalid("required permission must be set"));
        }

        match &self.rule {
            ThresholdRule::Fixed { required } => {
                if *required == 0 || *required as usize > n {
                    return Err(self.invalid("required must be in 1..=approvers"));
                }
            }
            ThresholdRule::Weighted {
                required_points,
                weights,
            } => {
                for (id, weight) in weights {
                    if !self.is_eligible(id) {
                        return Err(self.invalid(&format!("weight for non-approver {}", id)));
                    }
                    if *weight == 0 || *weight > MAX_WEIGHT {
                        return Err(self.invalid(&format!("weight {} out of range", weight)));
                    }
                }
                if *required_points == 0 || *required_points > self.total_points() {
                    return Err(self.invalid("required points unreachable"));
                }
            }
            ThresholdRule::DynamicQuorum {
                fallback_required,
                availability_window_secs,
                min_respondents,
            } => {
                if *fallback_required == 0 || *fallback_required as usize > n {
                    return Err(self.invalid("fallback_required must be in 1..=approvers"));
                }
                if *min_respondents == 0 || *min_respondents as usize > n {
                    return Err(self.invalid("min_respondents must be in 1..=approvers"));
                }
                if *availability_window_secs == 0 || *availability_window_secs > self.timeout_secs
                {
                    return Err(self.invalid("availability window must fit inside the timeout"));
                }
            }
        }

        let deny = self.effective_deny_threshold();
        if deny == 0 || deny as usize > n {
            return Err(self.invalid("deny threshold must be in 1..=approvers"));
        }
        Ok(())
    }

    fn invalid(&self, reason: &str) -> Error {
        Error::InvalidPolicy(format!("{}: {}", self.id, reason))
    }
}

/// Read-only store of validated policies.
#[derive(Debug, Default)]
pub struct PolicyRegistry {
    policies: HashMap<PolicyId, Arc<ApprovalPolicy>>,
    by_kind: HashMap<OperationKind, PolicyId>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store a policy. Policies are never replaced.
    pub fn register(&mut self, policy: ApprovalPolicy) -> Result<Arc<ApprovalPolicy>> {
        policy.validate()?;
        if self.policies.contains_key(&policy.id) {
            return Err(Error::InvalidPolicy(format!("{} already registered", policy.id)));
        }
        if let Some(existing) = self.by_kind.get(&policy.kind) {
            return Err(Error::InvalidPolicy(format!(
                "{} already governed by {}",
                policy.kind, existing
            )));
        }
        let policy = Arc::new(policy);
        self.by_kind.insert(policy.kind.clone(), policy.id.clone());
        self.policies.insert(policy.id.clone(), policy.clone());
        Ok(policy)
    }

    pub fn get(&self, id: &PolicyId) -> Option<Arc<ApprovalPolicy>> {
        self.policies.get(id).cloned()
    }

    /// Policy governing an operation kind.
    pub fn for_kind(&self, kind: &OperationKind) -> Option<Arc<ApprovalPolicy>> {
        self.by_kind.get(kind).and_then(|id| self.get(id))
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
