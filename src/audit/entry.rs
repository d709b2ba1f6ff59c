//! Audit entry structure.
//!
//! One record per consensus round, keyed by (leader, term, index).

use crate::core::{Hash256, IdentityId, ReplicaId, Timestamp};
use crate::identity::sha3_256_multi;
use serde::{Deserialize, Serialize};

/// Monotonic entry identifier, assigned by the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId(pub u64);

impl EntryId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The (leader, term, index) tuple a round is identified by.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoundKey {
    /// Leader that authored the round
    pub leader: IdentityId,
    /// Term number
    pub term: u64,
    /// Log index
    pub index: u64,
}

impl std::fmt::Display for RoundKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.leader, self.term, self.index)
    }
}

/// How sure a detection is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    /// Every known replica reported in time and at least two disagree
    Clear,
    /// Disagreement while some replica was unreachable or late
    Ambiguous,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Clear => write!(f, "clear"),
            Severity::Ambiguous => write!(f, "ambiguous"),
        }
    }
}

/// What the entry records.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Replicas agreed on the round's hash
    Round { replicas: usize },
    /// Replicas disagreed
    Detection {
        divergent: Vec<(ReplicaId, Hash256)>,
        severity: Severity,
        equivocation: bool,
    },
    /// Fewer than two timely reports
    Inconclusive { reported: usize },
}

impl EntryKind {
    pub fn label(&self) -> &'static str {
        match self {
            EntryKind::Round { .. } => "round",
            EntryKind::Detection { .. } => "detection",
            EntryKind::Inconclusive { .. } => "inconclusive",
        }
    }

    pub fn is_detection(&self) -> bool {
        matches!(self, EntryKind::Detection { .. })
    }
}

/// An audit ledger entry. Never mutated after append.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Ledger-assigned ID
    pub id: EntryId,
    /// Entry kind
    pub kind: EntryKind,
    /// Round identity
    pub round: RoundKey,
    /// Content hash of the round (plurality hash on detections)
    pub content_hash: Hash256,
    /// Leader's signature over the content hash, as reported
    pub leader_signature: Vec<u8>,
    /// When the entry was recorded
    pub recorded_at: Timestamp,
}

impl AuditEntry {
    /// Digest over the entry's fields, for tamper checks on archived copies.
    pub fn digest(&self) -> Hash256 {
        let id = self.id.0.to_be_bytes();
        let term = self.round.term.to_be_bytes();
        let index = self.round.index.to_be_bytes();
        let recorded = self.recorded_at.to_rfc3339();
        sha3_256_multi(&[
            &id[..],
            self.kind.label().as_bytes(),
            self.round.leader.as_str().as_bytes(),
            &term[..],
            &index[..],
            &self.content_hash.as_bytes()[..],
            self.leader_signature.as_slice(),
            recorded.as_bytes(),
        ])
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> crate::core::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> crate::core::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
