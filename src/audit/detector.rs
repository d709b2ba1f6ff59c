//! Post-round Byzantine leader detection.
//!
//! After a round closes, each replica reports the content hash it holds for
//! the round's (leader, term, index). Replicas that report late or for a
//! different tuple are excluded. The remaining hashes are compared pairwise;
//! any disagreement is a Byzantine-leader signal.

use crate::audit::entry::{EntryId, EntryKind, RoundKey, Severity};
use crate::audit::ledger::AuditLedger;
use crate::core::{Error, Hash256, IdentityId, ReplicaId, Result, Timestamp};
use crate::identity::SignatureService;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Upper bound on the replica set compared per round.
pub const MAX_REPLICAS: usize = 16;

/// One replica's view of a round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaReport {
    /// Reporting replica
    pub replica: ReplicaId,
    /// Leader the replica attributes the entry to
    pub leader: IdentityId,
    /// Term
    pub term: u64,
    /// Log index
    pub index: u64,
    /// Hash the replica holds
    pub content_hash: Hash256,
    /// Leader's signature over the hash, as received by the replica
    pub leader_signature: Vec<u8>,
    /// When the report arrived
    pub received_at: Timestamp,
}

/// Everything known about a completed round.
#[derive(Clone, Debug)]
pub struct RoundObservation {
    /// Leader of the round
    pub leader: IdentityId,
    /// Term
    pub term: u64,
    /// Log index
    pub index: u64,
    /// When the round closed
    pub closed_at: Timestamp,
    /// Reports collected so far
    pub reports: Vec<ReplicaReport>,
    /// Full replica set expected to report
    pub known_replicas: Vec<ReplicaId>,
    /// Leader's public key, for equivocation checks
    pub leader_key: Option<[u8; 32]>,
}

impl RoundObservation {
    pub fn new(leader: &str, term: u64, index: u64, closed_at: Timestamp) -> Self {
        Self {
            leader: IdentityId::new(leader),
            term,
            index,
            closed_at,
            reports: Vec::new(),
            known_replicas: Vec::new(),
            leader_key: None,
        }
    }

    /// Set the replica set expected to report.
    pub fn with_replicas(mut self, replicas: &[&str]) -> Self {
        self.known_replicas = replicas.iter().map(|r| ReplicaId::new(r)).collect();
        self
    }

    pub fn with_leader_key(mut self, key: [u8; 32]) -> Self {
        self.leader_key = Some(key);
        self
    }

    /// Add a report for this round's tuple.
    pub fn report(
        mut self,
        replica: &str,
        content_hash: Hash256,
        leader_signature: Vec<u8>,
        received_at: Timestamp,
    ) -> Self {
        self.reports.push(ReplicaReport {
            replica: ReplicaId::new(replica),
            leader: self.leader.clone(),
            term: self.term,
            index: self.index,
            content_hash,
            leader_signature,
            received_at,
        });
        self
    }

    pub fn round(&self) -> RoundKey {
        RoundKey {
            leader: self.leader.clone(),
            term: self.term,
            index: self.index,
        }
    }

    fn matches(&self, report: &ReplicaReport) -> bool {
        report.leader == self.leader && report.term == self.term && report.index == self.index
    }
}

/// Evidence that a leader served divergent content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByzantineSuspicion {
    /// Suspected leader
    pub leader: IdentityId,
    /// Term
    pub term: u64,
    /// Log index
    pub index: u64,
    /// Replicas outside the agreeing group, with their hashes
    pub divergent: Vec<(ReplicaId, Hash256)>,
    /// Hash held by the unique plurality, if there is one
    pub plurality: Option<Hash256>,
    /// Clear or ambiguous
    pub severity: Severity,
    /// Leader signature verifies over two distinct hashes
    pub equivocation: bool,
    /// Ledger entry recording the detection
    pub entry_id: EntryId,
}

impl ByzantineSuspicion {
    /// Replicas named by the suspicion.
    pub fn divergent_replicas(&self) -> Vec<&ReplicaId> {
        self.divergent.iter().map(|(r, _)| r).collect()
    }

    pub fn round(&self) -> RoundKey {
        RoundKey {
            leader: self.leader.clone(),
            term: self.term,
            index: self.index,
        }
    }
}

/// Outcome of evaluating one round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoundVerdict {
    /// All timely reports agree
    Consistent { hash: Hash256, entry_id: EntryId },
    /// Fewer than two timely reports
    Inconclusive { reported: usize, entry_id: EntryId },
    /// Timely reports disagree
    Divergent(ByzantineSuspicion),
}

impl RoundVerdict {
    pub fn is_divergent(&self) -> bool {
        matches!(self, RoundVerdict::Divergent(_))
    }

    pub fn entry_id(&self) -> EntryId {
        match self {
            RoundVerdict::Consistent { entry_id, .. }
            | RoundVerdict::Inconclusive { entry_id, .. } => *entry_id,
            RoundVerdict::Divergent(suspicion) => suspicion.entry_id,
        }
    }

    /// Agreed hash, `None` when inconclusive, `ByzantineSuspected` on
    /// divergence.
    pub fn into_result(self) -> Result<Option<Hash256>> {
        match self {
            RoundVerdict::Consistent { hash, .. } => Ok(Some(hash)),
            RoundVerdict::Inconclusive { .. } => Ok(None),
            RoundVerdict::Divergent(s) => Err(Error::ByzantineSuspected {
                leader: s.leader.to_string(),
                term: s.term,
                index: s.index,
                divergent: s
                    .divergent
                    .into_iter()
                    .map(|(r, h)| (r.to_string(), h))
                    .collect(),
            }),
        }
    }
}

/// Compares replica hashes per round and records the verdict in the ledger.
pub struct ByzantineDetector {
    grace_period: chrono::Duration,
    signatures: Arc<dyn SignatureService>,
}

impl ByzantineDetector {
    pub fn new(grace_period_ms: u64, signatures: Arc<dyn SignatureService>) -> Self {
        Self {
            grace_period: chrono::Duration::milliseconds(grace_period_ms as i64),
            signatures,
        }
    }

    pub fn grace_period(&self) -> chrono::Duration {
        self.grace_period
    }

    /// Evaluate a closed round and append the verdict to the ledger.
    pub fn evaluate_round(
        &self,
        ledger: &mut AuditLedger,
        observation: RoundObservation,
    ) -> Result<RoundVerdict> {
        if observation.known_replicas.len() > MAX_REPLICAS {
            return Err(Error::InvalidOperation(format!(
                "{} replicas exceeds {}",
                observation.known_replicas.len(),
                MAX_REPLICAS
            )));
        }

        let timely = self.timely_reports(&observation)?;
        let round = observation.round();
        let first_signature = timely
            .first()
            .map(|r| r.leader_signature.clone())
            .unwrap_or_default();

        if timely.len() < 2 {
            let hash = timely
                .first()
                .map(|r| r.content_hash.clone())
                .unwrap_or_default();
            let entry_id = ledger.append(
                EntryKind::Inconclusive {
                    reported: timely.len(),
                },
                round.clone(),
                hash,
                first_signature,
                observation.closed_at,
            );
            debug!(round = %round, reported = timely.len(), "round inconclusive");
            return Ok(RoundVerdict::Inconclusive {
                reported: timely.len(),
                entry_id,
            });
        }

        if !any_pair_differs(&timely) {
            let hash = timely[0].content_hash.clone();
            let entry_id = ledger.append(
                EntryKind::Round {
                    replicas: timely.len(),
                },
                round,
                hash.clone(),
                first_signature,
                observation.closed_at,
            );
            return Ok(RoundVerdict::Consistent { hash, entry_id });
        }

        let (plurality, divergent) = split_by_plurality(&timely);
        let all_reported = observation.known_replicas.is_empty()
            || observation
                .known_replicas
                .iter()
                .all(|known| timely.iter().any(|r| &r.replica == known));
        let severity = if all_reported {
            Severity::Clear
        } else {
            Severity::Ambiguous
        };
        let equivocation = observation
            .leader_key
            .is_some_and(|key| self.leader_equivocated(&timely, &key));

        let entry_id = ledger.append(
            EntryKind::Detection {
                divergent: divergent.clone(),
                severity,
                equivocation,
            },
            round.clone(),
            plurality.clone().unwrap_or_default(),
            plurality_signature(&timely, plurality.as_ref()),
            observation.closed_at,
        );
        warn!(
            round = %round,
            severity = %severity,
            equivocation,
            divergent = divergent.len(),
            "byzantine leader suspected"
        );

        Ok(RoundVerdict::Divergent(ByzantineSuspicion {
            leader: observation.leader,
            term: observation.term,
            index: observation.index,
            divergent,
            plurality,
            severity,
            equivocation,
            entry_id,
        }))
    }

    /// Reports for this round's tuple that arrived within the grace period,
    /// first report per replica, restricted to the known set when one is
    /// given.
    fn timely_reports<'a>(
        &self,
        observation: &'a RoundObservation,
    ) -> Result<Vec<&'a ReplicaReport>> {
        let deadline = observation.closed_at + self.grace_period;
        let known: HashSet<&ReplicaId> = observation.known_replicas.iter().collect();
        let mut seen = HashSet::new();

        let timely: Vec<&ReplicaReport> = observation
            .reports
            .iter()
            .filter(|r| observation.matches(r) && r.received_at <= deadline)
            .filter(|r| known.is_empty() || known.contains(&r.replica))
            .filter(|r| seen.insert(r.replica.clone()))
            .collect();
        if timely.len() > MAX_REPLICAS {
            return Err(Error::InvalidOperation(format!(
                "{} reporting replicas exceeds {}",
                timely.len(),
                MAX_REPLICAS
            )));
        }
        Ok(timely)
    }

    fn leader_equivocated(&self, reports: &[&ReplicaReport], key: &[u8; 32]) -> bool {
        let signed: HashSet<&Hash256> = reports
            .iter()
            .filter(|r| {
                self.signatures
                    .verify(r.content_hash.as_bytes(), &r.leader_signature, key)
            })
            .map(|r| &r.content_hash)
            .collect();
        signed.len() >= 2
    }
}

/// Leader signature from a report backing the plurality hash, so the
/// detection entry's signature covers its content hash.
fn plurality_signature(reports: &[&ReplicaReport], plurality: Option<&Hash256>) -> Vec<u8> {
    plurality
        .and_then(|hash| reports.iter().find(|r| &r.content_hash == hash))
        .map(|r| r.leader_signature.clone())
        .unwrap_or_default()
}

fn any_pair_differs(reports: &[&ReplicaReport]) -> bool {
    for (i, a) in reports.iter().enumerate() {
        for b in &reports[i + 1..] {
            if a.content_hash != b.content_hash {
                return true;
            }
        }
    }
    false
}

/// Group replicas by hash. Replicas outside the unique largest group are
/// divergent; with no unique largest group every replica is.
fn split_by_plurality(
    reports: &[&ReplicaReport],
) -> (Option<Hash256>, Vec<(ReplicaId, Hash256)>) {
    let mut groups: BTreeMap<&Hash256, usize> = BTreeMap::new();
    for r in reports {
        *groups.entry(&r.content_hash).or_default() += 1;
    }
    let largest = groups.values().copied().max().unwrap_or(0);
    let mut leaders = groups.iter().filter(|(_, n)| **n == largest);
    let plurality = match (leaders.next(), leaders.next()) {
        (Some((hash, _)), None) => Some((*hash).clone()),
        _ => None,
    };

    let divergent = reports
        .iter()
        .filter(|r| plurality.as_ref() != Some(&r.content_hash))
        .map(|r| (r.replica.clone(), r.content_hash.clone()))
        .collect();
    (plurality, divergent)
}
