//! Bounded, append-only audit ledger.
//!
//! Entries are kept in append order. Once the size cap is reached the oldest
//! entries are evicted, except detections that are still unresolved: those
//! stay pinned until [`AuditLedger::resolve_detection`] releases them.

use crate::audit::entry::{AuditEntry, EntryId, EntryKind, RoundKey};
use crate::audit::filter::AuditFilter;
use crate::core::{Error, Hash256, Result, Timestamp};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, warn};

/// Audit ledger.
#[derive(Debug)]
pub struct AuditLedger {
    entries: VecDeque<AuditEntry>,
    pinned: HashSet<EntryId>,
    next_id: u64,
    max_entries: usize,
    evicted: u64,
}

impl AuditLedger {
    /// Create a ledger retaining at most `max_entries` unpinned entries.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            pinned: HashSet::new(),
            next_id: 1,
            max_entries: max_entries.max(1),
            evicted: 0,
        }
    }

    /// Append an entry. Detections are pinned.
    pub fn append(
        &mut self,
        kind: EntryKind,
        round: RoundKey,
        content_hash: Hash256,
        leader_signature: Vec<u8>,
        recorded_at: Timestamp,
    ) -> EntryId {
        let id = EntryId(self.next_id);
        self.next_id += 1;
        if kind.is_detection() {
            self.pinned.insert(id);
        }
        self.entries.push_back(AuditEntry {
            id,
            kind,
            round,
            content_hash,
            leader_signature,
            recorded_at,
        });
        self.rotate();
        id
    }

    /// Evict oldest unpinned entries until back under the cap.
    fn rotate(&mut self) {
        while self.entries.len() > self.max_entries {
            let Some(pos) = self
                .entries
                .iter()
                .position(|e| !self.pinned.contains(&e.id))
            else {
                warn!(
                    pinned = self.pinned.len(),
                    cap = self.max_entries,
                    "audit ledger over capacity with unresolved detections"
                );
                return;
            };
            if let Some(evicted) = self.entries.remove(pos) {
                debug!(entry = %evicted.id, round = %evicted.round, "audit entry rotated out");
                self.evicted += 1;
            }
        }
    }

    /// Release a detection so it can rotate out.
    pub fn resolve_detection(&mut self, id: EntryId) -> Result<()> {
        let entry = self
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("audit entry {}", id)))?;
        if !entry.kind.is_detection() {
            return Err(Error::InvalidOperation(format!("{} is not a detection", id)));
        }
        if self.pinned.remove(&id) {
            self.rotate();
        }
        Ok(())
    }

    pub fn get(&self, id: EntryId) -> Option<&AuditEntry> {
        // IDs are strictly increasing along the deque
        self.entries
            .binary_search_by_key(&id, |e| e.id)
            .ok()
            .and_then(|pos| self.entries.get(pos))
    }

    /// Entries recorded for one round.
    pub fn entries_for(&self, round: &RoundKey) -> Vec<&AuditEntry> {
        self.entries.iter().filter(|e| &e.round == round).collect()
    }

    /// Detections not yet resolved.
    pub fn unresolved_detections(&self) -> Vec<&AuditEntry> {
        self.entries
            .iter()
            .filter(|e| self.pinned.contains(&e.id))
            .collect()
    }

    pub fn is_pinned(&self, id: EntryId) -> bool {
        self.pinned.contains(&id)
    }

    /// Query entries.
    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        filter.apply(&self.entries)
    }

    /// Most recent entries, newest first.
    pub fn recent(&self, n: usize) -> Vec<AuditEntry> {
        self.entries.iter().rev().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries rotated out so far.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

impl Default for AuditLedger {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::Severity;
    use crate::core::{now, IdentityId};

    fn round(index: u64) -> RoundKey {
        RoundKey {
            leader: IdentityId::from("n1"),
            term: 1,
            index,
        }
    }

    fn append_round(ledger: &mut AuditLedger, index: u64) -> EntryId {
        ledger.append(
            EntryKind::Round { replicas: 3 },
            round(index),
            Hash256::new([index as u8; 32]),
            Vec::new(),
            now(),
        )
    }

    fn append_detection(ledger: &mut AuditLedger, index: u64) -> EntryId {
        ledger.append(
            EntryKind::Detection {
                divergent: Vec::new(),
                severity: Severity::Clear,
                equivocation: false,
            },
            round(index),
            Hash256::zero(),
            Vec::new(),
            now(),
        )
    }

    #[test]
    fn test_ids_monotonic() {
        let mut ledger = AuditLedger::new(10);
        let a = append_round(&mut ledger, 1);
        let b = append_round(&mut ledger, 2);
        assert!(b > a);
        assert_eq!(ledger.get(b).unwrap().round.index, 2);
    }

    #[test]
    fn test_rotation_evicts_oldest() {
        let mut ledger = AuditLedger::new(3);
        for i in 0..5 {
            append_round(&mut ledger, i);
        }
        assert_eq!(ledger.len(), 3);
        assert_eq!(ledger.evicted(), 2);
        assert!(ledger.entries_for(&round(0)).is_empty());
        assert_eq!(ledger.recent(1)[0].round.index, 4);
    }

    #[test]
    fn test_rotation_keeps_unresolved_detection() {
        let mut ledger = AuditLedger::new(2);
        let detection = append_detection(&mut ledger, 0);
        for i in 1..5 {
            append_round(&mut ledger, i);
        }

        assert!(ledger.get(detection).is_some());
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.unresolved_detections().len(), 1);

        ledger.resolve_detection(detection).unwrap();
        append_round(&mut ledger, 5);
        assert!(ledger.get(detection).is_none());
    }

    #[test]
    fn test_all_pinned_grows_past_cap() {
        let mut ledger = AuditLedger::new(1);
        append_detection(&mut ledger, 1);
        append_detection(&mut ledger, 2);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_resolve_errors() {
        let mut ledger = AuditLedger::new(5);
        let entry = append_round(&mut ledger, 1);
        assert!(matches!(
            ledger.resolve_detection(entry),
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(
            ledger.resolve_detection(EntryId(99)),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_query() {
        let mut ledger = AuditLedger::default();
        append_round(&mut ledger, 1);
        append_detection(&mut ledger, 2);
        append_round(&mut ledger, 3);

        assert_eq!(ledger.query(&AuditFilter::new().detections()).len(), 1);
        assert_eq!(ledger.query(&AuditFilter::new().by_index_range(2, 3)).len(), 2);
    }
}
