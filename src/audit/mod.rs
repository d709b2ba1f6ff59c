//! Audit Layer
//!
//! Post-round Byzantine detection and its durable record:
//! - Bounded audit ledger with detection pinning
//! - Pairwise replica hash comparison
//! - Archive stores (memory, JSON lines)

pub mod detector;
pub mod entry;
pub mod filter;
pub mod ledger;
pub mod store;

pub use detector::{
    ByzantineDetector, ByzantineSuspicion, ReplicaReport, RoundObservation, RoundVerdict,
    MAX_REPLICAS,
};
pub use entry::{AuditEntry, EntryId, EntryKind, RoundKey, Severity};
pub use filter::AuditFilter;
pub use ledger::AuditLedger;
pub use store::{ArchiveStore, JsonlStore, MemoryStore, StoreType};
