//! Consensus Module
//!
//! Safeguards layered over a crash-fault-tolerant replication protocol:
//! - Replica log view consumed from the replication layer
//! - Leader tenure limiting
//! - Client-side quorum verification

pub mod quorum;
pub mod replica;
pub mod tenure;

pub use quorum::{QuorumAnswer, QuorumFraction, QuorumVerifier};
pub use replica::{MemoryReplica, ReplicaLogView};
pub use tenure::{LeaderTenureGuard, LeaderTenureState, TenureCheck};
