//! Approval Module
//!
//! Multi-party approval for privileged operations:
//! - Policies (m-of-n, weighted, dynamic quorum)
//! - Request state machine with denial fast-path and expiry
//! - Multi-signature proofs

pub mod engine;
pub mod policy;
pub mod proof;
pub mod request;

pub use engine::{ApprovalEngine, DecisionOutcome};
pub use policy::{ApprovalPolicy, OperationKind, PolicyId, PolicyRegistry, ThresholdRule};
pub use proof::{threshold_met, MultiSigProof, ProofSignature, ProofVerification};
pub use request::{ApprovalRequest, Decision, DecisionSlot, RequestId, RequestStatus};
