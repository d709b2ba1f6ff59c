//! # Regent - Byzantine-resistant governance for replicated logs
//!
//! Safeguards layered over a crash-fault-tolerant replication protocol:
//! - **Audit**: post-round comparison of replica hashes with a bounded ledger
//! - **Tenure**: leaders step down after a maximum time in office
//! - **Quorum**: clients accept a log entry only when enough replicas agree
//! - **Approval**: m-of-n signed approvals for sensitive operations
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use regent::approval::{ApprovalPolicy, OperationKind};
//! use regent::config::GovernanceConfig;
//! use regent::governance::GovernanceFacade;
//! use regent::identity::{KeyPair, PublicIdentity};
//!
//! #[tokio::main]
//! async fn main() -> regent::Result<()> {
//!     let facade = GovernanceFacade::builder(GovernanceConfig::default()).build()?;
//!
//!     let alice = KeyPair::generate();
//!     facade.register_identity(PublicIdentity::new("alice", &alice))?;
//!     facade.register_policy(ApprovalPolicy::fixed(
//!         "promote-admin",
//!         OperationKind::PromoteAdmin,
//!         &["alice"],
//!         1,
//!     ))?;
//!
//!     let id = facade.create_request(&OperationKind::PromoteAdmin, "alice", b"promote:bob".to_vec())?;
//!     let hash = facade.get_request(&id).await?.operation_hash;
//!     let outcome = facade.approve(&id, "alice", &alice.sign(hash.as_bytes())).await?;
//!     println!("request {} is {:?}", id, outcome.status);
//!     Ok(())
//! }
//! ```

pub mod approval;
pub mod audit;
pub mod config;
pub mod consensus;
pub mod core;
pub mod governance;
pub mod identity;

pub use core::error::{Error, Result};
