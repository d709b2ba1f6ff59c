//! Governance Module
//!
//! Single entry point binding the safeguards together:
//! - Governance facade for the consensus loop and operator callers
//! - Step-down sink and operational event bus

pub mod events;
pub mod facade;

pub use events::{
    EventBus, GovernanceEvent, RecordingSink, StepDownReason, StepDownRequest, StepDownSink,
    TracingSink,
};
pub use facade::{GovernanceBuilder, GovernanceFacade, RevocationDescriptor};
