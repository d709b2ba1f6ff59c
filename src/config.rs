//! Governance layer configuration.
//!
//! Every section has defaults, so a JSON file only needs the keys it wants to
//! override.

use crate::consensus::quorum::QuorumFraction;
use crate::core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    /// Identity used as initiator for requests the layer raises itself
    pub system_identity: String,
    /// Logging setup
    pub logging: LoggingConfig,
    /// Approval workflow
    pub approval: ApprovalConfig,
    /// Audit ledger and Byzantine detection
    pub audit: AuditConfig,
    /// Leader tenure limiting
    pub tenure: TenureConfig,
    /// Client-side quorum reads
    pub quorum: QuorumConfig,
}

impl GovernanceConfig {
    /// Parse from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.system_identity.is_empty() {
            return Err(Error::Config("system_identity must not be empty".into()));
        }
        if self.audit.max_entries == 0 {
            return Err(Error::Config("audit.max_entries must be positive".into()));
        }
        if self.tenure.max_tenure_secs == 0 {
            return Err(Error::Config("tenure.max_tenure_secs must be positive".into()));
        }
        if self.tenure.check_interval_secs == 0 || self.approval.sweep_interval_secs == 0 {
            return Err(Error::Config("tick intervals must be positive".into()));
        }
        if self.quorum.timeout_ms == 0 {
            return Err(Error::Config("quorum.timeout_ms must be positive".into()));
        }
        if let Some(0) = self.quorum.sample_size {
            return Err(Error::Config("quorum.sample_size must be positive".into()));
        }
        self.quorum.fraction.validate()
    }
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            system_identity: "regent:system".to_string(),
            logging: LoggingConfig::default(),
            approval: ApprovalConfig::default(),
            audit: AuditConfig::default(),
            tenure: TenureConfig::default(),
            quorum: QuorumConfig::default(),
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Maximum level (trace, debug, info, warn, error)
    pub level: String,
    /// Emit JSON lines instead of text
    pub json: bool,
    /// Include the module target in each line
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            with_target: true,
        }
    }
}

/// Approval workflow configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Re-check the approver's capability on every decision
    pub revalidate_permissions: bool,
    /// Period of the background expiry sweep
    pub sweep_interval_secs: u64,
    /// Archived terminal requests kept in memory for reads
    pub retained_closed: usize,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            revalidate_permissions: false,
            sweep_interval_secs: 30,
            retained_closed: 1024,
        }
    }
}

/// What to do when a round diverges.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ByzantineResponse {
    /// Step the leader down at once on clear divergence; route ambiguous
    /// divergence to human approval
    AutoRevokeClear,
    /// Route every divergence to human approval
    AlwaysApproval,
    /// Emit events only
    ReportOnly,
}

/// Audit ledger configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Maximum retained entries before rotation
    pub max_entries: usize,
    /// Grace period after round close for replica reports
    pub grace_period_ms: u64,
    /// Response to divergence
    pub response: ByzantineResponse,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            grace_period_ms: 500,
            response: ByzantineResponse::AutoRevokeClear,
        }
    }
}

/// Tenure guard configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TenureConfig {
    /// Maximum time a leader may hold office
    pub max_tenure_secs: u64,
    /// Period of the tenure check tick
    pub check_interval_secs: u64,
}

impl Default for TenureConfig {
    fn default() -> Self {
        Self {
            max_tenure_secs: 3600,
            check_interval_secs: 5,
        }
    }
}

/// Quorum verification configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QuorumConfig {
    /// Fraction of queried replicas that must agree
    pub fraction: QuorumFraction,
    /// Overall deadline for replica responses
    pub timeout_ms: u64,
    /// Query a random subset of this size (all replicas when unset)
    pub sample_size: Option<usize>,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            fraction: QuorumFraction::Majority,
            timeout_ms: 2000,
            sample_size: None,
        }
    }
}
