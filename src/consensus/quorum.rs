//! Client-side quorum verification.
//!
//! Queries a set of replicas concurrently for the hash they hold at an index
//! and accepts a hash only when enough of them agree. The verdict depends on
//! the collected response set alone, never on arrival order, and a failed
//! verification has no side effect.

use crate::config::QuorumConfig;
use crate::consensus::replica::ReplicaLogView;
use crate::core::{Error, Hash256, ReplicaId, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Fraction of queried replicas that must agree.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuorumFraction {
    /// Strictly more than half
    #[default]
    Majority,
    /// At least `numerator / denominator`, rounded up
    AtLeast { numerator: u32, denominator: u32 },
}

impl QuorumFraction {
    /// Agreeing replicas required out of `queried`.
    pub fn required(&self, queried: usize) -> usize {
        match self {
            QuorumFraction::Majority => queried / 2 + 1,
            QuorumFraction::AtLeast {
                numerator,
                denominator,
            } => {
                let n = queried as u64 * *numerator as u64;
                let d = (*denominator).max(1) as u64;
                (n.div_ceil(d) as usize).max(1)
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let QuorumFraction::AtLeast {
            numerator,
            denominator,
        } = self
        {
            if *denominator == 0 || *numerator == 0 || numerator > denominator {
                return Err(Error::Config(format!(
                    "quorum fraction {}/{} must be in (0, 1]",
                    numerator, denominator
                )));
            }
        }
        Ok(())
    }
}

/// An accepted hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumAnswer {
    /// Log index queried
    pub index: u64,
    /// Agreed hash
    pub hash: Hash256,
    /// Replicas reporting the agreed hash
    pub corroborating: usize,
    /// Replicas required to agree
    pub required: usize,
    /// Replicas queried
    pub queried: usize,
    /// Replicas that answered in time
    pub responded: usize,
}

/// Quorum verifier over a fixed replica set.
pub struct QuorumVerifier {
    replicas: Vec<Arc<dyn ReplicaLogView>>,
    fraction: QuorumFraction,
    timeout: Duration,
    sample_size: Option<usize>,
}

impl QuorumVerifier {
    pub fn new(replicas: Vec<Arc<dyn ReplicaLogView>>, config: &QuorumConfig) -> Self {
        Self {
            replicas,
            fraction: config.fraction.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            sample_size: config.sample_size,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    /// Query replicas for `index` and accept a hash under `fraction`
    /// (the configured default when `None`).
    pub async fn query_with_quorum(
        &self,
        index: u64,
        fraction: Option<QuorumFraction>,
    ) -> Result<QuorumAnswer> {
        let fraction = fraction.unwrap_or_else(|| self.fraction.clone());
        fraction.validate()?;
        let subset = self.select();
        if subset.is_empty() {
            return Err(Error::InvalidOperation("no replicas to query".into()));
        }
        let queried = subset.len();
        let required = fraction.required(queried);

        let mut pending: FuturesUnordered<_> = subset
            .into_iter()
            .map(|replica| async move {
                let result = replica.hash_at(index).await;
                (replica.replica_id().clone(), result)
            })
            .collect();

        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut responses = BTreeMap::new();
        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some((replica, Ok(hash)))) => {
                    responses.insert(replica, hash);
                }
                Ok(Some((replica, Err(e)))) => {
                    debug!(replica = %replica, index, error = %e, "replica query failed");
                }
                Ok(None) => break,
                Err(_) => {
                    debug!(index, outstanding = pending.len(), "quorum deadline elapsed");
                    break;
                }
            }
        }

        decide(index, queried, required, &responses)
    }

    fn select(&self) -> Vec<Arc<dyn ReplicaLogView>> {
        match self.sample_size {
            Some(k) if k < self.replicas.len() => self
                .replicas
                .choose_multiple(&mut rand::thread_rng(), k)
                .cloned()
                .collect(),
            _ => self.replicas.clone(),
        }
    }
}

/// Verdict over a collected response map. Replicas absent from the map
/// failed or timed out.
pub fn decide(
    index: u64,
    queried: usize,
    required: usize,
    responses: &BTreeMap<ReplicaId, Option<Hash256>>,
) -> Result<QuorumAnswer> {
    let mut counts: BTreeMap<&Hash256, usize> = BTreeMap::new();
    for hash in responses.values().flatten() {
        *counts.entry(hash).or_default() += 1;
    }
    let best = counts.values().copied().max().unwrap_or(0);
    let mut top = counts.iter().filter(|(_, n)| **n == best);
    let unique_top = match (top.next(), top.next()) {
        (Some((hash, _)), None) => Some((*hash).clone()),
        _ => None,
    };

    if let Some(hash) = unique_top.filter(|_| best >= required) {
        return Ok(QuorumAnswer {
            index,
            hash,
            corroborating: best,
            required,
            queried,
            responded: responses.len(),
        });
    }

    let missing = queried.saturating_sub(responses.len());
    if best < required && best + missing >= required {
        return Err(Error::Timeout {
            index,
            responded: responses.len(),
            queried,
        });
    }
    Err(Error::QuorumFailed {
        index,
        best,
        required,
        queried,
    })
}
