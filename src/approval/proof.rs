//! Multi-signature proof of an approved operation.
//!
//! A proof is re-verifiable by anyone holding the approvers' public keys:
//! verification reads only the operation hash, the (identity, signature)
//! pairs and a key lookup.

use crate::approval::policy::{ApprovalPolicy, ThresholdRule};
use crate::core::{Hash256, IdentityId, Result, Timestamp};
use crate::identity::crypto::sha3_256_multi;
use crate::identity::{PublicKeyLookup, SignatureService};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One approving signature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofSignature {
    /// Approver identity
    pub approver: IdentityId,
    /// Signature over the operation hash
    pub signature: Vec<u8>,
    /// When the approval was recorded
    pub signed_at: Timestamp,
    /// Weight the approval carried
    pub weight: u32,
}

/// Bundle of signatures that together meet an approval threshold.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiSigProof {
    /// Request the proof finalizes
    pub request_id: String,
    /// Hash every signature covers
    pub operation_hash: Hash256,
    /// Approvals ordered by time, then identity
    pub signatures: Vec<ProofSignature>,
    /// Points that were required at finalization
    pub required: u64,
    /// Points collected
    pub collected: u64,
    /// Commitment over the ordered (identity, signature) list
    pub aggregate: Option<Hash256>,
}

/// Outcome of verifying a proof.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProofVerification {
    /// Threshold met by valid signatures and commitment intact
    pub valid: bool,
    /// Distinct approvers whose signatures verified
    pub valid_signatures: usize,
    /// Weight carried by those approvers
    pub valid_points: u64,
    /// Threshold checked against
    pub required: u64,
    /// Approvers whose signatures failed or were duplicated
    pub rejected: Vec<IdentityId>,
    /// Commitment check, when a commitment is present
    pub aggregate_valid: Option<bool>,
}

impl MultiSigProof {
    pub(crate) fn assemble(
        request_id: &str,
        operation_hash: Hash256,
        mut signatures: Vec<ProofSignature>,
        required: u64,
    ) -> Self {
        signatures.sort_by(|a, b| {
            a.signed_at
                .cmp(&b.signed_at)
                .then_with(|| a.approver.cmp(&b.approver))
        });
        let collected = signatures.iter().map(|s| s.weight as u64).sum();
        let aggregate = Some(Self::commitment(&operation_hash, &signatures));

        Self {
            request_id: request_id.to_string(),
            operation_hash,
            signatures,
            required,
            collected,
            aggregate,
        }
    }

    /// SHA3 commitment over the operation hash and the ordered signatures.
    pub fn commitment(operation_hash: &Hash256, signatures: &[ProofSignature]) -> Hash256 {
        let mut chunks: Vec<&[u8]> = Vec::with_capacity(2 + signatures.len() * 3);
        chunks.push(b"regent.proof.v1");
        chunks.push(operation_hash.as_bytes());
        for entry in signatures {
            chunks.push(entry.approver.as_str().as_bytes());
            chunks.push(&[0u8]);
            chunks.push(&entry.signature);
        }
        sha3_256_multi(&chunks)
    }

    /// Number of signatures carried.
    pub fn signature_count(&self) -> usize {
        self.signatures.len()
    }

    /// Verify that at least `required` distinct approvers signed the
    /// operation hash. Each valid signature counts once; the weights and
    /// threshold recorded in the proof are not trusted.
    pub fn verify(
        &self,
        service: &dyn SignatureService,
        keys: &dyn PublicKeyLookup,
        required: usize,
    ) -> ProofVerification {
        self.verify_with(service, keys, required as u64, |_| Some(1))
    }

    /// Verify against a policy: weights and eligibility come from the
    /// policy, never from the proof.
    pub fn verify_against_policy(
        &self,
        service: &dyn SignatureService,
        keys: &dyn PublicKeyLookup,
        policy: &ApprovalPolicy,
    ) -> ProofVerification {
        let required = match &policy.rule {
            ThresholdRule::DynamicQuorum {
                min_respondents, ..
            } => self.required.max(*min_respondents as u64 / 2 + 1),
            _ => policy.required_points(),
        };
        self.verify_with(service, keys, required, |entry| {
            policy
                .is_eligible(&entry.approver)
                .then(|| policy.weight_of(&entry.approver))
        })
    }

    fn verify_with(
        &self,
        service: &dyn SignatureService,
        keys: &dyn PublicKeyLookup,
        required: u64,
        weight_of: impl Fn(&ProofSignature) -> Option<u32>,
    ) -> ProofVerification {
        let mut seen = HashSet::new();
        let mut valid_signatures = 0;
        let mut valid_points = 0u64;
        let mut rejected = Vec::new();

        for entry in &self.signatures {
            let accepted = seen.insert(entry.approver.clone())
                && keys.public_key(&entry.approver).is_some_and(|key| {
                    service.verify(self.operation_hash.as_bytes(), &entry.signature, &key)
                });
            match (accepted, weight_of(entry)) {
                (true, Some(weight)) => {
                    valid_signatures += 1;
                    valid_points += weight as u64;
                }
                _ => rejected.push(entry.approver.clone()),
            }
        }

        let aggregate_valid = self
            .aggregate
            .as_ref()
            .map(|c| *c == Self::commitment(&self.operation_hash, &self.signatures));

        ProofVerification {
            valid: required > 0
                && valid_signatures > 0
                && valid_points >= required
                && aggregate_valid != Some(false),
            valid_signatures,
            valid_points,
            required,
            rejected,
            aggregate_valid,
        }
    }

    /// Compact text form (bincode, base64).
    pub fn encode(&self) -> Result<String> {
        use base64::Engine;
        let bytes = bincode::serialize(self)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    /// Parse the compact text form.
    pub fn decode(encoded: &str) -> Result<Self> {
        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD.decode(encoded)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Count distinct identities whose signature over `operation_hash`
/// verifies, and compare with `required`.
pub fn threshold_met<'a>(
    service: &dyn SignatureService,
    keys: &dyn PublicKeyLookup,
    operation_hash: &Hash256,
    signatures: impl IntoIterator<Item = (&'a IdentityId, &'a [u8])>,
    required: usize,
) -> bool {
    let mut valid = HashSet::new();
    for (id, signature) in signatures {
        if let Some(key) = keys.public_key(id) {
            if service.verify(operation_hash.as_bytes(), signature, &key) {
                valid.insert(id);
            }
        }
    }
    required > 0 && valid.len() >= required
}
