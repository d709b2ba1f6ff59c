//! Signature service and capability checker seams.
//!
//! Both are consumed from outside the governance layer. The Ed25519 adapter
//! and the static capability table are the default wiring.

use crate::core::{Hash256, IdentityId};
use crate::identity::crypto::{self, KeyPair};
use std::collections::{HashMap, HashSet};

/// Sign, verify and hash primitives.
pub trait SignatureService: Send + Sync {
    /// Sign `data` with `key`.
    fn sign(&self, data: &[u8], key: &KeyPair) -> Vec<u8>;

    /// Check `signature` over `data` against `public_key`.
    fn verify(&self, data: &[u8], signature: &[u8], public_key: &[u8; 32]) -> bool;

    /// Content digest.
    fn hash(&self, bytes: &[u8]) -> Hash256;
}

/// Ed25519 signatures over SHA3-256 digests.
#[derive(Clone, Copy, Debug, Default)]
pub struct Ed25519Service;

impl SignatureService for Ed25519Service {
    fn sign(&self, data: &[u8], key: &KeyPair) -> Vec<u8> {
        key.sign(data)
    }

    fn verify(&self, data: &[u8], signature: &[u8], public_key: &[u8; 32]) -> bool {
        crypto::verify(public_key, data, signature).is_ok()
    }

    fn hash(&self, bytes: &[u8]) -> Hash256 {
        crypto::sha3_256(bytes)
    }
}

/// Permission lookup provided by the capability layer.
pub trait CapabilityChecker: Send + Sync {
    fn has_permission(&self, identity: &IdentityId, permission: &str) -> bool;
}

/// Grants every permission. Useful when the capability layer sits in front.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl CapabilityChecker for AllowAll {
    fn has_permission(&self, _identity: &IdentityId, _permission: &str) -> bool {
        true
    }
}

/// Fixed identity -> permissions table.
#[derive(Clone, Debug, Default)]
pub struct StaticCapabilities {
    grants: HashMap<IdentityId, HashSet<String>>,
}

impl StaticCapabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant a permission.
    pub fn grant(mut self, identity: &str, permission: &str) -> Self {
        self.grants
            .entry(IdentityId::new(identity))
            .or_default()
            .insert(permission.to_string());
        self
    }
}

impl CapabilityChecker for StaticCapabilities {
    fn has_permission(&self, identity: &IdentityId, permission: &str) -> bool {
        self.grants
            .get(identity)
            .map(|perms| perms.contains(permission))
            .unwrap_or(false)
    }
}
