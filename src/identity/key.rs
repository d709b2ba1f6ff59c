//! Public identities and the key directory.
//!
//! The directory is the read-only mapping from an identity reference to the
//! public key its signatures must verify against. Proof verification only
//! needs this mapping, never engine state.

use crate::core::{now, Error, IdentityId, Result, Timestamp};
use crate::identity::crypto::{sha3_256, KeyPair};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An identity together with its Ed25519 public key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublicIdentity {
    /// Identity reference
    pub id: IdentityId,
    /// Public key bytes (Ed25519)
    pub public_key: [u8; 32],
    /// Registration timestamp
    pub created: Timestamp,
}

impl PublicIdentity {
    /// Bind a name to a key pair's public half.
    pub fn new(id: &str, keys: &KeyPair) -> Self {
        Self {
            id: IdentityId::new(id),
            public_key: keys.public_key_bytes(),
            created: now(),
        }
    }

    /// Derive an identity name from the public key itself.
    pub fn derived(keys: &KeyPair) -> Self {
        let public_key = keys.public_key_bytes();
        let short_hash = &sha3_256(&public_key).to_hex()[..16];
        Self {
            id: IdentityId(format!("id:regent:{}", short_hash)),
            public_key,
            created: now(),
        }
    }

    /// Public key as base64, for export.
    pub fn public_key_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(self.public_key)
    }
}

impl PartialEq for PublicIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.public_key == other.public_key
    }
}

impl Eq for PublicIdentity {}

/// Lookup from identity to public key.
pub trait PublicKeyLookup: Send + Sync {
    fn public_key(&self, id: &IdentityId) -> Option<[u8; 32]>;
}

/// In-memory identity directory.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeyDirectory {
    identities: HashMap<IdentityId, PublicIdentity>,
}

impl KeyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an identity. Re-registering the same key is a no-op;
    /// binding an existing name to a different key is refused.
    pub fn register(&mut self, identity: PublicIdentity) -> Result<()> {
        if let Some(existing) = self.identities.get(&identity.id) {
            if existing.public_key != identity.public_key {
                return Err(Error::InvalidKeyFormat(format!(
                    "identity {} already bound to a different key",
                    identity.id
                )));
            }
            return Ok(());
        }
        self.identities.insert(identity.id.clone(), identity);
        Ok(())
    }

    pub fn get(&self, id: &IdentityId) -> Option<&PublicIdentity> {
        self.identities.get(id)
    }

    pub fn contains(&self, id: &IdentityId) -> bool {
        self.identities.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

impl PublicKeyLookup for KeyDirectory {
    fn public_key(&self, id: &IdentityId) -> Option<[u8; 32]> {
        self.identities.get(id).map(|i| i.public_key)
    }
}

impl PublicKeyLookup for HashMap<IdentityId, [u8; 32]> {
    fn public_key(&self, id: &IdentityId) -> Option<[u8; 32]> {
        self.get(id).copied()
    }
}
