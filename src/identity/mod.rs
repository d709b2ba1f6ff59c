//! Identity layer
//!
//! Provides the cryptographic seams the governance layer consumes:
//! - Ed25519 key pairs and SHA3-256 hashing
//! - Public identity directory
//! - Signature service and capability checker traits

pub mod crypto;
pub mod key;
pub mod service;

pub use crypto::{sha3_256, sha3_256_multi, KeyPair};
pub use key::{KeyDirectory, PublicIdentity, PublicKeyLookup};
pub use service::{AllowAll, CapabilityChecker, Ed25519Service, SignatureService, StaticCapabilities};
