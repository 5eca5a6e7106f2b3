//! Identity digests and the nullifiers derived from them.
//!
//! `nullifier = Poseidon(identity_digest, NULLIFIER_DOMAIN)`. The derivation
//! takes nothing from the attempt (no ephemeral key, no subject), so one
//! real-world identity always maps to one nullifier.

use ark_bn254::Fr;
use ark_ff::PrimeField;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::hash::{field_from_hex, field_to_bytes, field_to_hex, string_to_field, PoseidonHasher};

/// Domain separation tag for nullifier derivation.
pub const NULLIFIER_DOMAIN_TAG: &str = "zk-domain/nullifier/v1";

const OAUTH_IDENTITY_TAG: &str = "oauth-identity/v1";
const EMAIL_IDENTITY_TAG: &str = "email-identity/v1";

/// Fixed-width digest of a private identity. Never printed.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct IdentityDigest([u8; 32]);

impl IdentityDigest {
    /// Digest of the stable identity fields of a verified id token.
    pub fn from_oauth(issuer: &str, subject: &str, email: &str, hosted_domain: &str) -> Self {
        let mut hasher = Sha256::new();
        for part in [OAUTH_IDENTITY_TAG, issuer, subject, email, hosted_domain] {
            hasher.update((part.len() as u32).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        Self(hasher.finalize().into())
    }

    /// Digest of an email address proven through a one-time code.
    pub fn from_email(email: &str) -> Self {
        let normalized = email.trim().to_lowercase();
        let mut hasher = Sha256::new();
        hasher.update(EMAIL_IDENTITY_TAG.as_bytes());
        hasher.update([0u8]);
        hasher.update(normalized.as_bytes());
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_field(&self) -> Fr {
        Fr::from_be_bytes_mod_order(&self.0)
    }
}

impl std::fmt::Debug for IdentityDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("IdentityDigest(<redacted>)")
    }
}

/// Public value that marks an identity as used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nullifier(pub Fr);

impl Nullifier {
    /// Registry key.
    pub fn to_bytes(&self) -> [u8; 32] {
        field_to_bytes(&self.0)
    }

    pub fn to_hex(&self) -> String {
        field_to_hex(&self.0)
    }
}

impl std::fmt::Display for Nullifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Nullifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Nullifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        field_from_hex(&s)
            .map(Nullifier)
            .map_err(serde::de::Error::custom)
    }
}

/// The domain separation constant as a field element.
pub fn nullifier_domain() -> Fr {
    string_to_field(NULLIFIER_DOMAIN_TAG)
}

/// Derive the nullifier of an identity.
pub fn derive_nullifier(digest: &IdentityDigest, hasher: &PoseidonHasher) -> Nullifier {
    Nullifier(hasher.hash_many(&[digest.to_field(), nullifier_domain()]))
}
