//! Single-use key pairs that bind one verification attempt.
//!
//! The key's digest is what the identity provider embeds as its nonce and
//! what the proof exposes as the ephemeral commitment, so an assertion or a
//! proof obtained in one attempt cannot be replayed in another.

use ark_bn254::{Fr, G1Affine, G1Projective};
use ark_ec::{CurveGroup, Group};
use ark_ff::{PrimeField, Zero};
use rand::{rngs::OsRng, RngCore};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use zeroize::Zeroize;

use crate::clock::Clock;
use crate::error::ErrorKind;
use crate::hash::{base_to_scalar, field_to_hex, PoseidonHasher};

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("entropy source failure: {0}")]
    Entropy(#[from] rand::Error),
}

impl KeyError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::EntropyFailure
    }
}

/// Key pair owned by exactly one verification attempt.
pub struct EphemeralKey {
    private_scalar: Fr,
    pub public_point: G1Affine,
    pub salt: Fr,
    /// Unix seconds after which the key is dead.
    pub expiry: u64,
    /// `Poseidon(x, y, salt, expiry)`; the attempt's binding value.
    pub public_key_digest: Fr,
}

impl EphemeralKey {
    /// Build a key from its secret parts.
    pub fn derive(private_scalar: Fr, salt: Fr, expiry: u64, hasher: &PoseidonHasher) -> Self {
        let public_point = (G1Projective::generator() * private_scalar).into_affine();
        let public_key_digest = hasher.hash_many(&[
            base_to_scalar(&public_point.x),
            base_to_scalar(&public_point.y),
            salt,
            Fr::from(expiry),
        ]);

        Self {
            private_scalar,
            public_point,
            salt,
            expiry,
            public_key_digest,
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expiry
    }

    /// Nonce handed to the identity provider.
    pub fn nonce(&self) -> String {
        field_to_hex(&self.public_key_digest)
    }

    /// Whether `point` is the public half of this key.
    pub fn matches_public_point(&self, point: &G1Affine) -> bool {
        (G1Projective::generator() * self.private_scalar).into_affine() == *point
    }
}

impl std::fmt::Debug for EphemeralKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKey")
            .field("private_scalar", &"<redacted>")
            .field("expiry", &self.expiry)
            .field("public_key_digest", &self.nonce())
            .finish()
    }
}

impl Zeroize for EphemeralKey {
    fn zeroize(&mut self) {
        self.private_scalar.zeroize();
        self.salt.zeroize();
    }
}

impl Drop for EphemeralKey {
    fn drop(&mut self) {
        self.zeroize();
    }
}

/// Issues fresh ephemeral keys.
#[derive(Clone)]
pub struct EphemeralKeyManager {
    validity: Duration,
    clock: Arc<dyn Clock>,
    hasher: PoseidonHasher,
}

impl EphemeralKeyManager {
    pub fn new(validity: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            validity,
            clock,
            hasher: PoseidonHasher::new(),
        }
    }

    /// Generate a key valid for the configured window from now.
    #[instrument(level = "debug", skip(self))]
    pub fn generate(&self) -> Result<EphemeralKey, KeyError> {
        let private_scalar = loop {
            let candidate = random_scalar()?;
            if !candidate.is_zero() {
                break candidate;
            }
        };
        let salt = random_scalar()?;
        let expiry = self.clock.now() + self.validity.as_secs();

        let key = EphemeralKey::derive(private_scalar, salt, expiry, &self.hasher);
        tracing::debug!(expiry, "generated ephemeral key");
        Ok(key)
    }
}

fn random_scalar() -> Result<Fr, KeyError> {
    let mut bytes = [0u8; 64];
    let filled = OsRng.try_fill_bytes(&mut bytes);
    let scalar = Fr::from_le_bytes_mod_order(&bytes);
    bytes.zeroize();
    filled?;
    Ok(scalar)
}
