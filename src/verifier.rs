//! Groth16 proof verification for domain membership proofs.

use ark_bn254::Bn254;
use ark_groth16::{Groth16, PreparedVerifyingKey, VerifyingKey};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use ark_snark::SNARK;
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::prover::Proof;

/// Result type for verifier operations.
pub type VerifierResult<T> = Result<T, VerifierError>;

/// Errors that can occur during verification.
#[derive(Debug, thiserror::Error)]
pub enum VerifierError {
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    #[error("Invalid proof format: {0}")]
    InvalidProof(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Checks proofs against a pinned verifying key.
pub trait ProofVerifier: Send + Sync {
    /// Id of the circuit whose proofs this verifier accepts.
    fn circuit_id(&self) -> &str;

    /// `Ok(false)` for a well-formed proof that does not verify.
    fn verify(&self, proof: &Proof) -> VerifierResult<bool>;
}

/// Circuit id: hex of the first 16 bytes of SHA-256 over the compressed
/// verifying key.
pub fn circuit_id(vk: &VerifyingKey<Bn254>) -> VerifierResult<String> {
    let mut bytes = Vec::new();
    vk.serialize_compressed(&mut bytes)
        .map_err(|e| VerifierError::SerializationError(e.to_string()))?;
    Ok(hex::encode(&Sha256::digest(&bytes)[..16]))
}

/// Verifier for domain membership proofs.
pub struct Groth16Verifier {
    /// Prepared verifying key for fast verification.
    prepared_vk: PreparedVerifyingKey<Bn254>,
    /// Original verifying key (for serialization).
    verifying_key: VerifyingKey<Bn254>,
    circuit_id: String,
}

impl Groth16Verifier {
    /// Create a new verifier from a verifying key.
    pub fn new(vk: VerifyingKey<Bn254>) -> VerifierResult<Self> {
        let prepared_vk = Groth16::<Bn254>::process_vk(&vk)
            .map_err(|e| VerifierError::VerificationFailed(e.to_string()))?;
        Ok(Self {
            prepared_vk,
            circuit_id: circuit_id(&vk)?,
            verifying_key: vk,
        })
    }

    /// Get a reference to the verifying key.
    pub fn verifying_key(&self) -> &VerifyingKey<Bn254> {
        &self.verifying_key
    }

    /// Save verifying key to file.
    pub fn save(&self, path: &Path) -> VerifierResult<()> {
        let mut bytes = Vec::new();
        self.verifying_key
            .serialize_compressed(&mut bytes)
            .map_err(|e| VerifierError::SerializationError(e.to_string()))?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Load verifier from file.
    pub fn load(path: &Path) -> VerifierResult<Self> {
        let bytes = std::fs::read(path)?;
        let vk = VerifyingKey::deserialize_compressed(&bytes[..])
            .map_err(|e| VerifierError::SerializationError(e.to_string()))?;
        Self::new(vk)
    }
}

impl ProofVerifier for Groth16Verifier {
    fn circuit_id(&self) -> &str {
        &self.circuit_id
    }

    fn verify(&self, proof: &Proof) -> VerifierResult<bool> {
        let groth16_proof = ark_groth16::Proof::<Bn254>::deserialize_compressed(&proof.bytes[..])
            .map_err(|e| VerifierError::InvalidProof(e.to_string()))?;

        Groth16::<Bn254>::verify_with_processed_vk(
            &self.prepared_vk,
            proof.public_inputs.as_slice(),
            &groth16_proof,
        )
        .map_err(|e| VerifierError::VerificationFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitInputs;
    use crate::prover::test_support::groth16;
    use crate::prover::ProvingBackend;
    use ark_bn254::Fr;

    async fn placeholder_proof() -> Proof {
        let (backend, _) = groth16();
        let (bytes, public_inputs) = backend.prove(CircuitInputs::placeholder()).await.unwrap();
        Proof {
            bytes,
            public_inputs,
        }
    }

    #[tokio::test]
    async fn test_verify_valid_proof() {
        let (backend, vk) = groth16();
        let verifier = Groth16Verifier::new(vk.clone()).unwrap();

        assert_eq!(verifier.circuit_id(), backend.circuit_id());
        assert!(verifier.verify(&placeholder_proof().await).unwrap());
    }

    #[tokio::test]
    async fn test_verify_with_altered_input() {
        let (_, vk) = groth16();
        let verifier = Groth16Verifier::new(vk.clone()).unwrap();

        let mut proof = placeholder_proof().await;
        proof.public_inputs.as_mut_slice()[0] += Fr::from(1u64);
        assert!(!verifier.verify(&proof).unwrap());
    }

    #[tokio::test]
    async fn test_garbage_bytes_rejected() {
        let (_, vk) = groth16();
        let verifier = Groth16Verifier::new(vk.clone()).unwrap();

        let mut proof = placeholder_proof().await;
        proof.bytes = vec![0xff; 16];
        assert!(matches!(
            verifier.verify(&proof),
            Err(VerifierError::InvalidProof(_))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let (_, vk) = groth16();
        let verifier = Groth16Verifier::new(vk.clone()).unwrap();

        let path = std::env::temp_dir().join(format!("zk-domain-vk-{}.bin", std::process::id()));
        verifier.save(&path).unwrap();
        let loaded = Groth16Verifier::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.circuit_id(), verifier.circuit_id());
    }
}
