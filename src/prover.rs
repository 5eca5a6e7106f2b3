//! Groth16 proof generation for domain membership proofs.
//!
//! [`ProofGenerator`] turns a [`DomainClaim`] into circuit inputs and drives
//! a [`ProvingBackend`]. The backend is opaque; [`Groth16Backend`] is the
//! in-process reference backend over [`DomainMembershipCircuit`].

use ark_bn254::{Bn254, Fr};
use ark_groth16::{Groth16, ProvingKey, VerifyingKey};
use ark_relations::r1cs::{ConstraintSynthesizer, ConstraintSystem};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use ark_snark::SNARK;
use ark_std::rand::{CryptoRng, RngCore};
use async_trait::async_trait;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::circuit::{key_to_limbs, CircuitInputs, DomainMembershipCircuit, PublicInputs};
use crate::circuit::layout::MAX_DOMAIN_LENGTH;
use crate::claim::{Attestation, DomainClaim};
use crate::clock::Clock;
use crate::ephemeral::EphemeralKey;
use crate::error::ErrorKind;
use crate::hash::{base_to_scalar, field_to_hex, PoseidonHasher};
use crate::nullifier::{derive_nullifier, Nullifier};
use crate::verifier::{circuit_id, VerifierError};

/// Errors that can occur while generating a proof.
#[derive(Debug, thiserror::Error)]
pub enum ProofError {
    #[error("claim rejected: {0}")]
    ClaimRejected(&'static str),

    #[error("session key expired before the proof was emitted")]
    KeyExpired,

    #[error("proving backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("proving backend rejected the inputs: {0}")]
    BackendRejected(String),

    #[error("proving backend runs circuit {got}, expected {expected}")]
    CircuitMismatch { expected: String, got: String },
}

impl ProofError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProofError::ClaimRejected(_) | ProofError::BackendRejected(_) => {
                ErrorKind::ClaimRejectedByCircuit
            }
            ProofError::KeyExpired => ErrorKind::KeyExpiredDuringProving,
            ProofError::BackendUnavailable(_) => ErrorKind::ProvingBackendUnavailable,
            ProofError::CircuitMismatch { .. } => ErrorKind::CircuitVersionMismatch,
        }
    }
}

/// Failure reported by a proving backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Rejected(String),
}

/// Errors from backend key generation and key files.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("Trusted setup failed: {0}")]
    SetupFailed(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<VerifierError> for SetupError {
    fn from(e: VerifierError) -> Self {
        SetupError::SerializationError(e.to_string())
    }
}

/// Points in proof generation reported to a [`ProgressObserver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvingMilestone {
    ClaimIngested,
    WitnessComputed,
    Proved,
}

/// Receives proving milestones. Must not block.
pub trait ProgressObserver: Send + Sync {
    fn on_milestone(&self, milestone: ProvingMilestone);
}

impl<F> ProgressObserver for F
where
    F: Fn(ProvingMilestone) + Send + Sync,
{
    fn on_milestone(&self, milestone: ProvingMilestone) {
        self(milestone)
    }
}

/// Opaque proving service.
#[async_trait]
pub trait ProvingBackend: Send + Sync {
    /// Id of the circuit this backend proves.
    fn circuit_id(&self) -> String;

    /// Prove `inputs`; returns the proof bytes and the public inputs the
    /// proof commits to.
    async fn prove(&self, inputs: CircuitInputs) -> Result<(Vec<u8>, PublicInputs), BackendError>;
}

/// Serialized proof and the public inputs it verifies against.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "WireProof", into = "WireProof")]
pub struct Proof {
    pub bytes: Vec<u8>,
    pub public_inputs: PublicInputs,
}

impl Proof {
    /// Nullifier at its fixed public input index.
    pub fn nullifier(&self) -> Option<Nullifier> {
        self.public_inputs.nullifier()
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(&self.bytes))
    }
}

/// `{ "proof": "0x..", "public_inputs": ["0x..", ..] }`
#[derive(Serialize, Deserialize)]
struct WireProof {
    proof: String,
    public_inputs: Vec<String>,
}

impl From<Proof> for WireProof {
    fn from(proof: Proof) -> Self {
        WireProof {
            proof: proof.to_hex(),
            public_inputs: proof.public_inputs.to_hex(),
        }
    }
}

impl TryFrom<WireProof> for Proof {
    type Error = hex::FromHexError;

    fn try_from(wire: WireProof) -> Result<Self, Self::Error> {
        let raw = wire.proof.strip_prefix("0x").unwrap_or(&wire.proof);
        Ok(Proof {
            bytes: hex::decode(raw)?,
            public_inputs: PublicInputs::from_hex(&wire.public_inputs)?,
        })
    }
}

/// In-process Groth16 backend.
#[derive(Clone)]
pub struct Groth16Backend {
    /// Groth16 proving key.
    proving_key: Arc<ProvingKey<Bn254>>,
    circuit_id: String,
}

impl Groth16Backend {
    /// Perform trusted setup for the domain circuit.
    ///
    /// Generates the proving and verifying keys. Production keys come from a
    /// multi-party ceremony and are loaded with [`Groth16Backend::load_proving_key`].
    pub fn setup<R: RngCore + CryptoRng>(
        rng: &mut R,
    ) -> Result<(Self, VerifyingKey<Bn254>), SetupError> {
        let circuit = DomainMembershipCircuit::new_empty();

        let (pk, vk) = Groth16::<Bn254>::circuit_specific_setup(circuit, rng)
            .map_err(|e| SetupError::SetupFailed(e.to_string()))?;

        Ok((Self::from_proving_key(pk)?, vk))
    }

    fn from_proving_key(pk: ProvingKey<Bn254>) -> Result<Self, SetupError> {
        Ok(Self {
            circuit_id: circuit_id(&pk.vk)?,
            proving_key: Arc::new(pk),
        })
    }

    pub fn verifying_key(&self) -> &VerifyingKey<Bn254> {
        &self.proving_key.vk
    }

    /// Save proving key to file.
    pub fn save_proving_key(&self, path: &Path) -> Result<(), SetupError> {
        let mut bytes = Vec::new();
        self.proving_key
            .serialize_compressed(&mut bytes)
            .map_err(|e| SetupError::SerializationError(e.to_string()))?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Load proving key from file.
    pub fn load_proving_key(path: &Path) -> Result<Self, SetupError> {
        let bytes = std::fs::read(path)?;
        let pk = ProvingKey::deserialize_compressed(&bytes[..])
            .map_err(|e| SetupError::SerializationError(e.to_string()))?;
        Self::from_proving_key(pk)
    }

    fn prove_blocking(
        pk: &ProvingKey<Bn254>,
        inputs: &CircuitInputs,
    ) -> Result<Vec<u8>, BackendError> {
        let circuit = DomainMembershipCircuit::new_with_witness(inputs);

        // An unsatisfied witness still yields a proof, just one that never verifies
        let cs = ConstraintSystem::<Fr>::new_ref();
        circuit
            .clone()
            .generate_constraints(cs.clone())
            .map_err(|e| BackendError::Rejected(e.to_string()))?;
        if !cs.is_satisfied().map_err(|e| BackendError::Rejected(e.to_string()))? {
            return Err(BackendError::Rejected("witness does not satisfy the circuit".into()));
        }

        let proof = Groth16::<Bn254>::prove(pk, circuit, &mut OsRng)
            .map_err(|e| BackendError::Rejected(e.to_string()))?;

        let mut bytes = Vec::new();
        proof
            .serialize_compressed(&mut bytes)
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        Ok(bytes)
    }
}

#[async_trait]
impl ProvingBackend for Groth16Backend {
    fn circuit_id(&self) -> String {
        self.circuit_id.clone()
    }

    async fn prove(&self, inputs: CircuitInputs) -> Result<(Vec<u8>, PublicInputs), BackendError> {
        let pk = self.proving_key.clone();
        tokio::task::spawn_blocking(move || {
            let bytes = Self::prove_blocking(&pk, &inputs)?;
            Ok((bytes, inputs.public))
        })
        .await
        .map_err(|e| BackendError::Unavailable(format!("prover task failed: {e}")))?
    }
}

/// Ingested claim ready for the backend. Holds private witness values.
#[derive(Debug, Clone)]
pub struct ProvingJob {
    inputs: CircuitInputs,
}

/// Drives a proving backend for one claim at a time.
pub struct ProofGenerator {
    backend: Arc<dyn ProvingBackend>,
    pinned_circuit_id: String,
    timeout: Duration,
    clock: Arc<dyn Clock>,
    hasher: PoseidonHasher,
}

impl ProofGenerator {
    /// `pinned_circuit_id` defaults to the backend's current id.
    pub fn new(
        backend: Arc<dyn ProvingBackend>,
        pinned_circuit_id: Option<String>,
        timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let pinned_circuit_id = pinned_circuit_id.unwrap_or_else(|| backend.circuit_id());
        Self {
            backend,
            pinned_circuit_id,
            timeout,
            clock,
            hasher: PoseidonHasher::new(),
        }
    }

    pub fn pinned_circuit_id(&self) -> &str {
        &self.pinned_circuit_id
    }

    /// Ingest `claim` and prove it.
    pub async fn generate(
        &self,
        claim: DomainClaim,
        key: &EphemeralKey,
        observer: &dyn ProgressObserver,
    ) -> Result<Proof, ProofError> {
        let job = self.ingest(claim, key, observer)?;
        self.prove(&job, key, observer).await
    }

    /// Validate `claim` against `key` and compute the witness. Consumes the claim.
    #[instrument(level = "debug", skip_all, fields(domain = %claim.domain))]
    pub fn ingest(
        &self,
        claim: DomainClaim,
        key: &EphemeralKey,
        observer: &dyn ProgressObserver,
    ) -> Result<ProvingJob, ProofError> {
        if key.is_expired(self.clock.now()) {
            return Err(ProofError::KeyExpired);
        }
        if claim.ephemeral_binding != key.public_key_digest {
            return Err(ProofError::ClaimRejected("claim is bound to a different key"));
        }
        if claim.domain.is_empty() || claim.domain.len() > MAX_DOMAIN_LENGTH {
            return Err(ProofError::ClaimRejected("domain length out of range"));
        }
        if let Attestation::Issuer {
            verifying_key,
            signature,
        } = &claim.attestation
        {
            verifying_key
                .verify_strict(&claim.signed_message(), signature)
                .map_err(|_| ProofError::ClaimRejected("issuer signature does not verify"))?;
        }
        let limbs = key_to_limbs(&claim.attestation.issuer_key_bytes())
            .ok_or(ProofError::ClaimRejected("issuer key too large"))?;
        observer.on_milestone(ProvingMilestone::ClaimIngested);

        let nullifier = derive_nullifier(&claim.identity_digest, &self.hasher);
        let public = PublicInputs::assemble(
            &limbs,
            &claim.domain,
            key.public_key_digest,
            key.expiry,
            &nullifier,
        );
        let inputs = CircuitInputs {
            public,
            identity_digest: claim.identity_digest.to_field(),
            ephemeral_x: base_to_scalar(&key.public_point.x),
            ephemeral_y: base_to_scalar(&key.public_point.y),
            salt: key.salt,
        };
        observer.on_milestone(ProvingMilestone::WitnessComputed);
        debug!("witness computed");

        Ok(ProvingJob { inputs })
    }

    /// Run the backend for an ingested job.
    #[instrument(level = "debug", skip_all, fields(circuit = %self.pinned_circuit_id))]
    pub async fn prove(
        &self,
        job: &ProvingJob,
        key: &EphemeralKey,
        observer: &dyn ProgressObserver,
    ) -> Result<Proof, ProofError> {
        let backend_circuit = self.backend.circuit_id();
        if backend_circuit != self.pinned_circuit_id {
            return Err(ProofError::CircuitMismatch {
                expected: self.pinned_circuit_id.clone(),
                got: backend_circuit,
            });
        }

        let (bytes, public_inputs) =
            match tokio::time::timeout(self.timeout, self.backend.prove(job.inputs.clone())).await {
                Err(_) => {
                    warn!(timeout = ?self.timeout, "proving backend timed out");
                    return Err(ProofError::BackendUnavailable("timed out".into()));
                }
                Ok(Err(BackendError::Unavailable(e))) => {
                    return Err(ProofError::BackendUnavailable(e))
                }
                Ok(Err(BackendError::Rejected(e))) => return Err(ProofError::BackendRejected(e)),
                Ok(Ok(output)) => output,
            };

        if public_inputs != job.inputs.public {
            return Err(ProofError::ClaimRejected(
                "backend committed to different public inputs",
            ));
        }
        if key.is_expired(self.clock.now()) {
            return Err(ProofError::KeyExpired);
        }

        observer.on_milestone(ProvingMilestone::Proved);
        let nullifier = &job.inputs.public.as_slice()[crate::circuit::NULLIFIER_INDEX];
        debug!(nullifier = %field_to_hex(nullifier), "proof generated");
        Ok(Proof {
            bytes,
            public_inputs,
        })
    }
}
