//! Append-only ledger of accepted nullifiers.
//!
//! A proof is accepted at most once per nullifier and once per subject.
//! Validation runs structural, cryptographic, freshness and uniqueness checks
//! in that order; the uniqueness check and the insert share one write lock.

use ark_bn254::Fr;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::circuit::{key_to_limbs, LayoutError};
use crate::clock::Clock;
use crate::error::ErrorKind;
use crate::nullifier::Nullifier;
use crate::prover::Proof;
use crate::verifier::ProofVerifier;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("malformed proof: {0}")]
    Malformed(#[from] LayoutError),

    #[error("invalid proof")]
    InvalidProof,

    #[error("proof binding has expired")]
    ExpiredBinding,

    #[error("nullifier already registered")]
    NullifierUsed,

    #[error("subject already verified")]
    SubjectVerified,

    #[error("registry unreachable: {0}")]
    Unavailable(String),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::Malformed(_) => ErrorKind::MalformedProof,
            RegistryError::InvalidProof => ErrorKind::InvalidProof,
            RegistryError::ExpiredBinding => ErrorKind::ExpiredBinding,
            RegistryError::NullifierUsed | RegistryError::SubjectVerified => {
                ErrorKind::AlreadyRegistered
            }
            RegistryError::Unavailable(_) => ErrorKind::NetworkFailure,
        }
    }
}

/// Who a verification is recorded for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum SubjectId {
    /// `0x`-prefixed 20-byte address, stored lowercase.
    Wallet(String),
    Account(String),
}

impl SubjectId {
    pub fn wallet(address: &str) -> Option<Self> {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let pattern = PATTERN.get_or_init(|| {
            Regex::new(r"^0x[a-fA-F0-9]{40}$")
                .unwrap_or_else(|e| panic!("wallet pattern is valid: {e}"))
        });
        pattern
            .is_match(address)
            .then(|| SubjectId::Wallet(address.to_lowercase()))
    }

    pub fn account(id: impl Into<String>) -> Self {
        SubjectId::Account(id.into())
    }
}

impl std::fmt::Display for SubjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubjectId::Wallet(address) => f.write_str(address),
            SubjectId::Account(id) => write!(f, "account:{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub subject: SubjectId,
    pub nullifier: Nullifier,
    pub verified_at: u64,
    pub exists: bool,
}

/// Registry as seen by a client; the in-process registry implements it.
#[async_trait]
pub trait RegistryEndpoint: Send + Sync {
    async fn submit_proof(
        &self,
        proof: &Proof,
        subject: SubjectId,
    ) -> Result<VerificationRecord, RegistryError>;
}

#[derive(Default)]
struct Ledger {
    by_nullifier: HashMap<[u8; 32], SubjectId>,
    by_subject: HashMap<SubjectId, VerificationRecord>,
}

pub struct VerificationRegistry {
    verifier: Arc<dyn ProofVerifier>,
    trusted_issuers: HashSet<Vec<Fr>>,
    clock: Arc<dyn Clock>,
    ledger: RwLock<Ledger>,
}

impl VerificationRegistry {
    pub fn new(verifier: Arc<dyn ProofVerifier>, clock: Arc<dyn Clock>) -> Self {
        Self {
            verifier,
            trusted_issuers: HashSet::new(),
            clock,
            ledger: RwLock::new(Ledger::default()),
        }
    }

    /// Accept only proofs whose issuer limbs encode one of the trusted keys.
    /// With no trusted issuer configured any issuer is accepted.
    pub fn with_trusted_issuer(mut self, key_be: &[u8]) -> Self {
        match key_to_limbs(key_be) {
            Some(limbs) => {
                self.trusted_issuers.insert(limbs.to_vec());
            }
            None => warn!("ignoring trusted issuer key wider than the limb layout"),
        }
        self
    }

    pub fn circuit_id(&self) -> &str {
        self.verifier.circuit_id()
    }

    /// Validate `proof` and record it for `subject`.
    #[instrument(level = "debug", skip_all, fields(%subject))]
    pub fn submit(
        &self,
        proof: &Proof,
        subject: SubjectId,
    ) -> Result<VerificationRecord, RegistryError> {
        let inputs = &proof.public_inputs;
        inputs.check_layout()?;

        match self.verifier.verify(proof) {
            Ok(true) => {}
            Ok(false) => return Err(RegistryError::InvalidProof),
            Err(e) => {
                debug!("proof rejected: {e}");
                return Err(RegistryError::InvalidProof);
            }
        }
        if !self.trusted_issuers.is_empty()
            && !self.trusted_issuers.contains(inputs.issuer_limbs())
        {
            return Err(RegistryError::InvalidProof);
        }

        let now = self.clock.now();
        match inputs.expiry() {
            Some(expiry) if now < expiry => {}
            _ => return Err(RegistryError::ExpiredBinding),
        }

        let nullifier = inputs
            .nullifier()
            .ok_or(LayoutError::WrongCount {
                expected: crate::circuit::PUBLIC_INPUT_COUNT,
                got: inputs.len(),
            })?;
        let key = nullifier.to_bytes();

        let mut ledger = self.ledger.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(holder) = ledger.by_nullifier.get(&key) {
            // Resubmission by the same subject after a lost response.
            if *holder == subject {
                if let Some(record) = ledger.by_subject.get(&subject) {
                    debug!("identity already recorded for this subject");
                    return Ok(record.clone());
                }
            }
            return Err(RegistryError::NullifierUsed);
        }
        if ledger.by_subject.contains_key(&subject) {
            return Err(RegistryError::SubjectVerified);
        }

        let record = VerificationRecord {
            subject: subject.clone(),
            nullifier,
            verified_at: now,
            exists: true,
        };
        ledger.by_nullifier.insert(key, subject.clone());
        ledger.by_subject.insert(subject, record.clone());
        drop(ledger);

        info!(nullifier = %record.nullifier, "verification recorded");
        Ok(record)
    }

    pub fn exists(&self, subject: &SubjectId) -> bool {
        self.read().by_subject.contains_key(subject)
    }

    pub fn lookup(&self, subject: &SubjectId) -> Option<VerificationRecord> {
        self.read().by_subject.get(subject).cloned()
    }

    pub fn is_nullifier_used(&self, nullifier: &Nullifier) -> bool {
        self.read().by_nullifier.contains_key(&nullifier.to_bytes())
    }

    pub fn len(&self) -> usize {
        self.read().by_subject.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Ledger> {
        self.ledger.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RegistryEndpoint for VerificationRegistry {
    async fn submit_proof(
        &self,
        proof: &Proof,
        subject: SubjectId,
    ) -> Result<VerificationRecord, RegistryError> {
        self.submit(proof, subject)
    }
}
