//! ZK Domain - prove you belong to an organization, once per identity
//!
//! A zero-knowledge verification protocol: a user proves that their
//! identity-provider account (or email address) belongs to a recognized
//! organization domain such as `state-u.edu`, without revealing who they
//! are. Each real-world identity registers at most once, enforced by a
//! nullifier derived from the identity inside the proof.
//!
//! # Architecture
//!
//! 1. [`EphemeralKeyManager`] creates a single-use key per attempt
//! 2. [`DomainClaimIssuer`] turns an id token (or email + code) bound to that
//!    key into a [`DomainClaim`]
//! 3. [`ProofGenerator`] proves the claim through a [`ProvingBackend`]
//! 4. [`VerificationRegistry`] verifies the proof and records its nullifier
//! 5. [`VerificationSession`] drives the steps and reports progress

pub mod circuit;
pub mod claim;
pub mod clock;
pub mod config;
pub mod ephemeral;
pub mod error;
pub mod hash;
pub mod nullifier;
pub mod prover;
pub mod registry;
pub mod session;
pub mod verifier;

// Re-export main types
pub use claim::{DomainClaim, DomainClaimIssuer, IdentityAssertion};
pub use config::Config;
pub use ephemeral::{EphemeralKey, EphemeralKeyManager};
pub use error::ErrorKind;
pub use nullifier::Nullifier;
pub use prover::{Groth16Backend, Proof, ProofGenerator, ProvingBackend};
pub use registry::{SubjectId, VerificationRecord, VerificationRegistry};
pub use session::{VerificationMethod, VerificationSession, VerificationStatus};
pub use verifier::{Groth16Verifier, ProofVerifier};
