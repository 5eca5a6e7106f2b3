//! Domain membership circuit.
//!
//! Reference R1CS statement behind the Groth16 backend:
//!
//! 1. `commitment = Poseidon(pk.x, pk.y, salt, expiry)`: the proof belongs to
//!    the ephemeral key whose digest the identity provider signed as nonce,
//!    and the expiry cannot be swapped.
//! 2. `nullifier = Poseidon(identity_digest, NULLIFIER_DOMAIN)`: the public
//!    nullifier comes from the private identity digest.
//! 3. The domain region is a prefix of `len` bytes (1 <= len <= 64) followed
//!    by zero padding.
//!
//! Public inputs follow [`crate::circuit::layout`]. The issuer limbs are only
//! carried through the instance: nothing here ties `identity_digest` to the
//! attesting key or its signature, so anyone holding the proving key can pair
//! trusted limbs with a fresh nullifier. This backend alone gives no sybil
//! resistance; that needs a circuit which verifies the attestation in-circuit.
//!
//! Private witnesses: identity digest, ephemeral public point, salt.

use ark_bn254::Fr;
use ark_crypto_primitives::sponge::{
    constraints::CryptographicSpongeVar,
    poseidon::{constraints::PoseidonSpongeVar, PoseidonConfig},
};
use ark_ff::Zero;
use ark_r1cs_std::{
    alloc::AllocVar,
    boolean::Boolean,
    eq::EqGadget,
    fields::{fp::FpVar, FieldVar},
};
use ark_relations::r1cs::{ConstraintSynthesizer, ConstraintSystemRef, SynthesisError};

use super::layout::{
    domain_selectors, key_to_limbs, PublicInputs, DOMAIN_LEN_INDEX, DOMAIN_OFFSET,
    EPHEMERAL_COMMITMENT_INDEX, EXPIRY_INDEX, MAX_DOMAIN_LENGTH, NULLIFIER_INDEX,
    PUBLIC_INPUT_COUNT,
};
use crate::hash::{field_to_u64, PoseidonHasher};
use crate::nullifier::{nullifier_domain, Nullifier};

/// Everything the proving backend needs for one proof.
#[derive(Clone)]
pub struct CircuitInputs {
    pub public: PublicInputs,
    pub identity_digest: Fr,
    pub ephemeral_x: Fr,
    pub ephemeral_y: Fr,
    pub salt: Fr,
}

impl CircuitInputs {
    /// Self-consistent dummy inputs used for key generation.
    pub fn placeholder() -> Self {
        let hasher = PoseidonHasher::new();
        let identity_digest = Fr::from(1u64);
        let (ephemeral_x, ephemeral_y, salt, expiry) =
            (Fr::from(2u64), Fr::from(3u64), Fr::from(4u64), 5u64);

        let commitment = hasher.hash_many(&[ephemeral_x, ephemeral_y, salt, Fr::from(expiry)]);
        let nullifier = Nullifier(hasher.hash_many(&[identity_digest, nullifier_domain()]));
        let limbs = key_to_limbs(&[1]).unwrap_or([Fr::zero(); super::layout::IDENTITY_LIMBS]);

        Self {
            public: PublicInputs::assemble(&limbs, "example.edu", commitment, expiry, &nullifier),
            identity_digest,
            ephemeral_x,
            ephemeral_y,
            salt,
        }
    }
}

impl std::fmt::Debug for CircuitInputs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitInputs")
            .field("public", &self.public)
            .field("witness", &"<redacted>")
            .finish()
    }
}

/// Circuit proving domain membership for one ephemeral key.
#[derive(Clone)]
pub struct DomainMembershipCircuit {
    pub poseidon_config: PoseidonConfig<Fr>,

    /// Private: identity digest reduced into the field
    pub identity_digest: Option<Fr>,
    /// Private: ephemeral public point, coordinates reduced into the field
    pub ephemeral_x: Option<Fr>,
    pub ephemeral_y: Option<Fr>,
    /// Private: key salt
    pub salt: Option<Fr>,

    /// Public: inputs in layout order
    pub public: Option<Vec<Fr>>,
}

impl DomainMembershipCircuit {
    /// Circuit for trusted setup.
    pub fn new_empty() -> Self {
        Self::new_with_witness(&CircuitInputs::placeholder())
    }

    pub fn new_with_witness(inputs: &CircuitInputs) -> Self {
        let hasher = PoseidonHasher::new();
        Self {
            poseidon_config: hasher.config().clone(),
            identity_digest: Some(inputs.identity_digest),
            ephemeral_x: Some(inputs.ephemeral_x),
            ephemeral_y: Some(inputs.ephemeral_y),
            salt: Some(inputs.salt),
            public: Some(inputs.public.as_slice().to_vec()),
        }
    }

    fn public_at(&self, index: usize) -> Result<Fr, SynthesisError> {
        self.public
            .as_ref()
            .and_then(|p| p.get(index).copied())
            .ok_or(SynthesisError::AssignmentMissing)
    }

    fn domain_len(&self) -> Result<usize, SynthesisError> {
        let len = field_to_u64(&self.public_at(DOMAIN_LEN_INDEX)?)
            .ok_or(SynthesisError::Unsatisfiable)?;
        Ok((len as usize).min(MAX_DOMAIN_LENGTH))
    }
}

impl ConstraintSynthesizer<Fr> for DomainMembershipCircuit {
    fn generate_constraints(self, cs: ConstraintSystemRef<Fr>) -> Result<(), SynthesisError> {
        // Public inputs, allocated in layout order
        let inputs = (0..PUBLIC_INPUT_COUNT)
            .map(|i| FpVar::new_input(cs.clone(), || self.public_at(i)))
            .collect::<Result<Vec<_>, _>>()?;

        let identity_digest = FpVar::new_witness(cs.clone(), || {
            self.identity_digest.ok_or(SynthesisError::AssignmentMissing)
        })?;
        let ephemeral_x = FpVar::new_witness(cs.clone(), || {
            self.ephemeral_x.ok_or(SynthesisError::AssignmentMissing)
        })?;
        let ephemeral_y = FpVar::new_witness(cs.clone(), || {
            self.ephemeral_y.ok_or(SynthesisError::AssignmentMissing)
        })?;
        let salt = FpVar::new_witness(cs.clone(), || {
            self.salt.ok_or(SynthesisError::AssignmentMissing)
        })?;

        let commitment = poseidon_hash(
            cs.clone(),
            &self.poseidon_config,
            &[ephemeral_x, ephemeral_y, salt, inputs[EXPIRY_INDEX].clone()],
        )?;
        commitment.enforce_equal(&inputs[EPHEMERAL_COMMITMENT_INDEX])?;

        let nullifier = poseidon_hash(
            cs.clone(),
            &self.poseidon_config,
            &[identity_digest, FpVar::constant(nullifier_domain())],
        )?;
        nullifier.enforce_equal(&inputs[NULLIFIER_INDEX])?;

        let len = self.domain_len();
        let selectors = (0..MAX_DOMAIN_LENGTH)
            .map(|i| {
                Boolean::new_witness(cs.clone(), || {
                    len.as_ref()
                        .map(|len| domain_selectors(*len)[i])
                        .map_err(|_| SynthesisError::AssignmentMissing)
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        enforce_domain_prefix(&selectors, &inputs)
    }
}

/// Selectors form a non-empty prefix whose size is the public length, and
/// every byte outside the prefix is zero.
fn enforce_domain_prefix(
    selectors: &[Boolean<Fr>],
    inputs: &[FpVar<Fr>],
) -> Result<(), SynthesisError> {
    selectors[0].enforce_equal(&Boolean::TRUE)?;

    for pair in selectors.windows(2) {
        pair[1].and(&pair[0].not())?.enforce_equal(&Boolean::FALSE)?;
    }

    let mut count = FpVar::<Fr>::zero();
    for (i, selector) in selectors.iter().enumerate() {
        count = count + FpVar::from(selector.clone());

        let outside = FpVar::from(selector.not());
        (&inputs[DOMAIN_OFFSET + i] * &outside).enforce_equal(&FpVar::zero())?;
    }
    count.enforce_equal(&inputs[DOMAIN_LEN_INDEX])
}

/// Poseidon sponge over field elements, in-circuit.
fn poseidon_hash(
    cs: ConstraintSystemRef<Fr>,
    config: &PoseidonConfig<Fr>,
    elements: &[FpVar<Fr>],
) -> Result<FpVar<Fr>, SynthesisError> {
    let mut sponge = PoseidonSpongeVar::new(cs, config);
    for element in elements {
        sponge.absorb(element)?;
    }
    let output = sponge.squeeze_field_elements(1)?;
    Ok(output[0].clone())
}
