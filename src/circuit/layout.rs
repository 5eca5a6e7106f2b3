//! Public input layout, version 1.
//!
//! ```text
//! index   count  content
//! 0..18   18     attesting issuer key, 120-bit little-endian limbs
//! 18..82  64     domain bytes, zero padded
//! 82      1      domain length
//! 83      1      ephemeral public-key commitment
//! 84      1      key expiry (unix seconds)
//! 85      1      nullifier
//! ```
//!
//! Changing any of these constants requires a new circuit id.

use ark_bn254::Fr;
use ark_ff::Zero;

use crate::hash::{field_bits, field_from_hex, field_to_hex, field_to_u64};
use crate::nullifier::Nullifier;

pub const IDENTITY_LIMBS: usize = 18;
pub const LIMB_BITS: u32 = 120;
const LIMB_BYTES: usize = (LIMB_BITS / 8) as usize;
pub const MAX_DOMAIN_LENGTH: usize = 64;

pub const DOMAIN_OFFSET: usize = IDENTITY_LIMBS;
pub const DOMAIN_LEN_INDEX: usize = DOMAIN_OFFSET + MAX_DOMAIN_LENGTH;
pub const EPHEMERAL_COMMITMENT_INDEX: usize = DOMAIN_LEN_INDEX + 1;
pub const EXPIRY_INDEX: usize = EPHEMERAL_COMMITMENT_INDEX + 1;
pub const NULLIFIER_INDEX: usize = EXPIRY_INDEX + 1;
pub const PUBLIC_INPUT_COUNT: usize = NULLIFIER_INDEX + 1;

/// Structural violations of the layout.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("expected {expected} public inputs, got {got}")]
    WrongCount { expected: usize, got: usize },

    #[error("identity limb {0} exceeds {LIMB_BITS} bits")]
    LimbOverflow(usize),

    #[error("domain element {0} is not a byte")]
    DomainByte(usize),

    #[error("domain length out of range")]
    DomainLength,

    #[error("expiry is not a timestamp")]
    Expiry,
}

/// Split a big-endian key encoding into little-endian 120-bit limbs.
///
/// `None` if the key needs more than [`IDENTITY_LIMBS`] limbs.
pub fn key_to_limbs(key_be: &[u8]) -> Option<[Fr; IDENTITY_LIMBS]> {
    let first = key_be.iter().position(|b| *b != 0).unwrap_or(key_be.len());
    let significant = &key_be[first..];
    if significant.len() > IDENTITY_LIMBS * LIMB_BYTES {
        return None;
    }

    let mut limbs = [Fr::zero(); IDENTITY_LIMBS];
    for (limb, chunk) in limbs.iter_mut().zip(significant.rchunks(LIMB_BYTES)) {
        *limb = chunk
            .iter()
            .fold(Fr::zero(), |acc, b| acc * Fr::from(256u64) + Fr::from(*b as u64));
    }
    Some(limbs)
}

/// Ordered public inputs of a domain proof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicInputs(Vec<Fr>);

impl PublicInputs {
    /// Assemble inputs in layout order. The domain must already be bounded.
    pub fn assemble(
        limbs: &[Fr; IDENTITY_LIMBS],
        domain: &str,
        ephemeral_commitment: Fr,
        expiry: u64,
        nullifier: &Nullifier,
    ) -> Self {
        let mut inputs = Vec::with_capacity(PUBLIC_INPUT_COUNT);
        inputs.extend_from_slice(limbs);

        let mut padded = [0u8; MAX_DOMAIN_LENGTH];
        padded[..domain.len()].copy_from_slice(domain.as_bytes());
        inputs.extend(padded.iter().map(|b| Fr::from(*b as u64)));
        inputs.push(Fr::from(domain.len() as u64));

        inputs.push(ephemeral_commitment);
        inputs.push(Fr::from(expiry));
        inputs.push(nullifier.0);
        Self(inputs)
    }

    /// Wrap raw inputs received from a backend or the wire, unchecked.
    pub fn from_vec(inputs: Vec<Fr>) -> Self {
        Self(inputs)
    }

    pub fn from_hex(inputs: &[String]) -> Result<Self, hex::FromHexError> {
        inputs
            .iter()
            .map(|s| field_from_hex(s))
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    /// `bytes32[]` encoding.
    pub fn to_hex(&self) -> Vec<String> {
        self.0.iter().map(field_to_hex).collect()
    }

    pub fn as_slice(&self) -> &[Fr] {
        &self.0
    }

    pub fn as_mut_slice(&mut self) -> &mut [Fr] {
        &mut self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Structural check: count, limb widths, domain bytes and length, expiry.
    pub fn check_layout(&self) -> Result<(), LayoutError> {
        if self.0.len() != PUBLIC_INPUT_COUNT {
            return Err(LayoutError::WrongCount {
                expected: PUBLIC_INPUT_COUNT,
                got: self.0.len(),
            });
        }

        if let Some(i) = self.issuer_limbs().iter().position(|l| field_bits(l) > LIMB_BITS) {
            return Err(LayoutError::LimbOverflow(i));
        }

        if let Some(i) = self
            .domain_elements()
            .iter()
            .position(|b| field_to_u64(b).map_or(true, |v| v > 0xff))
        {
            return Err(LayoutError::DomainByte(i));
        }

        match field_to_u64(&self.0[DOMAIN_LEN_INDEX]) {
            Some(len) if (1..=MAX_DOMAIN_LENGTH as u64).contains(&len) => {}
            _ => return Err(LayoutError::DomainLength),
        }

        field_to_u64(&self.0[EXPIRY_INDEX]).ok_or(LayoutError::Expiry)?;
        Ok(())
    }

    pub fn issuer_limbs(&self) -> &[Fr] {
        &self.0[..IDENTITY_LIMBS]
    }

    fn domain_elements(&self) -> &[Fr] {
        &self.0[DOMAIN_OFFSET..DOMAIN_LEN_INDEX]
    }

    /// The domain, if the layout is well formed and the bytes are UTF-8.
    pub fn domain(&self) -> Option<String> {
        self.check_layout().ok()?;
        let len = field_to_u64(&self.0[DOMAIN_LEN_INDEX])? as usize;
        let bytes = self.domain_elements()[..len]
            .iter()
            .map(|b| field_to_u64(b).map(|v| v as u8))
            .collect::<Option<Vec<u8>>>()?;
        String::from_utf8(bytes).ok()
    }

    pub fn ephemeral_commitment(&self) -> Option<Fr> {
        self.0.get(EPHEMERAL_COMMITMENT_INDEX).copied()
    }

    pub fn expiry(&self) -> Option<u64> {
        self.0.get(EXPIRY_INDEX).and_then(field_to_u64)
    }

    pub fn nullifier(&self) -> Option<Nullifier> {
        self.0.get(NULLIFIER_INDEX).copied().map(Nullifier)
    }
}

/// Prefix selectors for the domain region: `true` for the first `len` slots.
pub fn domain_selectors(len: usize) -> [bool; MAX_DOMAIN_LENGTH] {
    let mut selectors = [false; MAX_DOMAIN_LENGTH];
    selectors.iter_mut().take(len).for_each(|s| *s = true);
    selectors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PublicInputs {
        let limbs = key_to_limbs(&[0xab; 256]).unwrap();
        PublicInputs::assemble(
            &limbs,
            "state-u.edu",
            Fr::from(42u64),
            1_700_000_000,
            &Nullifier(Fr::from(7u64)),
        )
    }

    #[test]
    fn test_layout_constants() {
        assert_eq!(DOMAIN_LEN_INDEX, 82);
        assert_eq!(EPHEMERAL_COMMITMENT_INDEX, 83);
        assert_eq!(EXPIRY_INDEX, 84);
        assert_eq!(NULLIFIER_INDEX, 85);
        assert_eq!(PUBLIC_INPUT_COUNT, 86);
    }

    #[test]
    fn test_accessors() {
        let inputs = sample();
        inputs.check_layout().unwrap();
        assert_eq!(inputs.domain().as_deref(), Some("state-u.edu"));
        assert_eq!(inputs.expiry(), Some(1_700_000_000));
        assert_eq!(inputs.ephemeral_commitment(), Some(Fr::from(42u64)));
        assert_eq!(inputs.nullifier(), Some(Nullifier(Fr::from(7u64))));
    }

    #[test]
    fn test_key_to_limbs() {
        let limbs = key_to_limbs(&[0x01, 0x02]).unwrap();
        assert_eq!(limbs[0], Fr::from(0x0102u64));
        assert!(limbs[1..].iter().all(|l| l.is_zero()));

        // A 2048-bit modulus fits, one more byte does not.
        assert!(key_to_limbs(&[0xff; 256]).is_some());
        assert!(key_to_limbs(&[0xff; 271]).is_none());
        // Leading zero bytes are not significant.
        assert_eq!(key_to_limbs(&[0, 0, 1]), key_to_limbs(&[1]));
    }

    #[test]
    fn test_structural_violations() {
        let mut short = sample();
        short.0.pop();
        assert!(matches!(short.check_layout(), Err(LayoutError::WrongCount { .. })));

        let mut bad_byte = sample();
        bad_byte.0[DOMAIN_OFFSET + 3] = Fr::from(256u64);
        assert_eq!(bad_byte.check_layout(), Err(LayoutError::DomainByte(3)));

        let mut bad_len = sample();
        bad_len.0[DOMAIN_LEN_INDEX] = Fr::from(65u64);
        assert_eq!(bad_len.check_layout(), Err(LayoutError::DomainLength));

        let mut bad_expiry = sample();
        bad_expiry.0[EXPIRY_INDEX] = -Fr::from(1u64);
        assert_eq!(bad_expiry.check_layout(), Err(LayoutError::Expiry));

        let mut bad_limb = sample();
        bad_limb.0[2] = Fr::from(u64::MAX) * Fr::from(u64::MAX);
        assert_eq!(bad_limb.check_layout(), Err(LayoutError::LimbOverflow(2)));
    }

    #[test]
    fn test_hex_encoding() {
        let inputs = sample();
        let hex = inputs.to_hex();
        assert_eq!(hex.len(), PUBLIC_INPUT_COUNT);
        assert_eq!(PublicInputs::from_hex(&hex).unwrap(), inputs);
    }
}
