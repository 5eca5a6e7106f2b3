//! Poseidon hash and field conversions shared by native and in-circuit code.

use ark_bn254::{Fq, Fr};
use ark_crypto_primitives::sponge::{
    poseidon::{PoseidonConfig, PoseidonSponge},
    CryptographicSponge,
};
use ark_ff::{BigInteger, Field, PrimeField};
use ark_std::vec::Vec;
use sha2::{Digest, Sha256};

/// Poseidon hasher configured for the BN254 scalar field.
#[derive(Clone)]
pub struct PoseidonHasher {
    config: PoseidonConfig<Fr>,
}

impl PoseidonHasher {
    pub fn new() -> Self {
        Self {
            config: Self::default_config(),
        }
    }

    /// Width 3 (rate 2, capacity 1), x^5 S-box, 8 full and 57 partial rounds.
    fn default_config() -> PoseidonConfig<Fr> {
        let full_rounds = 8;
        let partial_rounds = 57;
        let rate = 2;
        let capacity = 1;

        let (ark, mds) = Self::generate_parameters(rate + capacity, full_rounds, partial_rounds);

        PoseidonConfig {
            full_rounds,
            partial_rounds,
            alpha: 5,
            ark,
            mds,
            rate,
            capacity,
        }
    }

    /// Round constants and a Cauchy MDS matrix.
    fn generate_parameters(
        width: usize,
        full_rounds: usize,
        partial_rounds: usize,
    ) -> (Vec<Vec<Fr>>, Vec<Vec<Fr>>) {
        let total_rounds = full_rounds + partial_rounds;

        let ark = (0..total_rounds)
            .map(|r| {
                (0..width)
                    .map(|i| {
                        let seed = ((r * width + i) as u64).wrapping_mul(0x9e3779b97f4a7c15);
                        Fr::from(seed)
                    })
                    .collect()
            })
            .collect();

        let mds = (0..width)
            .map(|i| {
                (0..width)
                    .map(|j| {
                        let x = Fr::from((i + 1) as u64);
                        let y = Fr::from((width + j + 1) as u64);
                        (x + y).inverse().unwrap_or(Fr::from(1u64))
                    })
                    .collect()
            })
            .collect();

        (ark, mds)
    }

    /// Hash a sequence of field elements into one.
    pub fn hash_many(&self, elements: &[Fr]) -> Fr {
        let mut sponge = PoseidonSponge::new(&self.config);
        for elem in elements {
            sponge.absorb(elem);
        }
        sponge.squeeze_field_elements(1)[0]
    }

    pub fn config(&self) -> &PoseidonConfig<Fr> {
        &self.config
    }
}

impl Default for PoseidonHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash a tagged string into a field element with SHA-256.
pub fn string_to_field(s: &str) -> Fr {
    let hash = Sha256::digest(s.as_bytes());
    Fr::from_be_bytes_mod_order(&hash)
}

/// Reduce a base-field element (curve coordinate) into the scalar field.
pub fn base_to_scalar(x: &Fq) -> Fr {
    Fr::from_le_bytes_mod_order(&x.into_bigint().to_bytes_le())
}

/// Big-endian 32-byte encoding.
pub fn field_to_bytes(f: &Fr) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&f.into_bigint().to_bytes_be());
    out
}

/// Decode a canonical big-endian encoding; `None` if not below the modulus.
pub fn field_from_bytes(bytes: &[u8; 32]) -> Option<Fr> {
    let f = Fr::from_be_bytes_mod_order(bytes);
    (field_to_bytes(&f) == *bytes).then_some(f)
}

/// `0x`-prefixed 32-byte hex, the encoding the registry contract takes.
pub fn field_to_hex(f: &Fr) -> String {
    format!("0x{}", hex::encode(field_to_bytes(f)))
}

pub fn field_from_hex(s: &str) -> Result<Fr, hex::FromHexError> {
    let raw = hex::decode(s.trim_start_matches("0x"))?;
    let bytes: [u8; 32] = raw
        .try_into()
        .map_err(|_| hex::FromHexError::InvalidStringLength)?;
    field_from_bytes(&bytes).ok_or(hex::FromHexError::InvalidStringLength)
}

/// The element as a `u64`, if it fits.
pub fn field_to_u64(f: &Fr) -> Option<u64> {
    let repr = f.into_bigint();
    repr.0[1..].iter().all(|limb| *limb == 0).then_some(repr.0[0])
}

/// Number of significant bits.
pub fn field_bits(f: &Fr) -> u32 {
    f.into_bigint().num_bits()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        let hasher = PoseidonHasher::new();
        let a = hasher.hash_many(&[Fr::from(1u64), Fr::from(2u64)]);
        let b = hasher.hash_many(&[Fr::from(1u64), Fr::from(2u64)]);
        let c = hasher.hash_many(&[Fr::from(2u64), Fr::from(1u64)]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_hex_encoding() {
        let f = Fr::from(0xdead_beefu64);
        let hex = field_to_hex(&f);
        assert_eq!(hex.len(), 66);
        assert!(hex.ends_with("deadbeef"));
        assert_eq!(field_from_hex(&hex).unwrap(), f);
        assert!(field_from_hex("0x1234").is_err());
    }

    #[test]
    fn test_field_to_u64() {
        assert_eq!(field_to_u64(&Fr::from(1_700_000_000u64)), Some(1_700_000_000));
        assert_eq!(field_to_u64(&-Fr::from(1u64)), None);
    }

    #[test]
    fn test_non_canonical_bytes_rejected() {
        assert!(field_from_bytes(&[0xff; 32]).is_none());
    }
}
