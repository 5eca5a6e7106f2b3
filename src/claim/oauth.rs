//! OpenID Connect id tokens.
//!
//! Tokens are compact JWS (RS256). The verifier authenticates the token and
//! returns its claims; the policy checks (workspace domain, verified email,
//! nonce, allowlist) live in [`super::DomainClaimIssuer`].

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rsa::{traits::PublicKeyParts, BigUint, Pkcs1v15Sign, RsaPublicKey};
use serde::{Deserialize, Deserializer};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

use super::ClaimError;
use crate::clock::Clock;
use crate::config::IdentityConfig;
use crate::error::ErrorKind;

/// Failure while acquiring a token from the identity provider.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("sign-in window was closed")]
    Cancelled,

    #[error("sign-in timed out")]
    TimedOut,

    #[error("sign-in method not supported")]
    Unsupported,

    #[error("identity provider unavailable: {0}")]
    Unavailable(String),

    #[error("identity provider rejected the request: {0}")]
    Rejected(String),
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Cancelled => ErrorKind::UserCancelled,
            ProviderError::TimedOut | ProviderError::Unavailable(_) => ErrorKind::NetworkFailure,
            ProviderError::Unsupported | ProviderError::Rejected(_) => ErrorKind::InvalidAssertion,
        }
    }
}

/// Identity provider that issues id tokens carrying a caller-chosen nonce.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Low-friction sign-in; callers bound it with a short timeout.
    async fn one_tap(&self, _nonce: &str) -> Result<String, ProviderError> {
        Err(ProviderError::Unsupported)
    }

    /// Interactive sign-in. Returns `Cancelled` when the user closes the window.
    async fn popup(&self, nonce: &str) -> Result<String, ProviderError>;
}

#[derive(Debug, Deserialize)]
struct TokenHeader {
    alg: String,
    kid: Option<String>,
}

/// Claims of an authenticated id token.
#[derive(Clone, Deserialize)]
pub struct IdTokenClaims {
    pub iss: String,
    pub sub: String,
    #[serde(deserialize_with = "one_or_many")]
    pub aud: Vec<String>,
    pub exp: u64,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub email_verified: bool,
    /// Workspace (hosted) domain; absent for personal accounts.
    #[serde(default)]
    pub hd: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
}

impl std::fmt::Debug for IdTokenClaims {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdTokenClaims")
            .field("iss", &self.iss)
            .field("hd", &self.hd)
            .field("email_verified", &self.email_verified)
            .finish_non_exhaustive()
    }
}

/// Token whose signature, issuer, audience and expiry have been checked.
#[derive(Debug)]
pub struct VerifiedToken {
    pub key_id: String,
    pub claims: IdTokenClaims,
    /// Big-endian modulus of the key that signed the token.
    pub modulus: Vec<u8>,
}

#[derive(Deserialize)]
struct Jwks {
    keys: Vec<Jwk>,
}

#[derive(Deserialize)]
struct Jwk {
    kid: String,
    kty: String,
    n: String,
    e: String,
}

/// RS256 id token verifier over a set of provider keys.
pub struct OAuthVerifier {
    keys: HashMap<String, RsaPublicKey>,
    trusted_issuers: Vec<String>,
    audiences: Vec<String>,
    clock: Arc<dyn Clock>,
}

impl OAuthVerifier {
    pub fn new(config: &IdentityConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            keys: HashMap::new(),
            trusted_issuers: config.trusted_issuers.clone(),
            audiences: config.audiences.clone(),
            clock,
        }
    }

    pub fn add_key(&mut self, kid: impl Into<String>, key: RsaPublicKey) {
        self.keys.insert(kid.into(), key);
    }

    /// Load RSA keys from a JWKS document; returns how many were added.
    pub fn add_jwks(&mut self, jwks_json: &str) -> Result<usize, ClaimError> {
        let jwks: Jwks = serde_json::from_str(jwks_json)
            .map_err(|_| ClaimError::InvalidAssertion("key set is not valid JSON"))?;

        let mut added = 0;
        for jwk in jwks.keys.into_iter().filter(|k| k.kty == "RSA") {
            let n = decode_segment(&jwk.n)?;
            let e = decode_segment(&jwk.e)?;
            let key = RsaPublicKey::new(BigUint::from_bytes_be(&n), BigUint::from_bytes_be(&e))
                .map_err(|_| ClaimError::InvalidAssertion("key set contains an invalid RSA key"))?;
            self.keys.insert(jwk.kid, key);
            added += 1;
        }
        Ok(added)
    }

    /// Authenticate a compact id token.
    pub fn verify(&self, token: &str) -> Result<VerifiedToken, ClaimError> {
        let mut segments = token.split('.');
        let (Some(header_b64), Some(payload_b64), Some(signature_b64), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(ClaimError::InvalidAssertion("token is not a compact JWS"));
        };

        let header: TokenHeader = serde_json::from_slice(&decode_segment(header_b64)?)
            .map_err(|_| ClaimError::InvalidAssertion("token header is not valid JSON"))?;
        if header.alg != "RS256" {
            return Err(ClaimError::InvalidAssertion("unsupported token algorithm"));
        }

        let key_id = header
            .kid
            .ok_or(ClaimError::InvalidAssertion("token header has no key id"))?;
        let key = self
            .keys
            .get(&key_id)
            .ok_or(ClaimError::InvalidAssertion("token signed by an unknown key"))?;

        let signing_input = &token[..header_b64.len() + 1 + payload_b64.len()];
        let signature = decode_segment(signature_b64)?;
        let hashed = Sha256::digest(signing_input.as_bytes());
        key.verify(Pkcs1v15Sign::new::<Sha256>(), &hashed, &signature)
            .map_err(|_| ClaimError::InvalidAssertion("token signature does not verify"))?;

        let claims: IdTokenClaims = serde_json::from_slice(&decode_segment(payload_b64)?)
            .map_err(|_| ClaimError::InvalidAssertion("token payload is malformed"))?;

        if !self.trusted_issuers.iter().any(|iss| *iss == claims.iss) {
            return Err(ClaimError::InvalidAssertion("token issuer is not trusted"));
        }
        if !self.audiences.is_empty()
            && !claims.aud.iter().any(|aud| self.audiences.contains(aud))
        {
            return Err(ClaimError::InvalidAssertion("token audience is not accepted"));
        }
        if self.clock.now() >= claims.exp {
            return Err(ClaimError::InvalidAssertion("token has expired"));
        }

        Ok(VerifiedToken {
            key_id,
            claims,
            modulus: key.n().to_bytes_be(),
        })
    }
}

fn decode_segment(segment: &str) -> Result<Vec<u8>, ClaimError> {
    URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|_| ClaimError::InvalidAssertion("token segment is not base64url"))
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(aud) => vec![aud],
        OneOrMany::Many(auds) => auds,
    })
}

/// Some providers send `"true"` instead of `true`.
fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrString {
        Bool(bool),
        String(String),
    }

    Ok(match BoolOrString::deserialize(deserializer)? {
        BoolOrString::Bool(b) => b,
        BoolOrString::String(s) => s.eq_ignore_ascii_case("true"),
    })
}
