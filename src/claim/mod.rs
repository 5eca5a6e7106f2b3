//! Domain claims: the bounded statement "this identity belongs to domain X".
//!
//! Claims come from one of two identity sources, modelled as the tagged union
//! [`IdentityAssertion`] and consumed by [`DomainClaimIssuer::issue`]. Every
//! source must carry the ephemeral key digest inside its externally
//! verifiable assertion; a source that cannot do so loses replay resistance.

pub mod allowlist;
pub mod code;
pub mod oauth;

use ark_bn254::Fr;
use ed25519_dalek::{Signature, VerifyingKey};
use regex::Regex;
use std::sync::{Arc, OnceLock};
use tracing::{debug, instrument};

use crate::circuit::layout::MAX_DOMAIN_LENGTH;
use crate::clock::Clock;
use crate::ephemeral::EphemeralKey;
use crate::error::ErrorKind;
use crate::hash::{field_from_hex, field_to_bytes};
use crate::nullifier::IdentityDigest;

pub use allowlist::{AllowlistSource, DomainAllowlist, SourceError};
pub use code::{ChannelError, ClaimSigner, CodeChannel, DeliveredCode, InMemoryCodeChannel};
pub use oauth::{IdTokenClaims, IdentityProvider, OAuthVerifier, ProviderError, VerifiedToken};

const CLAIM_MESSAGE_TAG: &[u8] = b"zk-domain/claim/v1";

/// Errors from claim issuance. Messages are static and never echo the
/// identity, the email or the token.
#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    #[error("identity assertion rejected: {0}")]
    InvalidAssertion(&'static str),

    #[error("account has no organization domain")]
    DomainMissing,

    #[error("email address is not verified")]
    EmailUnverified,

    #[error("domain is not a recognized organization")]
    UnsupportedDomain,

    #[error("assertion nonce does not match the session key")]
    NonceMismatch,

    #[error("invalid or expired code")]
    InvalidOrExpiredCode,

    #[error("{0} strategy is not configured")]
    StrategyUnavailable(&'static str),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl ClaimError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClaimError::InvalidAssertion(_) | ClaimError::StrategyUnavailable(_) => {
                ErrorKind::InvalidAssertion
            }
            ClaimError::DomainMissing => ErrorKind::DomainMissing,
            ClaimError::EmailUnverified => ErrorKind::EmailUnverified,
            ClaimError::UnsupportedDomain => ErrorKind::UnsupportedDomain,
            ClaimError::NonceMismatch => ErrorKind::NonceMismatch,
            ClaimError::InvalidOrExpiredCode => ErrorKind::InvalidOrExpiredCode,
            ClaimError::Channel(e) => e.kind(),
        }
    }
}

/// Identity token obtained from the identity provider.
#[derive(Clone)]
pub struct OAuthAssertion {
    pub id_token: String,
}

/// Email plus the code delivered to it, bound to a session key.
#[derive(Clone)]
pub struct CodeAssertion {
    pub email: String,
    pub code: String,
    /// The session key digest, as [`EphemeralKey::nonce`].
    pub nonce: String,
}

#[derive(Clone)]
pub enum IdentityAssertion {
    OAuth(OAuthAssertion),
    Code(CodeAssertion),
}

impl std::fmt::Debug for IdentityAssertion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityAssertion::OAuth(_) => f.write_str("IdentityAssertion::OAuth(<redacted>)"),
            IdentityAssertion::Code(_) => f.write_str("IdentityAssertion::Code(<redacted>)"),
        }
    }
}

/// Who vouches for the identity behind a claim.
#[derive(Debug, Clone)]
pub enum Attestation {
    /// Identity provider key that signed the id token.
    Provider { key_id: String, modulus: Vec<u8> },
    /// Protocol issuer key and its signature over the claim.
    Issuer {
        verifying_key: VerifyingKey,
        signature: Signature,
    },
}

impl Attestation {
    /// Big-endian issuer key, the source of the identity-proof limbs.
    pub fn issuer_key_bytes(&self) -> Vec<u8> {
        match self {
            Attestation::Provider { modulus, .. } => modulus.clone(),
            Attestation::Issuer { verifying_key, .. } => verifying_key.to_bytes().to_vec(),
        }
    }
}

/// Privacy-preserving claim consumed by proof generation.
///
/// Not `Clone`: the claim moves into the proof generator and is gone after.
#[derive(Debug)]
pub struct DomainClaim {
    pub domain: String,
    pub identity_digest: IdentityDigest,
    pub ephemeral_binding: Fr,
    pub issued_at: u64,
    pub attestation: Attestation,
}

impl DomainClaim {
    /// Bytes covered by an issuer signature.
    pub fn signed_message(&self) -> Vec<u8> {
        claim_message(
            &self.domain,
            &self.identity_digest,
            &self.ephemeral_binding,
            self.issued_at,
        )
    }
}

fn claim_message(domain: &str, digest: &IdentityDigest, binding: &Fr, issued_at: u64) -> Vec<u8> {
    let mut message = Vec::with_capacity(CLAIM_MESSAGE_TAG.len() + 1 + domain.len() + 72);
    message.extend_from_slice(CLAIM_MESSAGE_TAG);
    message.push(domain.len() as u8);
    message.extend_from_slice(domain.as_bytes());
    message.extend_from_slice(digest.as_bytes());
    message.extend_from_slice(&field_to_bytes(binding));
    message.extend_from_slice(&issued_at.to_be_bytes());
    message
}

fn email_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[^@\s]+@((?:[a-z0-9](?:[a-z0-9-]*[a-z0-9])?\.)+[a-z]{2,})$")
            .unwrap_or_else(|e| panic!("email pattern is valid: {e}"))
    })
}

/// Domain part of a syntactically valid email address.
pub fn email_domain(email: &str) -> Option<String> {
    let email = email.trim().to_lowercase();
    email_pattern()
        .captures(&email)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

struct CodeExchange {
    channel: Arc<dyn CodeChannel>,
    signer: ClaimSigner,
}

/// Turns identity assertions into domain claims.
pub struct DomainClaimIssuer {
    allowlist: Arc<DomainAllowlist>,
    oauth: Option<OAuthVerifier>,
    code: Option<CodeExchange>,
    clock: Arc<dyn Clock>,
}

impl DomainClaimIssuer {
    pub fn new(allowlist: Arc<DomainAllowlist>, clock: Arc<dyn Clock>) -> Self {
        Self {
            allowlist,
            oauth: None,
            code: None,
            clock,
        }
    }

    pub fn with_oauth(mut self, verifier: OAuthVerifier) -> Self {
        self.oauth = Some(verifier);
        self
    }

    pub fn with_code_exchange(
        mut self,
        channel: Arc<dyn CodeChannel>,
        signer: ClaimSigner,
    ) -> Self {
        self.code = Some(CodeExchange { channel, signer });
        self
    }

    /// Issuer key for code-exchange claims, if that strategy is configured.
    pub fn claim_signer_key(&self) -> Option<VerifyingKey> {
        self.code.as_ref().map(|c| c.signer.verifying_key())
    }

    /// Issue a claim bound to `key`.
    #[instrument(level = "debug", skip_all, fields(source = ?assertion))]
    pub async fn issue(
        &self,
        assertion: IdentityAssertion,
        key: &EphemeralKey,
    ) -> Result<DomainClaim, ClaimError> {
        let claim = match assertion {
            IdentityAssertion::OAuth(oauth) => self.issue_from_token(&oauth, key).await?,
            IdentityAssertion::Code(code) => self.issue_from_code(&code, key).await?,
        };
        debug!(domain = %claim.domain, "domain claim issued");
        Ok(claim)
    }

    /// Start a code exchange: validate the address and have a code delivered.
    #[instrument(level = "debug", skip_all)]
    pub async fn request_code(&self, email: &str) -> Result<(), ClaimError> {
        let exchange = self
            .code
            .as_ref()
            .ok_or(ClaimError::StrategyUnavailable("code exchange"))?;
        let domain =
            email_domain(email).ok_or(ClaimError::InvalidAssertion("malformed email address"))?;
        self.check_domain(&domain).await?;
        exchange.channel.issue_code(email).await?;
        Ok(())
    }

    async fn issue_from_token(
        &self,
        assertion: &OAuthAssertion,
        key: &EphemeralKey,
    ) -> Result<DomainClaim, ClaimError> {
        let verifier = self
            .oauth
            .as_ref()
            .ok_or(ClaimError::StrategyUnavailable("oauth"))?;
        let VerifiedToken {
            key_id,
            claims,
            modulus,
        } = verifier.verify(&assertion.id_token)?;

        let domain = claims
            .hd
            .as_deref()
            .map(|hd| hd.trim().to_lowercase())
            .filter(|hd| !hd.is_empty())
            .ok_or(ClaimError::DomainMissing)?;

        let email = match (&claims.email, claims.email_verified) {
            (Some(email), true) => email.trim().to_lowercase(),
            _ => return Err(ClaimError::EmailUnverified),
        };

        check_nonce(claims.nonce.as_deref(), key)?;
        self.check_domain(&domain).await?;

        Ok(DomainClaim {
            identity_digest: IdentityDigest::from_oauth(&claims.iss, &claims.sub, &email, &domain),
            domain,
            ephemeral_binding: key.public_key_digest,
            issued_at: self.clock.now(),
            attestation: Attestation::Provider { key_id, modulus },
        })
    }

    async fn issue_from_code(
        &self,
        assertion: &CodeAssertion,
        key: &EphemeralKey,
    ) -> Result<DomainClaim, ClaimError> {
        let exchange = self
            .code
            .as_ref()
            .ok_or(ClaimError::StrategyUnavailable("code exchange"))?;

        check_nonce(Some(assertion.nonce.as_str()), key)?;
        let domain = email_domain(&assertion.email)
            .ok_or(ClaimError::InvalidAssertion("malformed email address"))?;
        self.check_domain(&domain).await?;

        if !exchange.channel.redeem_code(&assertion.email, &assertion.code).await? {
            return Err(ClaimError::InvalidOrExpiredCode);
        }

        let identity_digest = IdentityDigest::from_email(&assertion.email);
        let issued_at = self.clock.now();
        let message = claim_message(&domain, &identity_digest, &key.public_key_digest, issued_at);

        Ok(DomainClaim {
            domain,
            identity_digest,
            ephemeral_binding: key.public_key_digest,
            issued_at,
            attestation: Attestation::Issuer {
                verifying_key: exchange.signer.verifying_key(),
                signature: exchange.signer.sign(&message),
            },
        })
    }

    async fn check_domain(&self, domain: &str) -> Result<(), ClaimError> {
        if domain.len() > MAX_DOMAIN_LENGTH || !self.allowlist.is_recognized(domain).await {
            return Err(ClaimError::UnsupportedDomain);
        }
        Ok(())
    }
}

fn check_nonce(nonce: Option<&str>, key: &EphemeralKey) -> Result<(), ClaimError> {
    match nonce.map(field_from_hex) {
        Some(Ok(binding)) if binding == key.public_key_digest => Ok(()),
        _ => Err(ClaimError::NonceMismatch),
    }
}
