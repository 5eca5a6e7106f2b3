//! Email + one-time code exchange.
//!
//! The code channel (generation, storage, delivery) is an external
//! collaborator. [`InMemoryCodeChannel`] is a reference implementation that
//! delivers codes to an outbox instead of sending email.

use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::{rngs::OsRng, Rng};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::error::ErrorKind;

pub const CODE_LENGTH: usize = 6;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("code channel unavailable: {0}")]
    Unavailable(String),
}

impl ChannelError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::NetworkFailure
    }
}

/// Out-of-band channel proving control of an email address.
#[async_trait]
pub trait CodeChannel: Send + Sync {
    /// Generate, store and deliver a fresh code for `email`.
    async fn issue_code(&self, email: &str) -> Result<(), ChannelError>;

    /// Redeem a code. A stored code is consumed by the first attempt,
    /// whether it matches or not.
    async fn redeem_code(&self, email: &str, code: &str) -> Result<bool, ChannelError>;
}

/// A code handed to the delivery outbox.
#[derive(Debug, Clone)]
pub struct DeliveredCode {
    pub email: String,
    pub code: String,
}

struct StoredCode {
    code: String,
    issued: Instant,
}

pub struct InMemoryCodeChannel {
    codes: Mutex<HashMap<String, StoredCode>>,
    ttl: Duration,
    outbox: mpsc::UnboundedSender<DeliveredCode>,
}

impl InMemoryCodeChannel {
    pub fn new(ttl: Duration) -> (Self, mpsc::UnboundedReceiver<DeliveredCode>) {
        let (outbox, delivered) = mpsc::unbounded_channel();
        let channel = Self {
            codes: Mutex::new(HashMap::new()),
            ttl,
            outbox,
        };
        (channel, delivered)
    }
}

#[async_trait]
impl CodeChannel for InMemoryCodeChannel {
    async fn issue_code(&self, email: &str) -> Result<(), ChannelError> {
        let code = format!(
            "{:0width$}",
            OsRng.gen_range(0..10u32.pow(CODE_LENGTH as u32)),
            width = CODE_LENGTH
        );
        let email = email.trim().to_lowercase();

        self.codes.lock().await.insert(
            email.clone(),
            StoredCode {
                code: code.clone(),
                issued: Instant::now(),
            },
        );
        self.outbox
            .send(DeliveredCode { email, code })
            .map_err(|_| ChannelError::Unavailable("delivery outbox closed".into()))?;
        debug!("one-time code issued");
        Ok(())
    }

    async fn redeem_code(&self, email: &str, code: &str) -> Result<bool, ChannelError> {
        let stored = self.codes.lock().await.remove(&email.trim().to_lowercase());
        Ok(stored
            .is_some_and(|stored| stored.issued.elapsed() < self.ttl && stored.code == code.trim()))
    }
}

/// Protocol-held key that signs claims issued through code exchange.
pub struct ClaimSigner {
    signing_key: SigningKey,
}

impl ClaimSigner {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(secret),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_code_is_single_use() {
        let (channel, mut delivered) = InMemoryCodeChannel::new(Duration::from_secs(600));
        channel.issue_code("Alice@State-U.edu").await.unwrap();

        let sent = delivered.recv().await.unwrap();
        assert_eq!(sent.email, "alice@state-u.edu");
        assert_eq!(sent.code.len(), CODE_LENGTH);

        assert!(channel.redeem_code("alice@state-u.edu", &sent.code).await.unwrap());
        assert!(!channel.redeem_code("alice@state-u.edu", &sent.code).await.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_code_burns_stored_code() {
        let (channel, mut delivered) = InMemoryCodeChannel::new(Duration::from_secs(600));
        channel.issue_code("bob@state-u.edu").await.unwrap();
        let sent = delivered.recv().await.unwrap();

        let wrong = if sent.code == "000000" { "111111" } else { "000000" };
        assert!(!channel.redeem_code("bob@state-u.edu", wrong).await.unwrap());
        assert!(!channel.redeem_code("bob@state-u.edu", &sent.code).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_code_rejected() {
        let (channel, mut delivered) = InMemoryCodeChannel::new(Duration::ZERO);
        channel.issue_code("carol@state-u.edu").await.unwrap();
        let sent = delivered.recv().await.unwrap();
        assert!(!channel.redeem_code("carol@state-u.edu", &sent.code).await.unwrap());
    }

    #[test]
    fn test_signer_round_trip() {
        let signer = ClaimSigner::from_bytes(&[7u8; 32]);
        let signature = signer.sign(b"claim");
        assert!(signer.verifying_key().verify_strict(b"claim", &signature).is_ok());
        assert!(signer.verifying_key().verify_strict(b"other", &signature).is_err());
    }
}
