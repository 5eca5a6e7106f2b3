//! Failure taxonomy shared by every protocol component.
//!
//! Each component has its own error enum; all of them classify into an
//! [`ErrorKind`] so the session can decide what to offer the user.
//! Messages never carry identity digests, email addresses or key material.

use serde::{Deserialize, Serialize};

/// Classified failure of a verification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The identity token carries no workspace/organization domain.
    DomainMissing,
    /// The identity provider has not verified the email address.
    EmailUnverified,
    /// The domain is not a recognized organization.
    UnsupportedDomain,
    /// The assertion is bound to a different ephemeral key.
    NonceMismatch,
    /// The one-time code did not match or has expired.
    InvalidOrExpiredCode,
    /// The identity assertion could not be decoded or authenticated.
    InvalidAssertion,
    /// The claim is malformed or inconsistent for the circuit.
    ClaimRejectedByCircuit,
    /// The proving backend timed out or is unreachable.
    ProvingBackendUnavailable,
    /// The proving backend runs a circuit other than the pinned one.
    CircuitVersionMismatch,
    /// The ephemeral key expired before the proof could be emitted.
    KeyExpiredDuringProving,
    /// The proof's public inputs do not follow the protocol layout.
    MalformedProof,
    /// The proof does not verify.
    InvalidProof,
    /// The expiry embedded in the proof has passed.
    ExpiredBinding,
    /// The identity (or the subject) is already registered.
    AlreadyRegistered,
    /// The user closed the identity prompt or cancelled the attempt.
    UserCancelled,
    /// A collaborator could not be reached.
    NetworkFailure,
    /// The OS entropy source failed.
    EntropyFailure,
}

impl ErrorKind {
    /// Whether the UI should offer a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::ProvingBackendUnavailable
                | ErrorKind::NetworkFailure
                | ErrorKind::UserCancelled
        )
    }

    /// Whether a retry may keep the attempt's ephemeral key.
    ///
    /// Every other kind requires a fresh attempt.
    pub fn reuses_key(&self) -> bool {
        matches!(
            self,
            ErrorKind::ProvingBackendUnavailable | ErrorKind::NetworkFailure
        )
    }

    /// Short user-facing description.
    pub fn describe(&self) -> &'static str {
        match self {
            ErrorKind::DomainMissing => {
                "account must belong to an organization; personal accounts are not supported"
            }
            ErrorKind::EmailUnverified => "email address must be verified by the identity provider",
            ErrorKind::UnsupportedDomain => "domain is not a recognized organization",
            ErrorKind::NonceMismatch => "identity assertion belongs to a different session",
            ErrorKind::InvalidOrExpiredCode => "invalid or expired code",
            ErrorKind::InvalidAssertion => "identity assertion could not be authenticated",
            ErrorKind::ClaimRejectedByCircuit => "claim rejected by the circuit",
            ErrorKind::ProvingBackendUnavailable => "proving backend unavailable",
            ErrorKind::CircuitVersionMismatch => "proving backend runs an unexpected circuit",
            ErrorKind::KeyExpiredDuringProving => "session key expired while proving",
            ErrorKind::MalformedProof => "malformed proof",
            ErrorKind::InvalidProof => "invalid proof",
            ErrorKind::ExpiredBinding => "proof binding has expired",
            ErrorKind::AlreadyRegistered => "identity already registered",
            ErrorKind::UserCancelled => "cancelled by user",
            ErrorKind::NetworkFailure => "network failure",
            ErrorKind::EntropyFailure => "entropy source failure",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(ErrorKind::ProvingBackendUnavailable.reuses_key());
        assert!(ErrorKind::NetworkFailure.reuses_key());
        assert!(ErrorKind::UserCancelled.is_retryable());
        assert!(!ErrorKind::UserCancelled.reuses_key());

        for kind in [
            ErrorKind::UnsupportedDomain,
            ErrorKind::AlreadyRegistered,
            ErrorKind::NonceMismatch,
            ErrorKind::ExpiredBinding,
        ] {
            assert!(!kind.is_retryable(), "{kind:?} must be final");
        }
    }
}
