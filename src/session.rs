//! Verification state machine.
//!
//! ```text
//! Idle -> ConnectingIdentity -> Authenticating -> GeneratingProof -> Submitting -> Success
//!                 \__________________\________________\________________\______-> Error
//! Error -> Idle (reset)
//! ```
//!
//! One attempt runs at a time. Each attempt owns a fresh ephemeral key; the
//! key is dropped when the attempt concludes unless the failure allows a
//! [`VerificationSession::retry`] with the same key.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::claim::{
    CodeAssertion, DomainClaimIssuer, IdentityAssertion, IdentityProvider, OAuthAssertion,
};
use crate::clock::Clock;
use crate::config::Config;
use crate::ephemeral::{EphemeralKey, EphemeralKeyManager};
use crate::error::ErrorKind;
use crate::prover::{Proof, ProofGenerator, ProvingJob, ProvingMilestone};
use crate::registry::{RegistryEndpoint, SubjectId, VerificationRecord};

const KEY_READY: u8 = 5;
const ASSERTION_ACQUIRED: u8 = 15;
const CLAIM_ISSUED: u8 = 30;
const CLAIM_INGESTED: u8 = 40;
const WITNESS_COMPUTED: u8 = 50;
const PROVING: u8 = 60;
const PROVED: u8 = 70;
const SUBMITTING: u8 = 85;
const DONE: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VerificationStatus {
    Idle,
    ConnectingIdentity,
    Authenticating,
    GeneratingProof,
    Submitting,
    Success,
    Error,
}

impl VerificationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, VerificationStatus::Success | VerificationStatus::Error)
    }
}

/// Why an attempt failed and in which stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptFailure {
    pub kind: ErrorKind,
    pub stage: VerificationStatus,
    pub message: &'static str,
}

impl AttemptFailure {
    fn new(kind: ErrorKind, stage: VerificationStatus) -> Self {
        Self {
            kind,
            stage,
            message: kind.describe(),
        }
    }

    pub fn retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Observable session state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub status: VerificationStatus,
    /// 0..=100, never decreases within an attempt.
    pub progress: u8,
    pub failure: Option<AttemptFailure>,
    pub record: Option<VerificationRecord>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            status: VerificationStatus::Idle,
            progress: 0,
            failure: None,
            record: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("a verification attempt is already in progress")]
    Busy,

    #[error("the last attempt cannot be resumed")]
    RetryUnavailable,

    #[error("{}", .0.message)]
    Failed(AttemptFailure),
}

impl SessionError {
    /// Classified failure; `None` when no attempt ran.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            SessionError::Failed(failure) => Some(failure.kind),
            SessionError::Busy | SessionError::RetryUnavailable => None,
        }
    }
}

/// How the user proves their identity.
#[derive(Clone)]
pub enum VerificationMethod {
    /// Identity provider sign-in, one-tap first, popup as fallback.
    OAuth,
    /// Email plus a code previously requested through
    /// [`VerificationSession::request_code`].
    Code { email: String, code: String },
}

impl std::fmt::Debug for VerificationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerificationMethod::OAuth => f.write_str("OAuth"),
            VerificationMethod::Code { .. } => f.write_str("Code(<redacted>)"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    pub one_tap: Duration,
    pub popup: Duration,
    pub submission: Duration,
}

impl SessionTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            one_tap: config.one_tap_timeout(),
            popup: config.popup_timeout(),
            submission: config.submission_timeout(),
        }
    }
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Last stage an attempt completed, for resuming.
enum Checkpoint {
    Identity,
    Proving(ProvingJob),
    Submission(Proof),
}

impl Checkpoint {
    fn status(&self) -> VerificationStatus {
        match self {
            Checkpoint::Identity => VerificationStatus::ConnectingIdentity,
            Checkpoint::Proving(_) => VerificationStatus::GeneratingProof,
            Checkpoint::Submission(_) => VerificationStatus::Submitting,
        }
    }
}

struct Attempt {
    subject: SubjectId,
    method: VerificationMethod,
    key: EphemeralKey,
    checkpoint: Checkpoint,
}

#[derive(Default)]
struct Control {
    running: Option<(u64, CancellationToken)>,
    pending: Option<Attempt>,
    next_id: u64,
}

/// Clears the running slot when the attempt future finishes or is dropped.
struct Running<'a> {
    session: &'a VerificationSession,
    id: u64,
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        let mut control = self.session.lock();
        if control.running.as_ref().is_some_and(|(id, _)| *id == self.id) {
            control.running = None;
            self.session.state.send_if_modified(|s| {
                if s.status.is_terminal() {
                    return false;
                }
                s.failure = Some(AttemptFailure::new(ErrorKind::UserCancelled, s.status));
                s.status = VerificationStatus::Error;
                true
            });
        }
    }
}

fn failed(kind: ErrorKind, stage: VerificationStatus) -> AttemptFailure {
    AttemptFailure::new(kind, stage)
}

async fn cancellable<F: Future>(
    token: &CancellationToken,
    stage: VerificationStatus,
    fut: F,
) -> Result<F::Output, AttemptFailure> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(failed(ErrorKind::UserCancelled, stage)),
        out = fut => Ok(out),
    }
}

fn milestone_progress(milestone: ProvingMilestone) -> u8 {
    match milestone {
        ProvingMilestone::ClaimIngested => CLAIM_INGESTED,
        ProvingMilestone::WitnessComputed => WITNESS_COMPUTED,
        ProvingMilestone::Proved => PROVED,
    }
}

/// Orchestrates key generation, identity, proving and submission for one
/// user. An explicit context object; share it behind an `Arc`.
pub struct VerificationSession {
    keys: EphemeralKeyManager,
    issuer: Arc<DomainClaimIssuer>,
    provider: Option<Arc<dyn IdentityProvider>>,
    generator: Arc<ProofGenerator>,
    registry: Arc<dyn RegistryEndpoint>,
    timeouts: SessionTimeouts,
    clock: Arc<dyn Clock>,
    state: watch::Sender<SessionSnapshot>,
    control: Mutex<Control>,
}

impl VerificationSession {
    pub fn new(
        keys: EphemeralKeyManager,
        issuer: Arc<DomainClaimIssuer>,
        generator: Arc<ProofGenerator>,
        registry: Arc<dyn RegistryEndpoint>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (state, _) = watch::channel(SessionSnapshot::default());
        Self {
            keys,
            issuer,
            provider: None,
            generator,
            registry,
            timeouts: SessionTimeouts::default(),
            clock,
            state,
            control: Mutex::new(Control::default()),
        }
    }

    pub fn with_identity_provider(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_timeouts(mut self, timeouts: SessionTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    /// Have a one-time code delivered to `email` for the code method.
    pub async fn request_code(&self, email: &str) -> Result<(), SessionError> {
        self.issuer
            .request_code(email)
            .await
            .map_err(|e| SessionError::Failed(failed(e.kind(), VerificationStatus::Idle)))
    }

    /// Run a new attempt for `subject`.
    #[instrument(level = "info", skip_all, fields(%subject, ?method))]
    pub async fn verify(
        &self,
        subject: SubjectId,
        method: VerificationMethod,
    ) -> Result<VerificationRecord, SessionError> {
        let (running, token) = {
            let mut control = self.lock();
            if control.running.is_some() {
                return Err(SessionError::Busy);
            }
            control.pending = None;
            self.start(&mut control)
        };
        self.state.send_replace(SessionSnapshot {
            status: VerificationStatus::ConnectingIdentity,
            ..SessionSnapshot::default()
        });

        let key = match self.keys.generate() {
            Ok(key) => key,
            Err(e) => {
                let failure = failed(e.kind(), VerificationStatus::ConnectingIdentity);
                self.publish_failure(&failure);
                return Err(SessionError::Failed(failure));
            }
        };
        self.advance(KEY_READY);

        let attempt = Attempt {
            subject,
            method,
            key,
            checkpoint: Checkpoint::Identity,
        };
        self.drive(attempt, token, running).await
    }

    /// Resume the last failed attempt from the stage that failed, with the
    /// same key.
    #[instrument(level = "info", skip_all)]
    pub async fn retry(&self) -> Result<VerificationRecord, SessionError> {
        let (attempt, running, token) = {
            let mut control = self.lock();
            if control.running.is_some() {
                return Err(SessionError::Busy);
            }
            let attempt = control.pending.take().ok_or(SessionError::RetryUnavailable)?;
            if attempt.key.is_expired(self.clock.now()) {
                debug!("pending attempt key expired");
                return Err(SessionError::RetryUnavailable);
            }
            let (running, token) = self.start(&mut control);
            (attempt, running, token)
        };

        let status = attempt.checkpoint.status();
        self.state.send_modify(|s| {
            s.status = status;
            s.failure = None;
        });
        self.drive(attempt, token, running).await
    }

    /// Cancel the running attempt. Returns whether one was running.
    pub fn cancel(&self) -> bool {
        match &self.lock().running {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Back to `Idle`, dropping any resumable attempt.
    pub fn reset(&self) -> Result<(), SessionError> {
        let mut control = self.lock();
        if control.running.is_some() {
            return Err(SessionError::Busy);
        }
        control.pending = None;
        self.state.send_replace(SessionSnapshot::default());
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start(&self, control: &mut Control) -> (Running<'_>, CancellationToken) {
        let id = control.next_id;
        control.next_id += 1;
        let token = CancellationToken::new();
        control.running = Some((id, token.clone()));
        (Running { session: self, id }, token)
    }

    async fn drive(
        &self,
        mut attempt: Attempt,
        token: CancellationToken,
        running: Running<'_>,
    ) -> Result<VerificationRecord, SessionError> {
        let outcome = self.run(&mut attempt, &token).await;

        let result = {
            let mut control = self.lock();
            match outcome {
                Ok(record) => {
                    info!(nullifier = %record.nullifier, "verification succeeded");
                    self.state.send_modify(|s| {
                        s.status = VerificationStatus::Success;
                        s.progress = DONE;
                        s.record = Some(record.clone());
                    });
                    Ok(record)
                }
                Err(failure) => {
                    warn!(kind = ?failure.kind, stage = ?failure.stage, "verification failed");
                    self.publish_failure(&failure);
                    if failure.kind.reuses_key() {
                        control.pending = Some(attempt);
                    }
                    Err(SessionError::Failed(failure))
                }
            }
        };
        drop(running);
        result
    }

    async fn run(
        &self,
        attempt: &mut Attempt,
        token: &CancellationToken,
    ) -> Result<VerificationRecord, AttemptFailure> {
        loop {
            let next = match &attempt.checkpoint {
                Checkpoint::Identity => Checkpoint::Proving(
                    self.authenticate(&attempt.method, &attempt.key, token).await?,
                ),
                Checkpoint::Proving(job) => {
                    Checkpoint::Submission(self.prove(job, &attempt.key, token).await?)
                }
                Checkpoint::Submission(proof) => {
                    return self.submit(proof, &attempt.subject, token).await;
                }
            };
            attempt.checkpoint = next;
        }
    }

    async fn authenticate(
        &self,
        method: &VerificationMethod,
        key: &EphemeralKey,
        token: &CancellationToken,
    ) -> Result<ProvingJob, AttemptFailure> {
        let assertion = match method {
            VerificationMethod::OAuth => IdentityAssertion::OAuth(OAuthAssertion {
                id_token: self.acquire_token(key, token).await?,
            }),
            VerificationMethod::Code { email, code } => IdentityAssertion::Code(CodeAssertion {
                email: email.clone(),
                code: code.clone(),
                nonce: key.nonce(),
            }),
        };
        self.transition(VerificationStatus::Authenticating, ASSERTION_ACQUIRED);

        let stage = VerificationStatus::Authenticating;
        let claim = cancellable(token, stage, self.issuer.issue(assertion, key))
            .await?
            .map_err(|e| failed(e.kind(), stage))?;
        self.advance(CLAIM_ISSUED);

        self.transition(VerificationStatus::GeneratingProof, CLAIM_ISSUED);
        let observer = |m: ProvingMilestone| self.advance(milestone_progress(m));
        self.generator
            .ingest(claim, key, &observer)
            .map_err(|e| failed(e.kind(), VerificationStatus::GeneratingProof))
    }

    async fn acquire_token(
        &self,
        key: &EphemeralKey,
        token: &CancellationToken,
    ) -> Result<String, AttemptFailure> {
        let stage = VerificationStatus::ConnectingIdentity;
        let provider = self
            .provider
            .as_ref()
            .ok_or_else(|| failed(ErrorKind::InvalidAssertion, stage))?;
        let nonce = key.nonce();

        let one_tap = tokio::time::timeout(self.timeouts.one_tap, provider.one_tap(&nonce));
        match cancellable(token, stage, one_tap).await? {
            Ok(Ok(id_token)) => return Ok(id_token),
            Ok(Err(e)) => debug!("one-tap unavailable ({e}), falling back to popup"),
            Err(_) => debug!("one-tap timed out, falling back to popup"),
        }

        let popup = tokio::time::timeout(self.timeouts.popup, provider.popup(&nonce));
        match cancellable(token, stage, popup).await? {
            Ok(Ok(id_token)) => Ok(id_token),
            Ok(Err(e)) => Err(failed(e.kind(), stage)),
            Err(_) => Err(failed(ErrorKind::NetworkFailure, stage)),
        }
    }

    async fn prove(
        &self,
        job: &ProvingJob,
        key: &EphemeralKey,
        token: &CancellationToken,
    ) -> Result<Proof, AttemptFailure> {
        let stage = VerificationStatus::GeneratingProof;
        self.transition(stage, PROVING);
        let observer = |m: ProvingMilestone| self.advance(milestone_progress(m));
        cancellable(token, stage, self.generator.prove(job, key, &observer))
            .await?
            .map_err(|e| failed(e.kind(), stage))
    }

    async fn submit(
        &self,
        proof: &Proof,
        subject: &SubjectId,
        token: &CancellationToken,
    ) -> Result<VerificationRecord, AttemptFailure> {
        let stage = VerificationStatus::Submitting;
        self.transition(stage, SUBMITTING);
        let submission = tokio::time::timeout(
            self.timeouts.submission,
            self.registry.submit_proof(proof, subject.clone()),
        );
        match cancellable(token, stage, submission).await? {
            Ok(Ok(record)) => Ok(record),
            Ok(Err(e)) => Err(failed(e.kind(), stage)),
            Err(_) => Err(failed(ErrorKind::NetworkFailure, stage)),
        }
    }

    fn advance(&self, progress: u8) {
        self.state.send_if_modified(|s| {
            let raised = progress > s.progress;
            s.progress = s.progress.max(progress);
            raised
        });
    }

    fn transition(&self, status: VerificationStatus, progress: u8) {
        self.state.send_modify(|s| {
            s.status = status;
            s.progress = s.progress.max(progress);
        });
    }

    fn publish_failure(&self, failure: &AttemptFailure) {
        self.state.send_modify(|s| {
            s.status = VerificationStatus::Error;
            s.failure = Some(failure.clone());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{CircuitInputs, PublicInputs};
    use crate::claim::oauth::test_support::{sign_token, verifier, workspace_payload, TEST_KID};
    use crate::claim::{
        ClaimSigner, DeliveredCode, DomainAllowlist, InMemoryCodeChannel, ProviderError,
    };
    use crate::clock::ManualClock;
    use crate::config::AllowlistConfig;
    use crate::prover::{BackendError, ProvingBackend};
    use crate::registry::{RegistryError, VerificationRegistry};
    use crate::verifier::{ProofVerifier, VerifierResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc::UnboundedReceiver;

    #[derive(Clone, Copy)]
    enum OneTap {
        Succeed,
        Unsupported,
        Hang,
    }

    #[derive(Clone, Copy)]
    enum Popup {
        Succeed,
        Close,
        Hang,
    }

    struct ScriptedProvider {
        email: &'static str,
        hd: Option<&'static str>,
        one_tap: OneTap,
        popup: Popup,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn token(&self, nonce: &str) -> String {
            sign_token(TEST_KID, &workspace_payload(self.email, self.hd, nonce, 5_000))
        }
    }

    #[async_trait]
    impl IdentityProvider for ScriptedProvider {
        async fn one_tap(&self, nonce: &str) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.one_tap {
                OneTap::Succeed => Ok(self.token(nonce)),
                OneTap::Unsupported => Err(ProviderError::Unsupported),
                OneTap::Hang => std::future::pending().await,
            }
        }

        async fn popup(&self, nonce: &str) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.popup {
                Popup::Succeed => Ok(self.token(nonce)),
                Popup::Close => Err(ProviderError::Cancelled),
                Popup::Hang => std::future::pending().await,
            }
        }
    }

    /// Echoes the expected inputs; fails the first `failures` calls.
    struct FlakyBackend {
        failures: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ProvingBackend for FlakyBackend {
        fn circuit_id(&self) -> String {
            "echo".into()
        }

        async fn prove(
            &self,
            inputs: CircuitInputs,
        ) -> Result<(Vec<u8>, PublicInputs), BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(BackendError::Unavailable("503".into()));
            }
            Ok((vec![0xaa], inputs.public))
        }
    }

    struct AcceptAll;

    impl ProofVerifier for AcceptAll {
        fn circuit_id(&self) -> &str {
            "echo"
        }

        fn verify(&self, _proof: &Proof) -> VerifierResult<bool> {
            Ok(true)
        }
    }

    struct Harness {
        session: Arc<VerificationSession>,
        registry: Arc<VerificationRegistry>,
        backend: Arc<FlakyBackend>,
        provider: Arc<ScriptedProvider>,
        delivered: UnboundedReceiver<DeliveredCode>,
    }

    /// Records the proof, then stalls past the submission timeout once.
    struct LostResponse {
        registry: Arc<VerificationRegistry>,
        stalled: AtomicUsize,
    }

    #[async_trait]
    impl RegistryEndpoint for LostResponse {
        async fn submit_proof(
            &self,
            proof: &Proof,
            subject: SubjectId,
        ) -> Result<VerificationRecord, RegistryError> {
            let record = self.registry.submit(proof, subject)?;
            if self.stalled.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
            }
            Ok(record)
        }
    }

    fn harness(provider: ScriptedProvider, backend_failures: usize) -> Harness {
        harness_with_endpoint(provider, backend_failures, |registry| registry)
    }

    fn harness_with_endpoint(
        provider: ScriptedProvider,
        backend_failures: usize,
        endpoint: impl FnOnce(Arc<VerificationRegistry>) -> Arc<dyn RegistryEndpoint>,
    ) -> Harness {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_000));
        let allowlist = Arc::new(DomainAllowlist::new(&AllowlistConfig {
            domains: vec!["state-u.edu".into()],
            patterns: vec![],
            cache_ttl_secs: 60,
        }));
        let (channel, delivered) = InMemoryCodeChannel::new(Duration::from_secs(600));
        let issuer = DomainClaimIssuer::new(allowlist, clock.clone())
            .with_oauth(verifier(clock.clone()))
            .with_code_exchange(Arc::new(channel), ClaimSigner::generate());

        let backend = Arc::new(FlakyBackend {
            failures: AtomicUsize::new(backend_failures),
            calls: AtomicUsize::new(0),
        });
        let generator =
            ProofGenerator::new(backend.clone(), None, Duration::from_secs(30), clock.clone());
        let registry = Arc::new(VerificationRegistry::new(Arc::new(AcceptAll), clock.clone()));
        let provider = Arc::new(provider);

        let session = VerificationSession::new(
            EphemeralKeyManager::new(Duration::from_secs(900), clock.clone()),
            Arc::new(issuer),
            Arc::new(generator),
            endpoint(registry.clone()),
            clock,
        )
        .with_identity_provider(provider.clone());

        Harness {
            session: Arc::new(session),
            registry,
            backend,
            provider,
            delivered,
        }
    }

    fn provider(one_tap: OneTap, popup: Popup) -> ScriptedProvider {
        ScriptedProvider {
            email: "alice@state-u.edu",
            hd: Some("state-u.edu"),
            one_tap,
            popup,
            calls: AtomicUsize::new(0),
        }
    }

    fn wallet() -> SubjectId {
        SubjectId::wallet("0x00000000000000000000000000000000000000a1").unwrap()
    }

    #[tokio::test]
    async fn test_one_tap_success() {
        let h = harness(provider(OneTap::Succeed, Popup::Close), 0);
        let mut updates = h.session.subscribe();
        let watcher = tokio::spawn(async move {
            let mut seen = Vec::new();
            loop {
                let snapshot = updates.borrow_and_update().clone();
                seen.push(snapshot.progress);
                if snapshot.status.is_terminal() || updates.changed().await.is_err() {
                    break;
                }
            }
            seen
        });

        let record = h.session.verify(wallet(), VerificationMethod::OAuth).await.unwrap();
        assert!(record.exists);
        assert!(h.registry.exists(&wallet()));

        let snapshot = h.session.snapshot();
        assert_eq!(snapshot.status, VerificationStatus::Success);
        assert_eq!(snapshot.progress, 100);
        assert_eq!(snapshot.record, Some(record));

        let seen = watcher.await.unwrap();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {seen:?}");
        assert_eq!(seen.last(), Some(&100));
    }

    #[tokio::test]
    async fn test_popup_fallback() {
        let h = harness(provider(OneTap::Unsupported, Popup::Succeed), 0);
        h.session.verify(wallet(), VerificationMethod::OAuth).await.unwrap();
        assert_eq!(h.provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_closed_popup_is_cancellation() {
        let h = harness(provider(OneTap::Unsupported, Popup::Close), 0);
        let err = h.session.verify(wallet(), VerificationMethod::OAuth).await.unwrap_err();

        assert_eq!(err.kind(), Some(ErrorKind::UserCancelled));
        assert!(h.registry.is_empty());
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0);

        let snapshot = h.session.snapshot();
        assert_eq!(snapshot.status, VerificationStatus::Error);
        assert_eq!(
            snapshot.failure.map(|f| f.stage),
            Some(VerificationStatus::ConnectingIdentity)
        );
        assert!(matches!(h.session.retry().await, Err(SessionError::RetryUnavailable)));
    }

    #[tokio::test]
    async fn test_personal_account_fails_before_proving() {
        let mut personal = provider(OneTap::Succeed, Popup::Close);
        personal.email = "someone@gmail.com";
        personal.hd = None;
        let h = harness(personal, 0);

        let err = h.session.verify(wallet(), VerificationMethod::OAuth).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::DomainMissing));
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_second_verify_is_busy_and_cancel_unwinds() {
        let h = harness(provider(OneTap::Unsupported, Popup::Hang), 0);
        let mut updates = h.session.subscribe();

        let session = h.session.clone();
        let first =
            tokio::spawn(async move { session.verify(wallet(), VerificationMethod::OAuth).await });
        updates
            .wait_for(|s| {
                s.status == VerificationStatus::ConnectingIdentity && s.progress >= KEY_READY
            })
            .await
            .unwrap();

        let second = h.session.verify(wallet(), VerificationMethod::OAuth).await;
        assert!(matches!(second, Err(SessionError::Busy)));
        assert!(matches!(h.session.reset(), Err(SessionError::Busy)));

        assert!(h.session.cancel());
        let err = first.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::UserCancelled));
        assert!(h.registry.is_empty());
        assert!(!h.session.cancel());
    }

    #[tokio::test]
    async fn test_retry_resumes_proving_with_same_key() {
        let h = harness(provider(OneTap::Succeed, Popup::Close), 1);

        let err = h.session.verify(wallet(), VerificationMethod::OAuth).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::ProvingBackendUnavailable));
        let failed_at = h.session.snapshot();
        assert_eq!(
            failed_at.failure.as_ref().map(|f| f.stage),
            Some(VerificationStatus::GeneratingProof)
        );
        assert!(failed_at.failure.as_ref().is_some_and(|f| f.retryable()));

        let record = h.session.retry().await.unwrap();
        assert!(record.exists);
        // Identity was not acquired again
        assert_eq!(h.provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 2);
        assert!(h.session.snapshot().progress >= failed_at.progress);

        assert!(matches!(h.session.retry().await, Err(SessionError::RetryUnavailable)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_tap_timeout_falls_back_to_popup() {
        let h = harness(provider(OneTap::Hang, Popup::Succeed), 0);
        let record = h.session.verify(wallet(), VerificationMethod::OAuth).await.unwrap();
        assert!(record.exists);
        assert_eq!(h.provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_popup_timeout_is_retryable_network_failure() {
        let h = harness(provider(OneTap::Unsupported, Popup::Hang), 0);
        let err = h.session.verify(wallet(), VerificationMethod::OAuth).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::NetworkFailure));

        let failure = h.session.snapshot().failure.unwrap();
        assert_eq!(failure.stage, VerificationStatus::ConnectingIdentity);
        assert!(failure.retryable());
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0);

        // The attempt is kept and identity is acquired again on retry
        let err = h.session.retry().await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::NetworkFailure));
        assert_eq!(h.provider.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_lost_submission_response() {
        let h = harness_with_endpoint(provider(OneTap::Succeed, Popup::Close), 0, |registry| {
            Arc::new(LostResponse {
                registry,
                stalled: AtomicUsize::new(0),
            })
        });

        let err = h.session.verify(wallet(), VerificationMethod::OAuth).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::NetworkFailure));
        assert!(h.registry.exists(&wallet()));

        let record = h.session.retry().await.unwrap();
        assert_eq!(h.registry.lookup(&wallet()), Some(record));
        assert_eq!(h.session.snapshot().status, VerificationStatus::Success);
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reset_returns_to_idle() {
        let h = harness(provider(OneTap::Unsupported, Popup::Close), 0);
        h.session.verify(wallet(), VerificationMethod::OAuth).await.unwrap_err();
        assert!(h.session.snapshot().progress > 0);

        h.session.reset().unwrap();
        assert_eq!(h.session.snapshot(), SessionSnapshot::default());
    }

    #[tokio::test]
    async fn test_code_method() {
        let mut h = harness(provider(OneTap::Unsupported, Popup::Close), 0);
        h.session.request_code("bob@state-u.edu").await.unwrap();
        let sent = h.delivered.recv().await.unwrap();

        let method = VerificationMethod::Code {
            email: "bob@state-u.edu".into(),
            code: sent.code.clone(),
        };
        h.session.verify(wallet(), method.clone()).await.unwrap();
        assert_eq!(h.provider.calls.load(Ordering::SeqCst), 0);

        let other = SubjectId::account("bob-2");
        let err = h.session.verify(other, method).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::InvalidOrExpiredCode));
    }

    #[tokio::test]
    async fn test_dropped_attempt_releases_session() {
        let h = harness(provider(OneTap::Unsupported, Popup::Hang), 0);
        let attempt = h.session.verify(wallet(), VerificationMethod::OAuth);
        let _ = tokio::time::timeout(Duration::from_millis(50), attempt).await;

        assert_eq!(h.session.snapshot().status, VerificationStatus::Error);
        h.session.reset().unwrap();
    }
}
