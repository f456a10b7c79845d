//! Authorization session.
//!
//! [`AuthorizationSession`] drives one OAuth 2.0 authorization at a time:
//!
//! ```text
//! Idle ──start──▶ AuthorizationStarted ──redirect──▶ Completed | Failed
//!                        │
//!                        └──abort / supersede / expire──▶ Aborted
//! ```
//!
//! Every [`start`](AuthorizationSession::start) returns an
//! [`AuthorizationTicket`] that resolves exactly once, with an
//! [`AuthorizationOutcome`]. The completion side is a one-shot channel
//! consumed on first use; if it is dropped unsent (the session went away)
//! the ticket resolves to `Cancelled(Abandoned)`.
//!
//! State transitions are serialized through a mutex that is only held for
//! check-and-mutate regions. The code exchange runs without it; when it
//! returns, its result is applied only if the same pending authorization is
//! still outstanding.

use std::sync::{Arc, Weak};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{Mutex, oneshot};
use url::Url;

use crate::config::{GrantConfiguration, SmartClientConfig};
use crate::conformance::EndpointSet;
use crate::error::SmartError;
use crate::grant::{AuthorizationRequest, GrantStrategy};
use crate::http::HttpClient;
use crate::token::{TokenPersistence, TokenStore};

// =============================================================================
// Host collaborators
// =============================================================================

/// How the authorization URL is shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresentationMode {
    /// In a web view owned by the host application.
    #[default]
    Embedded,
    /// In the system browser.
    External,
}

/// Presents authorization URLs to the user.
///
/// Implemented by the host. Exactly one of the two methods is called per
/// [`AuthorizationSession::start`]. The host later delivers the redirect to
/// [`AuthorizationSession::handle_redirect`].
pub trait AuthorizationPresenter: Send + Sync {
    /// Shows the URL in an embedded web view.
    fn present_embedded(&self, url: &Url) -> Result<(), SmartError>;

    /// Opens the URL in an external browser.
    fn open_externally(&self, url: &Url) -> Result<(), SmartError>;
}

// =============================================================================
// Outcomes
// =============================================================================

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No authorization has been started, or the session was reset.
    Idle,
    /// An authorization is pending.
    AuthorizationStarted,
    /// The last authorization produced a token.
    Completed,
    /// The last authorization failed.
    Failed,
    /// The last authorization was cancelled.
    Aborted,
}

/// Why an authorization was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// A newer authorization was started, or the endpoints changed.
    Superseded,
    /// [`AuthorizationSession::abort`] was called.
    Aborted,
    /// The pending authorization outlived its configured lifetime.
    Expired,
    /// The session was dropped with the authorization still pending.
    Abandoned,
}

impl CancelReason {
    /// Returns `true` for cancellations that act as a timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Superseded | Self::Expired)
    }
}

/// Result of one authorization.
#[derive(Debug, Clone)]
pub enum AuthorizationOutcome {
    /// A token was obtained and stored.
    Authorized {
        /// Launch context identifier, if the server sent one.
        context_id: Option<String>,
        /// Granted scopes, if reported.
        scope: Option<String>,
    },
    /// The authorization was cancelled. Not an error.
    Cancelled(CancelReason),
    /// The authorization failed.
    Failed(SmartError),
}

impl AuthorizationOutcome {
    /// Returns `true` if a token was obtained.
    #[must_use]
    pub fn is_authorized(&self) -> bool {
        matches!(self, Self::Authorized { .. })
    }

    /// Returns `true` if the authorization was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Returns the error of a failed authorization.
    #[must_use]
    pub fn error(&self) -> Option<&SmartError> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Sending half of the completion channel.
///
/// Consumed by [`complete`](Self::complete); reports `Abandoned` if dropped
/// without completing.
struct CompletionSender(Option<oneshot::Sender<AuthorizationOutcome>>);

impl CompletionSender {
    fn channel() -> (Self, AuthorizationTicket) {
        let (tx, rx) = oneshot::channel();
        (Self(Some(tx)), AuthorizationTicket { receiver: rx })
    }

    fn complete(mut self, outcome: AuthorizationOutcome) {
        if let Some(tx) = self.0.take() {
            // The ticket holder may have stopped listening
            let _ = tx.send(outcome);
        }
    }
}

impl Drop for CompletionSender {
    fn drop(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(AuthorizationOutcome::Cancelled(CancelReason::Abandoned));
        }
    }
}

/// Resolves to the outcome of one authorization.
#[derive(Debug)]
pub struct AuthorizationTicket {
    receiver: oneshot::Receiver<AuthorizationOutcome>,
}

impl AuthorizationTicket {
    /// Waits for the outcome.
    pub async fn outcome(self) -> AuthorizationOutcome {
        self.receiver
            .await
            .unwrap_or(AuthorizationOutcome::Cancelled(CancelReason::Abandoned))
    }

    /// Returns the outcome if it is already available.
    pub fn try_outcome(&mut self) -> Option<AuthorizationOutcome> {
        self.receiver.try_recv().ok()
    }
}

// =============================================================================
// Session
// =============================================================================

struct PendingAuthorization {
    generation: u64,
    issued_at: OffsetDateTime,
    request: AuthorizationRequest,
    exchanging: bool,
    completion: CompletionSender,
}

struct SessionCore {
    strategy: Option<Arc<GrantStrategy>>,
    pending: Option<PendingAuthorization>,
    state: SessionState,
    next_generation: u64,
}

impl SessionCore {
    /// Removes the pending authorization and completes it as cancelled.
    fn cancel_pending(&mut self, reason: CancelReason) -> bool {
        let Some(pending) = self.pending.take() else {
            return false;
        };
        tracing::debug!(
            "Cancelling pending authorization {} ({:?}, issued at {})",
            pending.generation,
            reason,
            pending.issued_at
        );
        self.state = SessionState::Aborted;
        pending
            .completion
            .complete(AuthorizationOutcome::Cancelled(reason));
        true
    }
}

struct SessionShared {
    config: GrantConfiguration,
    http: Arc<dyn HttpClient>,
    presenter: Arc<dyn AuthorizationPresenter>,
    tokens: TokenStore,
    pending_lifetime: Option<Duration>,
    core: Mutex<SessionCore>,
}

/// Builder for [`AuthorizationSession`].
pub struct AuthorizationSessionBuilder {
    config: GrantConfiguration,
    http: Arc<dyn HttpClient>,
    presenter: Arc<dyn AuthorizationPresenter>,
    endpoints: Option<EndpointSet>,
    persistence: Option<Arc<dyn TokenPersistence>>,
    token_expiry_leeway: Duration,
    pending_lifetime: Option<Duration>,
}

impl AuthorizationSessionBuilder {
    /// Configures the endpoints up front.
    #[must_use]
    pub fn endpoints(mut self, endpoints: Option<EndpointSet>) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Sets the token persistence collaborator.
    #[must_use]
    pub fn persistence(mut self, persistence: Arc<dyn TokenPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Sets the leeway applied when checking token expiry.
    #[must_use]
    pub fn token_expiry_leeway(mut self, leeway: Duration) -> Self {
        self.token_expiry_leeway = leeway;
        self
    }

    /// Expires a pending authorization after this long.
    #[must_use]
    pub fn pending_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.pending_lifetime = lifetime;
        self
    }

    /// Builds the session.
    ///
    /// # Errors
    ///
    /// Returns `SmartError::Configuration` if endpoints were given and the
    /// grant strategy cannot be built from them.
    pub fn build(self) -> Result<AuthorizationSession, SmartError> {
        let strategy = self
            .endpoints
            .as_ref()
            .map(|e| GrantStrategy::new(self.config.clone(), e))
            .transpose()?
            .map(Arc::new);

        let mut tokens = TokenStore::builder(self.config.client_id.clone(), self.http.clone())
            .client_secret(self.config.client_secret.clone())
            .context_field(self.config.context_field.clone())
            .leeway(self.token_expiry_leeway)
            .token_url(self.endpoints.and_then(|e| e.token_url));
        if let Some(persistence) = self.persistence {
            tokens = tokens.persistence(persistence);
        }

        Ok(AuthorizationSession {
            shared: Arc::new(SessionShared {
                config: self.config,
                http: self.http,
                presenter: self.presenter,
                tokens: tokens.build(),
                pending_lifetime: self.pending_lifetime,
                core: Mutex::new(SessionCore {
                    strategy,
                    pending: None,
                    state: SessionState::Idle,
                    next_generation: 0,
                }),
            }),
        })
    }
}

/// Orchestrates authorizations and owns the resulting token store.
///
/// Cloning is cheap; clones drive the same session.
#[derive(Clone)]
pub struct AuthorizationSession {
    shared: Arc<SessionShared>,
}

impl AuthorizationSession {
    /// Starts building a session.
    pub fn builder(
        config: GrantConfiguration,
        http: Arc<dyn HttpClient>,
        presenter: Arc<dyn AuthorizationPresenter>,
    ) -> AuthorizationSessionBuilder {
        AuthorizationSessionBuilder {
            config,
            http,
            presenter,
            endpoints: None,
            persistence: None,
            token_expiry_leeway: Duration::from_secs(30),
            pending_lifetime: None,
        }
    }

    /// Starts building a session from file-level settings.
    ///
    /// # Errors
    ///
    /// Returns `SmartError::Configuration` if the settings do not validate.
    pub fn from_config(
        config: &SmartClientConfig,
        http: Arc<dyn HttpClient>,
        presenter: Arc<dyn AuthorizationPresenter>,
    ) -> Result<AuthorizationSessionBuilder, SmartError> {
        Ok(Self::builder(config.grant_configuration()?, http, presenter)
            .token_expiry_leeway(config.token_expiry_leeway)
            .pending_lifetime(config.pending_lifetime))
    }

    /// Returns the grant configuration.
    #[must_use]
    pub fn config(&self) -> &GrantConfiguration {
        &self.shared.config
    }

    /// Returns the token store holding this session's token.
    #[must_use]
    pub fn tokens(&self) -> &TokenStore {
        &self.shared.tokens
    }

    /// Returns the current state.
    pub async fn state(&self) -> SessionState {
        self.shared.core.lock().await.state
    }

    /// Returns `true` if an authorization is pending.
    pub async fn has_pending(&self) -> bool {
        self.shared.core.lock().await.pending.is_some()
    }

    /// Returns `true` if endpoints have been configured.
    pub async fn is_configured(&self) -> bool {
        self.shared.core.lock().await.strategy.is_some()
    }

    /// Sets the endpoints and builds the grant strategy.
    ///
    /// A pending authorization is cancelled as superseded.
    ///
    /// # Errors
    ///
    /// Returns `SmartError::Configuration` if the strategy cannot be built;
    /// the previous configuration is kept in that case.
    pub async fn configure(&self, endpoints: EndpointSet) -> Result<(), SmartError> {
        let strategy = Arc::new(GrantStrategy::new(self.shared.config.clone(), &endpoints)?);

        {
            let mut core = self.shared.core.lock().await;
            core.cancel_pending(CancelReason::Superseded);
            core.strategy = Some(strategy);
        }

        self.shared
            .tokens
            .set_token_endpoint(endpoints.token_url)
            .await;
        tracing::debug!(
            "Authorization session configured for {}",
            endpoints.authorization_url
        );
        Ok(())
    }

    /// Starts an authorization and presents its URL.
    ///
    /// A pending authorization is first cancelled as superseded. Without
    /// configured endpoints, or if the presenter fails, the returned ticket
    /// is already resolved with the failure.
    pub async fn start(&self, mode: PresentationMode) -> AuthorizationTicket {
        let (completion, ticket) = CompletionSender::channel();

        let (url, generation) = {
            let mut core = self.shared.core.lock().await;
            core.cancel_pending(CancelReason::Superseded);

            let Some(strategy) = core.strategy.clone() else {
                core.state = SessionState::Failed;
                completion.complete(AuthorizationOutcome::Failed(SmartError::configuration(
                    "no authorization endpoints configured",
                )));
                return ticket;
            };

            core.next_generation += 1;
            let generation = core.next_generation;
            let request = strategy.new_request();
            let url = strategy.authorization_url(&request);

            core.pending = Some(PendingAuthorization {
                generation,
                issued_at: OffsetDateTime::now_utc(),
                request,
                exchanging: false,
                completion,
            });
            core.state = SessionState::AuthorizationStarted;
            (url, generation)
        };

        tracing::debug!(
            "Starting {} authorization {} ({:?})",
            self.shared.config.kind,
            generation,
            mode
        );

        let presented = match mode {
            PresentationMode::Embedded => self.shared.presenter.present_embedded(&url),
            PresentationMode::External => self.shared.presenter.open_externally(&url),
        };

        if let Err(e) = presented {
            tracing::warn!("Failed to present authorization URL: {}", e);
            let mut core = self.shared.core.lock().await;
            if let Some(pending) = core.pending.take_if(|p| p.generation == generation) {
                core.state = SessionState::Failed;
                pending.completion.complete(AuthorizationOutcome::Failed(e));
            }
            return ticket;
        }

        if let Some(lifetime) = self.shared.pending_lifetime {
            spawn_expiry(Arc::downgrade(&self.shared), generation, lifetime);
        }

        ticket
    }

    /// Delivers a redirect to the pending authorization.
    ///
    /// Returns `false`, without side effects, if no endpoints are configured,
    /// no authorization is pending, or its redirect is already being
    /// processed. Otherwise returns `true` once the redirect was processed;
    /// a result that arrives after the authorization was cancelled is
    /// discarded.
    pub async fn handle_redirect(&self, redirect: &Url) -> bool {
        let (strategy, request, generation) = {
            let mut core = self.shared.core.lock().await;
            let Some(strategy) = core.strategy.clone() else {
                tracing::debug!("Ignoring redirect: no endpoints configured");
                return false;
            };
            let Some(pending) = core.pending.as_mut() else {
                tracing::debug!("Ignoring redirect: no authorization pending");
                return false;
            };
            if pending.exchanging {
                tracing::debug!(
                    "Ignoring redirect: authorization {} is already exchanging",
                    pending.generation
                );
                return false;
            }
            pending.exchanging = true;
            (strategy, pending.request.clone(), pending.generation)
        };

        let result = strategy
            .handle_redirect(redirect, &request, self.shared.http.as_ref())
            .await;

        let (pending, result) = {
            let mut core = self.shared.core.lock().await;
            let Some(pending) = core.pending.take_if(|p| p.generation == generation) else {
                tracing::warn!(
                    "Discarding redirect result of authorization {}: no longer pending",
                    generation
                );
                return true;
            };

            // Installed under the session lock so a concurrent reset cannot
            // be undone by this token
            let result = match result {
                Ok(token) => {
                    let context_id = token.context_id.clone();
                    let scope = token.scope.clone();
                    self.shared.tokens.set_token(token).await;
                    core.state = SessionState::Completed;
                    Ok((context_id, scope))
                }
                Err(e) => {
                    core.state = SessionState::Failed;
                    Err(e)
                }
            };
            (pending, result)
        };

        // Taken out of the session above, so only this call can complete it
        match result {
            Ok((context_id, scope)) => {
                tracing::info!(
                    "Authorization {} completed for client {} (context: {:?})",
                    generation,
                    self.shared.config.client_id,
                    context_id
                );
                pending
                    .completion
                    .complete(AuthorizationOutcome::Authorized { context_id, scope });
            }
            Err(e) => {
                tracing::warn!(
                    "Authorization {} failed ({}): {}",
                    generation,
                    e.category(),
                    e
                );
                pending.completion.complete(AuthorizationOutcome::Failed(e));
            }
        }
        true
    }

    /// Cancels the pending authorization, if any.
    ///
    /// Idempotent. An exchange in flight is allowed to finish but its result
    /// is discarded.
    pub async fn abort(&self) {
        let mut core = self.shared.core.lock().await;
        if !core.cancel_pending(CancelReason::Aborted) {
            tracing::debug!("Abort requested with no authorization pending");
        }
    }

    /// Cancels the pending authorization and forgets the held token.
    pub async fn reset(&self) {
        let mut core = self.shared.core.lock().await;
        core.cancel_pending(CancelReason::Aborted);
        core.state = SessionState::Idle;
        self.shared.tokens.clear().await;
        tracing::debug!("Authorization session reset");
    }

    async fn expire(&self, generation: u64) {
        let mut core = self.shared.core.lock().await;
        let expirable = core
            .pending
            .as_ref()
            .is_some_and(|p| p.generation == generation && !p.exchanging);
        if expirable {
            core.cancel_pending(CancelReason::Expired);
        }
    }
}

fn spawn_expiry(shared: Weak<SessionShared>, generation: u64, lifetime: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(lifetime).await;
        if let Some(shared) = shared.upgrade() {
            AuthorizationSession { shared }.expire(generation).await;
        }
    });
}

impl std::fmt::Debug for AuthorizationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationSession")
            .field("client_id", &self.shared.config.client_id)
            .field("grant", &self.shared.config.kind)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GrantKind;
    use crate::testing::{FakeHttpClient, RecordingPresenter, SlowSavePersistence};
    use serde_json::json;
    use std::collections::HashMap;

    fn endpoints() -> EndpointSet {
        EndpointSet::new(Url::parse("https://ex.org/auth").unwrap())
            .with_token_url(Url::parse("https://ex.org/token").unwrap())
    }

    fn grant(kind: GrantKind) -> GrantConfiguration {
        GrantConfiguration::new(
            kind,
            "my_app",
            "launch/patient patient/*.read",
            Url::parse("smartapp://callback").unwrap(),
        )
    }

    fn session(
        kind: GrantKind,
        http: Arc<FakeHttpClient>,
        presenter: Arc<RecordingPresenter>,
    ) -> AuthorizationSession {
        AuthorizationSession::builder(grant(kind), http, presenter)
            .endpoints(Some(endpoints()))
            .build()
            .unwrap()
    }

    fn presented_state(presenter: &RecordingPresenter) -> String {
        let url = presenter.last().unwrap();
        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
        params["state"].clone()
    }

    fn token_body() -> serde_json::Value {
        json!({
            "access_token": "tok",
            "token_type": "Bearer",
            "expires_in": 3600,
            "patient": "123"
        })
    }

    #[test]
    fn test_redirect_without_start_is_noop() {
        let http = Arc::new(FakeHttpClient::new());
        let presenter = Arc::new(RecordingPresenter::new());
        let session = session(GrantKind::AuthorizationCode, http.clone(), presenter);

        tokio_test::block_on(async {
            let redirect = Url::parse("smartapp://callback?code=abc&state=s1").unwrap();
            assert!(!session.handle_redirect(&redirect).await);
            assert_eq!(session.state().await, SessionState::Idle);
            assert!(!session.has_pending().await);
        });
        assert_eq!(http.calls(), 0);
    }

    #[tokio::test]
    async fn test_code_flow_completes_once() {
        let http = Arc::new(FakeHttpClient::new());
        http.push_json(200, token_body());
        let presenter = Arc::new(RecordingPresenter::new());
        let session = session(GrantKind::AuthorizationCode, http.clone(), presenter.clone());

        let ticket = session.start(PresentationMode::External).await;
        assert_eq!(presenter.external().len(), 1);
        assert_eq!(session.state().await, SessionState::AuthorizationStarted);

        let redirect = Url::parse(&format!(
            "smartapp://callback?code=abc&state={}",
            presented_state(&presenter)
        ))
        .unwrap();
        assert!(session.handle_redirect(&redirect).await);

        match ticket.outcome().await {
            AuthorizationOutcome::Authorized { context_id, .. } => {
                assert_eq!(context_id.as_deref(), Some("123"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(session.state().await, SessionState::Completed);
        assert_eq!(session.tokens().context_id().await.as_deref(), Some("123"));

        // A duplicate delivery is a no-op
        assert!(!session.handle_redirect(&redirect).await);
        assert_eq!(http.calls(), 1);
        assert_eq!(session.state().await, SessionState::Completed);
    }

    #[tokio::test]
    async fn test_second_start_supersedes_first() {
        let http = Arc::new(FakeHttpClient::new());
        http.push_json(200, token_body());
        let presenter = Arc::new(RecordingPresenter::new());
        let session = session(GrantKind::AuthorizationCode, http, presenter.clone());

        let first = session.start(PresentationMode::Embedded).await;
        let first_state = presented_state(&presenter);
        let second = session.start(PresentationMode::Embedded).await;
        let second_state = presented_state(&presenter);
        assert_ne!(first_state, second_state);

        match first.outcome().await {
            AuthorizationOutcome::Cancelled(reason) => {
                assert_eq!(reason, CancelReason::Superseded);
                assert!(reason.is_timeout());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        // The first authorization's redirect no longer matches
        let stale =
            Url::parse(&format!("smartapp://callback?code=abc&state={first_state}")).unwrap();
        assert!(session.handle_redirect(&stale).await);
        let outcome = second.outcome().await;
        assert!(matches!(
            outcome,
            AuthorizationOutcome::Failed(SmartError::StateMismatch)
        ));
        assert_eq!(presenter.embedded().len(), 2);
    }

    #[tokio::test]
    async fn test_state_mismatch_fails_without_exchange() {
        let http = Arc::new(FakeHttpClient::new());
        let presenter = Arc::new(RecordingPresenter::new());
        let session = session(GrantKind::AuthorizationCode, http.clone(), presenter);

        let ticket = session.start(PresentationMode::Embedded).await;
        let redirect = Url::parse("smartapp://callback?code=abc&state=forged").unwrap();
        assert!(session.handle_redirect(&redirect).await);

        let outcome = ticket.outcome().await;
        assert!(outcome.error().is_some_and(SmartError::is_security_error));
        assert_eq!(session.state().await, SessionState::Failed);
        assert_eq!(http.calls(), 0);
    }

    #[tokio::test]
    async fn test_abort_is_idempotent() {
        let http = Arc::new(FakeHttpClient::new());
        let presenter = Arc::new(RecordingPresenter::new());
        let session = session(GrantKind::Implicit, http, presenter);

        let mut ticket = session.start(PresentationMode::Embedded).await;
        assert!(ticket.try_outcome().is_none());

        session.abort().await;
        session.abort().await;

        assert!(matches!(
            ticket.try_outcome(),
            Some(AuthorizationOutcome::Cancelled(CancelReason::Aborted))
        ));
        assert_eq!(session.state().await, SessionState::Aborted);
        assert!(!session.has_pending().await);
    }

    #[tokio::test]
    async fn test_abort_during_exchange_discards_result() {
        let (http, gate) = FakeHttpClient::gated();
        let http = Arc::new(http);
        http.push_json(200, token_body());
        let presenter = Arc::new(RecordingPresenter::new());
        let session = session(GrantKind::AuthorizationCode, http.clone(), presenter.clone());

        let ticket = session.start(PresentationMode::Embedded).await;
        let redirect = Url::parse(&format!(
            "smartapp://callback?code=abc&state={}",
            presented_state(&presenter)
        ))
        .unwrap();

        let exchanging = tokio::spawn({
            let session = session.clone();
            let redirect = redirect.clone();
            async move { session.handle_redirect(&redirect).await }
        });
        http.wait_for_calls(1).await;

        // A second delivery while the first is exchanging is ignored
        assert!(!session.handle_redirect(&redirect).await);

        session.abort().await;
        assert!(matches!(
            ticket.outcome().await,
            AuthorizationOutcome::Cancelled(CancelReason::Aborted)
        ));

        gate.notify_one();
        assert!(exchanging.await.unwrap());
        assert!(session.tokens().current().await.is_none());
        assert_eq!(session.state().await, SessionState::Aborted);
    }

    #[tokio::test]
    async fn test_reset_while_completing_forgets_token() {
        let http = Arc::new(FakeHttpClient::new());
        http.push_json(200, token_body());
        let presenter = Arc::new(RecordingPresenter::new());
        let persistence = Arc::new(SlowSavePersistence::default());
        let session = AuthorizationSession::builder(
            grant(GrantKind::AuthorizationCode),
            http.clone(),
            presenter.clone(),
        )
        .endpoints(Some(endpoints()))
        .persistence(persistence.clone())
        .build()
        .unwrap();

        let ticket = session.start(PresentationMode::Embedded).await;
        let redirect = Url::parse(&format!(
            "smartapp://callback?code=abc&state={}",
            presented_state(&presenter)
        ))
        .unwrap();

        let completing = tokio::spawn({
            let session = session.clone();
            async move { session.handle_redirect(&redirect).await }
        });
        // The token is being saved
        persistence.entered.notified().await;

        let resetting = tokio::spawn({
            let session = session.clone();
            async move { session.reset().await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        persistence.release.notify_one();

        assert!(completing.await.unwrap());
        resetting.await.unwrap();
        assert!(ticket.outcome().await.is_authorized());
        assert!(session.tokens().current().await.is_none());
        assert_eq!(session.state().await, SessionState::Idle);
        assert!(persistence.load("my_app").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_start_without_endpoints() {
        let http = Arc::new(FakeHttpClient::new());
        let presenter = Arc::new(RecordingPresenter::new());
        let session = AuthorizationSession::builder(
            grant(GrantKind::AuthorizationCode),
            http,
            presenter.clone(),
        )
        .build()
        .unwrap();

        let outcome = session.start(PresentationMode::Embedded).await.outcome().await;
        assert!(matches!(
            outcome,
            AuthorizationOutcome::Failed(SmartError::Configuration { .. })
        ));
        assert!(presenter.last().is_none());

        session.configure(endpoints()).await.unwrap();
        assert!(session.is_configured().await);
    }

    #[tokio::test]
    async fn test_presenter_failure() {
        let http = Arc::new(FakeHttpClient::new());
        let presenter = Arc::new(RecordingPresenter::failing());
        let session = session(GrantKind::Implicit, http, presenter);

        let outcome = session.start(PresentationMode::External).await.outcome().await;
        assert!(matches!(
            outcome,
            AuthorizationOutcome::Failed(SmartError::Presentation { .. })
        ));
        assert_eq!(session.state().await, SessionState::Failed);
        assert!(!session.has_pending().await);
    }

    #[tokio::test]
    async fn test_configure_supersedes_pending() {
        let http = Arc::new(FakeHttpClient::new());
        let presenter = Arc::new(RecordingPresenter::new());
        let session = session(GrantKind::AuthorizationCode, http, presenter);

        let ticket = session.start(PresentationMode::Embedded).await;
        session.configure(endpoints()).await.unwrap();

        assert!(matches!(
            ticket.outcome().await,
            AuthorizationOutcome::Cancelled(CancelReason::Superseded)
        ));
    }

    #[tokio::test]
    async fn test_pending_lifetime_expires() {
        let http = Arc::new(FakeHttpClient::new());
        let presenter = Arc::new(RecordingPresenter::new());
        let session = AuthorizationSession::builder(grant(GrantKind::Implicit), http, presenter)
            .endpoints(Some(endpoints()))
            .pending_lifetime(Some(Duration::from_millis(20)))
            .build()
            .unwrap();

        let ticket = session.start(PresentationMode::Embedded).await;
        assert!(matches!(
            ticket.outcome().await,
            AuthorizationOutcome::Cancelled(CancelReason::Expired)
        ));
        assert!(!session.has_pending().await);
    }

    #[tokio::test]
    async fn test_dropped_session_abandons_ticket() {
        let http = Arc::new(FakeHttpClient::new());
        let presenter = Arc::new(RecordingPresenter::new());
        let session = session(GrantKind::Implicit, http, presenter);

        let ticket = session.start(PresentationMode::Embedded).await;
        drop(session);

        assert!(matches!(
            ticket.outcome().await,
            AuthorizationOutcome::Cancelled(CancelReason::Abandoned)
        ));
    }

    #[tokio::test]
    async fn test_implicit_flow_and_reset() {
        let http = Arc::new(FakeHttpClient::new());
        let presenter = Arc::new(RecordingPresenter::new());
        let session = session(GrantKind::Implicit, http.clone(), presenter.clone());

        let ticket = session.start(PresentationMode::Embedded).await;
        let redirect = Url::parse(&format!(
            "smartapp://callback#access_token=tok&token_type=bearer&state={}",
            presented_state(&presenter)
        ))
        .unwrap();
        assert!(session.handle_redirect(&redirect).await);

        // No patient in the redirect is still a success
        match ticket.outcome().await {
            AuthorizationOutcome::Authorized { context_id, .. } => assert!(context_id.is_none()),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(http.calls(), 0);

        session.reset().await;
        assert_eq!(session.state().await, SessionState::Idle);
        assert!(session.tokens().current().await.is_none());
    }
}
