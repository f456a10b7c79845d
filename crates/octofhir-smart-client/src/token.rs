//! Token store and request signer.
//!
//! [`TokenStore`] exclusively owns the current [`Token`]. Grant strategies
//! produce tokens and hand them over; nothing else retains them.
//!
//! Every mutation bumps a generation counter. A refresh snapshots the
//! generation, performs the round trip without holding the slot lock, and
//! only installs its result if the generation is unchanged, so a token set
//! or cleared during the refresh is never overwritten by a stale one.
//!
//! Refreshes are single-flight: concurrent callers queue behind one round
//! trip and reuse its token. Mutations and their persistence writes are
//! serialized, so storage always ends with the last token held in memory.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use url::Url;

use crate::config::DEFAULT_CONTEXT_FIELD;
use crate::error::SmartError;
use crate::http::{HttpClient, HttpRequest};

/// An OAuth 2.0 access token with its metadata.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// The access token.
    pub access_token: String,

    /// Token type as reported by the server (usually "Bearer").
    pub token_type: String,

    /// When the access token expires, if the server said.
    #[serde(
        with = "time::serde::rfc3339::option",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_at: Option<OffsetDateTime>,

    /// Refresh token, if one was issued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Granted scopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// Launch context identifier (e.g. the patient id), uninterpreted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
}

impl Token {
    /// Creates a bearer token with no expiry or refresh token.
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: "Bearer".to_string(),
            expires_at: None,
            refresh_token: None,
            scope: None,
            context_id: None,
        }
    }

    /// Sets the expiry time.
    #[must_use]
    pub fn with_expires_at(mut self, expires_at: OffsetDateTime) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Sets the refresh token.
    #[must_use]
    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    /// Sets the context identifier.
    #[must_use]
    pub fn with_context_id(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    /// Returns `true` if the token expires within `leeway` from now.
    #[must_use]
    pub fn is_expired(&self, leeway: Duration) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc(), leeway)
    }

    /// Returns `true` if the token expires within `leeway` of `now`.
    ///
    /// A token without an expiry never expires.
    #[must_use]
    pub fn is_expired_at(&self, now: OffsetDateTime, leeway: Duration) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now + leeway)
    }

    /// Returns `true` if the token can be refreshed.
    #[must_use]
    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some()
    }

    /// Returns the `Authorization` header value for this token.
    #[must_use]
    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.access_token)
    }

    /// Builds a token from a token endpoint (or implicit redirect) response.
    ///
    /// The context identifier is read from `context_field`; strings are used
    /// as-is and numbers are rendered to strings. Its absence is not an error.
    ///
    /// # Errors
    ///
    /// Returns `SmartError::Parse` if `expires_in` puts the expiry outside
    /// the representable date range.
    pub fn from_response(
        response: TokenResponse,
        context_field: &str,
    ) -> Result<Self, SmartError> {
        let context_id = response.extra.get(context_field).and_then(context_value);
        let expires_at = response
            .expires_in
            .map(|secs| expiry_after(OffsetDateTime::now_utc(), secs))
            .transpose()?;

        Ok(Self {
            access_token: response.access_token,
            token_type: response.token_type,
            expires_at,
            refresh_token: response.refresh_token,
            scope: response.scope,
            context_id,
        })
    }
}

fn expiry_after(now: OffsetDateTime, expires_in: u64) -> Result<OffsetDateTime, SmartError> {
    i64::try_from(expires_in)
        .ok()
        .and_then(|secs| now.checked_add(time::Duration::seconds(secs)))
        .ok_or_else(|| SmartError::parse(format!("expires_in {expires_in} is out of range")))
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("scope", &self.scope)
            .field("context_id", &self.context_id)
            .finish()
    }
}

fn context_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Token endpoint response.
///
/// ```json
/// {
///   "access_token": "eyJ...",
///   "token_type": "Bearer",
///   "expires_in": 3600,
///   "refresh_token": "tGzv...",
///   "scope": "launch/patient patient/*.read",
///   "patient": "123"
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    /// The access token.
    pub access_token: String,

    /// The token type.
    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// Lifetime in seconds.
    #[serde(default)]
    pub expires_in: Option<u64>,

    /// Refresh token.
    #[serde(default)]
    pub refresh_token: Option<String>,

    /// Granted scopes.
    #[serde(default)]
    pub scope: Option<String>,

    /// Remaining fields, including launch context.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// OAuth 2.0 error response body.
#[derive(Debug, Deserialize)]
struct OAuthErrorResponse {
    error: String,
    error_description: Option<String>,
}

/// POSTs a form to a token endpoint and parses the JSON token response.
///
/// # Errors
///
/// - `TokenEndpoint` for an OAuth 2.0 error body
/// - `Http` for other non-success responses
/// - `Parse` if the success body is not a token response
pub(crate) async fn post_token_request(
    http: &dyn HttpClient,
    token_url: &Url,
    params: &[(&str, &str)],
) -> Result<TokenResponse, SmartError> {
    let request = HttpRequest::post_form(token_url.clone(), params.iter().copied())
        .with_header("Accept", "application/json");

    let response = http.execute(request).await?;

    if !response.is_success() {
        if let Ok(error) = response.json::<OAuthErrorResponse>() {
            tracing::warn!(
                "Token endpoint {} returned error: {}",
                token_url,
                error.error
            );
            return Err(SmartError::token_endpoint(
                error.error,
                error.error_description.unwrap_or_default(),
            ));
        }
        return Err(SmartError::http(response.status, response.text()));
    }

    response
        .json::<TokenResponse>()
        .map_err(|e| SmartError::parse(format!("Invalid token response: {e}")))
}

// =============================================================================
// Persistence
// =============================================================================

/// Storage for tokens, keyed by client id.
#[async_trait]
pub trait TokenPersistence: Send + Sync {
    /// Loads the token saved for a client.
    async fn load(&self, client_id: &str) -> Result<Option<Token>, SmartError>;

    /// Saves the token for a client, replacing any previous one.
    async fn save(&self, client_id: &str, token: &Token) -> Result<(), SmartError>;

    /// Removes the token saved for a client.
    async fn remove(&self, client_id: &str) -> Result<(), SmartError>;
}

/// In-memory [`TokenPersistence`]. Tokens do not survive the process.
#[derive(Debug, Default)]
pub struct InMemoryTokenPersistence {
    tokens: RwLock<HashMap<String, Token>>,
}

impl InMemoryTokenPersistence {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenPersistence for InMemoryTokenPersistence {
    async fn load(&self, client_id: &str) -> Result<Option<Token>, SmartError> {
        Ok(self.tokens.read().await.get(client_id).cloned())
    }

    async fn save(&self, client_id: &str, token: &Token) -> Result<(), SmartError> {
        self.tokens
            .write()
            .await
            .insert(client_id.to_string(), token.clone());
        Ok(())
    }

    async fn remove(&self, client_id: &str) -> Result<(), SmartError> {
        self.tokens.write().await.remove(client_id);
        Ok(())
    }
}

// =============================================================================
// Token Store
// =============================================================================

/// Holds the current token, refreshes it, and signs requests with it.
///
/// Cloning is cheap; clones share the same token.
#[derive(Clone)]
pub struct TokenStore {
    inner: Arc<TokenStoreInner>,
}

struct TokenStoreInner {
    client_id: String,
    client_secret: Option<String>,
    context_field: String,
    leeway: Duration,
    http: Arc<dyn HttpClient>,
    persistence: Arc<dyn TokenPersistence>,
    // Lock order: refresh, then writes, then slot.
    refresh: Mutex<()>,
    writes: Mutex<()>,
    slot: Mutex<TokenSlot>,
}

#[derive(Default)]
struct TokenSlot {
    token: Option<Token>,
    generation: u64,
    token_url: Option<Url>,
    loaded: bool,
}

/// Builder for [`TokenStore`].
pub struct TokenStoreBuilder {
    client_id: String,
    client_secret: Option<String>,
    context_field: String,
    leeway: Duration,
    token_url: Option<Url>,
    http: Arc<dyn HttpClient>,
    persistence: Option<Arc<dyn TokenPersistence>>,
}

impl TokenStoreBuilder {
    /// Sets the client secret sent with refresh requests.
    #[must_use]
    pub fn client_secret(mut self, secret: Option<String>) -> Self {
        self.client_secret = secret;
        self
    }

    /// Sets the token response field holding the context identifier.
    #[must_use]
    pub fn context_field(mut self, field: impl Into<String>) -> Self {
        self.context_field = field.into();
        self
    }

    /// Sets the expiry leeway.
    #[must_use]
    pub fn leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway;
        self
    }

    /// Sets the token endpoint used for refresh.
    #[must_use]
    pub fn token_url(mut self, url: Option<Url>) -> Self {
        self.token_url = url;
        self
    }

    /// Sets the persistence collaborator.
    #[must_use]
    pub fn persistence(mut self, persistence: Arc<dyn TokenPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Builds the store.
    #[must_use]
    pub fn build(self) -> TokenStore {
        let persistence = self
            .persistence
            .unwrap_or_else(|| Arc::new(InMemoryTokenPersistence::new()));

        TokenStore {
            inner: Arc::new(TokenStoreInner {
                client_id: self.client_id,
                client_secret: self.client_secret,
                context_field: self.context_field,
                leeway: self.leeway,
                http: self.http,
                persistence,
                refresh: Mutex::new(()),
                writes: Mutex::new(()),
                slot: Mutex::new(TokenSlot {
                    token_url: self.token_url,
                    ..TokenSlot::default()
                }),
            }),
        }
    }
}

impl TokenStore {
    /// Starts building a store for the given client.
    pub fn builder(client_id: impl Into<String>, http: Arc<dyn HttpClient>) -> TokenStoreBuilder {
        TokenStoreBuilder {
            client_id: client_id.into(),
            client_secret: None,
            context_field: DEFAULT_CONTEXT_FIELD.to_string(),
            leeway: Duration::from_secs(30),
            token_url: None,
            http,
            persistence: None,
        }
    }

    /// Returns the client id tokens are stored under.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Sets the token endpoint used for refresh.
    pub async fn set_token_endpoint(&self, url: Option<Url>) {
        self.inner.slot.lock().await.token_url = url;
    }

    /// Replaces the held token.
    pub async fn set_token(&self, token: Token) {
        let _writes = self.inner.writes.lock().await;
        {
            let mut slot = self.inner.slot.lock().await;
            slot.loaded = true;
            slot.token = Some(token.clone());
            slot.generation += 1;
        }
        self.persist(&token).await;
    }

    /// Returns a copy of the held token.
    pub async fn current(&self) -> Option<Token> {
        let mut slot = self.inner.slot.lock().await;
        self.ensure_loaded(&mut slot).await;
        slot.token.clone()
    }

    /// Returns the context identifier of the held token.
    pub async fn context_id(&self) -> Option<String> {
        self.current().await.and_then(|t| t.context_id)
    }

    /// Drops the held token and removes it from persistence.
    pub async fn clear(&self) {
        let _writes = self.inner.writes.lock().await;
        {
            let mut slot = self.inner.slot.lock().await;
            slot.loaded = true;
            slot.token = None;
            slot.generation += 1;
        }
        if let Err(e) = self.inner.persistence.remove(&self.inner.client_id).await {
            tracing::warn!(
                "Failed to remove persisted token for client {}: {}",
                self.inner.client_id,
                e
            );
        }
    }

    /// Signs a request with the held token, refreshing it first if expired.
    ///
    /// # Errors
    ///
    /// - `NoToken` if no token is held
    /// - `ExpiredToken` if the token expired and cannot be refreshed
    /// - any error of [`refresh`](Self::refresh)
    pub async fn sign(&self, mut request: HttpRequest) -> Result<HttpRequest, SmartError> {
        let (token, generation) = {
            let mut slot = self.inner.slot.lock().await;
            self.ensure_loaded(&mut slot).await;
            let token = slot.token.clone().ok_or(SmartError::NoToken)?;
            (token, slot.generation)
        };

        let token = if token.is_expired(self.inner.leeway) {
            if !token.can_refresh() {
                return Err(SmartError::ExpiredToken);
            }
            tracing::debug!("Access token expired; refreshing before signing");
            self.refresh_since(Some(generation)).await?
        } else {
            token
        };

        request.set_header("Authorization", token.authorization_header());
        Ok(request)
    }

    /// Exchanges the refresh token for a new access token.
    ///
    /// Omitted `refresh_token` and context values are carried over from the
    /// previous token. If the held token changed while the request was in
    /// flight, the refreshed token is discarded and the newer one returned.
    ///
    /// # Errors
    ///
    /// - `NoToken` if no token is held
    /// - `ExpiredToken` if the held token has no refresh token
    /// - `Configuration` if no token endpoint is known
    /// - `TokenEndpoint`, `Http`, `Network` or `Parse` from the round trip
    pub async fn refresh(&self) -> Result<Token, SmartError> {
        self.refresh_since(None).await
    }

    /// Refreshes unless the token was replaced after `observed` by a token
    /// that is still valid, in which case that token is returned.
    async fn refresh_since(&self, observed: Option<u64>) -> Result<Token, SmartError> {
        let _refresh = self.inner.refresh.lock().await;

        let (base_generation, previous, token_url) = {
            let mut slot = self.inner.slot.lock().await;
            self.ensure_loaded(&mut slot).await;
            let token = slot.token.clone().ok_or(SmartError::NoToken)?;
            if observed.is_some_and(|g| g != slot.generation)
                && !token.is_expired(self.inner.leeway)
            {
                tracing::debug!("Token was refreshed concurrently; reusing it");
                return Ok(token);
            }
            (slot.generation, token, slot.token_url.clone())
        };

        let refresh_token = previous
            .refresh_token
            .clone()
            .ok_or(SmartError::ExpiredToken)?;
        let token_url = token_url
            .ok_or_else(|| SmartError::configuration("No token endpoint configured for refresh"))?;

        let mut params = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", self.inner.client_id.as_str()),
        ];
        if let Some(secret) = &self.inner.client_secret {
            params.push(("client_secret", secret.as_str()));
        }

        let refreshed = post_token_request(self.inner.http.as_ref(), &token_url, &params)
            .await
            .and_then(|response| Token::from_response(response, &self.inner.context_field));
        let mut refreshed = match refreshed {
            Ok(token) => token,
            Err(e) => {
                let slot = self.inner.slot.lock().await;
                if slot.generation != base_generation
                    && let Some(newer) = slot.token.clone()
                {
                    tracing::debug!("Refresh failed but a newer token arrived meanwhile: {}", e);
                    return Ok(newer);
                }
                return Err(e);
            }
        };
        if refreshed.refresh_token.is_none() {
            refreshed.refresh_token = previous.refresh_token;
        }
        if refreshed.context_id.is_none() {
            refreshed.context_id = previous.context_id;
        }
        if refreshed.scope.is_none() {
            refreshed.scope = previous.scope;
        }

        let _writes = self.inner.writes.lock().await;
        {
            let mut slot = self.inner.slot.lock().await;
            if slot.generation != base_generation {
                tracing::warn!("Discarding refreshed token; the held token changed during refresh");
                return slot.token.clone().ok_or(SmartError::NoToken);
            }
            slot.token = Some(refreshed.clone());
            slot.generation += 1;
        }

        tracing::debug!("Refreshed access token for client {}", self.inner.client_id);
        self.persist(&refreshed).await;
        Ok(refreshed)
    }

    async fn ensure_loaded(&self, slot: &mut TokenSlot) {
        if slot.loaded {
            return;
        }
        slot.loaded = true;

        match self.inner.persistence.load(&self.inner.client_id).await {
            Ok(Some(token)) => {
                tracing::debug!("Loaded persisted token for client {}", self.inner.client_id);
                slot.token = Some(token);
                slot.generation += 1;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(
                "Failed to load persisted token for client {}: {}",
                self.inner.client_id,
                e
            ),
        }
    }

    async fn persist(&self, token: &Token) {
        if let Err(e) = self.inner.persistence.save(&self.inner.client_id, token).await {
            tracing::warn!(
                "Failed to persist token for client {}: {}",
                self.inner.client_id,
                e
            );
        }
    }
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("client_id", &self.inner.client_id)
            .field("leeway", &self.inner.leeway)
            .finish_non_exhaustive()
    }
}
