//! Grant strategies.
//!
//! A [`GrantStrategy`] builds the authorization URL for one grant kind and
//! turns the redirect that comes back into a [`Token`]:
//!
//! - **Authorization code**: `response_type=code`. The redirect carries
//!   `code` and `state` in its query; the code is exchanged at the token
//!   endpoint.
//! - **Implicit**: `response_type=token`. The redirect carries the token
//!   itself in its fragment; there is no token endpoint round trip.
//!
//! In both cases the redirect `state` is compared with the value issued for
//! the pending authorization before anything else is looked at.

use std::collections::HashMap;

use serde_json::Value;
use url::Url;

use crate::config::{GrantConfiguration, GrantKind};
use crate::conformance::EndpointSet;
use crate::error::SmartError;
use crate::http::HttpClient;
use crate::pkce::{CHALLENGE_METHOD, PkceVerifier, generate_state};
use crate::token::{Token, TokenResponse, post_token_request};

/// Per-authorization values issued when an authorization starts and checked
/// when its redirect arrives.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    /// CSRF correlation value sent as `state`.
    pub state: String,
    /// PKCE verifier, when PKCE is enabled.
    pub pkce_verifier: Option<PkceVerifier>,
}

impl AuthorizationRequest {
    /// Creates a request with a fresh `state` and, if requested, a PKCE verifier.
    #[must_use]
    pub fn generate(use_pkce: bool) -> Self {
        Self {
            state: generate_state(),
            pkce_verifier: use_pkce.then(PkceVerifier::generate),
        }
    }
}

/// Implicit grant.
#[derive(Debug, Clone)]
pub struct ImplicitGrant {
    config: GrantConfiguration,
    authorize_url: Url,
}

/// Authorization-code grant.
#[derive(Debug, Clone)]
pub struct AuthorizationCodeGrant {
    config: GrantConfiguration,
    authorize_url: Url,
    token_url: Url,
}

/// A grant strategy, selected by [`GrantKind`].
#[derive(Debug, Clone)]
pub enum GrantStrategy {
    /// Token delivered in the redirect fragment.
    Implicit(ImplicitGrant),
    /// Code delivered in the redirect query and exchanged for a token.
    AuthorizationCode(AuthorizationCodeGrant),
}

impl GrantStrategy {
    /// Creates the strategy for the configured grant kind.
    ///
    /// # Errors
    ///
    /// Returns `SmartError::Configuration` if the authorization-code grant
    /// is configured and the endpoints have no token URL.
    pub fn new(config: GrantConfiguration, endpoints: &EndpointSet) -> Result<Self, SmartError> {
        let authorize_url = endpoints.authorization_url.clone();

        match config.kind {
            GrantKind::Implicit => Ok(Self::Implicit(ImplicitGrant {
                config,
                authorize_url,
            })),
            GrantKind::AuthorizationCode => {
                let token_url = endpoints.token_url.clone().ok_or_else(|| {
                    SmartError::configuration(
                        "the authorization_code grant requires a token endpoint",
                    )
                })?;
                Ok(Self::AuthorizationCode(AuthorizationCodeGrant {
                    config,
                    authorize_url,
                    token_url,
                }))
            }
        }
    }

    /// Returns the grant kind.
    #[must_use]
    pub fn kind(&self) -> GrantKind {
        self.config().kind
    }

    /// Returns the grant configuration.
    #[must_use]
    pub fn config(&self) -> &GrantConfiguration {
        match self {
            Self::Implicit(grant) => &grant.config,
            Self::AuthorizationCode(grant) => &grant.config,
        }
    }

    /// Returns the token endpoint, if this grant uses one.
    #[must_use]
    pub fn token_url(&self) -> Option<&Url> {
        match self {
            Self::Implicit(_) => None,
            Self::AuthorizationCode(grant) => Some(&grant.token_url),
        }
    }

    /// Issues the per-authorization values for a new authorization.
    #[must_use]
    pub fn new_request(&self) -> AuthorizationRequest {
        AuthorizationRequest::generate(self.config().use_pkce)
    }

    /// Builds the authorization URL for a request.
    #[must_use]
    pub fn authorization_url(&self, request: &AuthorizationRequest) -> Url {
        match self {
            Self::Implicit(grant) => {
                build_authorization_url(&grant.authorize_url, &grant.config, request, false)
            }
            Self::AuthorizationCode(grant) => build_authorization_url(
                &grant.authorize_url,
                &grant.config,
                request,
                grant.config.use_pkce,
            ),
        }
    }

    /// Turns a redirect into a token.
    ///
    /// # Errors
    ///
    /// - `StateMismatch` if the redirect `state` is absent or differs
    /// - `AuthorizationDenied` if the redirect carries an `error`
    /// - `MissingField` if the code (or implicit access token) is absent
    /// - token endpoint errors from the code exchange
    pub async fn handle_redirect(
        &self,
        redirect: &Url,
        request: &AuthorizationRequest,
        http: &dyn HttpClient,
    ) -> Result<Token, SmartError> {
        match self {
            Self::Implicit(grant) => grant.handle_redirect(redirect, request),
            Self::AuthorizationCode(grant) => grant.handle_redirect(redirect, request, http).await,
        }
    }
}

impl ImplicitGrant {
    fn handle_redirect(
        &self,
        redirect: &Url,
        request: &AuthorizationRequest,
    ) -> Result<Token, SmartError> {
        let mut params = fragment_params(redirect);
        check_redirect(&params, request)?;

        let access_token = params
            .remove("access_token")
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SmartError::missing_field("access_token"))?;
        let expires_in = params
            .remove("expires_in")
            .map(|v| {
                v.parse::<u64>()
                    .map_err(|_| SmartError::parse(format!("Invalid expires_in '{v}'")))
            })
            .transpose()?;

        let response = TokenResponse {
            access_token,
            token_type: params
                .remove("token_type")
                .unwrap_or_else(|| "Bearer".to_string()),
            expires_in,
            refresh_token: params.remove("refresh_token"),
            scope: params.remove("scope"),
            extra: params
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect(),
        };

        let token = Token::from_response(response, &self.config.context_field)?;
        tracing::debug!(
            "Implicit grant redirect accepted (context: {:?})",
            token.context_id
        );
        Ok(token)
    }
}

impl AuthorizationCodeGrant {
    async fn handle_redirect(
        &self,
        redirect: &Url,
        request: &AuthorizationRequest,
        http: &dyn HttpClient,
    ) -> Result<Token, SmartError> {
        let params: HashMap<String, String> = redirect.query_pairs().into_owned().collect();
        check_redirect(&params, request)?;

        let code = params
            .get("code")
            .filter(|c| !c.is_empty())
            .ok_or_else(|| SmartError::missing_field("code"))?;

        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("client_id", self.config.client_id.as_str()),
        ];
        if let Some(secret) = &self.config.client_secret {
            form.push(("client_secret", secret.as_str()));
        }
        if let Some(verifier) = &request.pkce_verifier {
            form.push(("code_verifier", verifier.as_str()));
        }

        tracing::debug!("Exchanging authorization code at {}", self.token_url);
        let response = post_token_request(http, &self.token_url, &form).await?;

        Token::from_response(response, &self.config.context_field)
    }
}

fn build_authorization_url(
    authorize_url: &Url,
    config: &GrantConfiguration,
    request: &AuthorizationRequest,
    with_pkce: bool,
) -> Url {
    let mut url = authorize_url.clone();
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("response_type", config.kind.response_type())
            .append_pair("client_id", &config.client_id)
            .append_pair("redirect_uri", config.redirect_uri.as_str())
            .append_pair("scope", &config.scope)
            .append_pair("state", &request.state);

        if with_pkce && let Some(verifier) = &request.pkce_verifier {
            query
                .append_pair("code_challenge", verifier.challenge().as_str())
                .append_pair("code_challenge_method", CHALLENGE_METHOD);
        }

        if let Some(aud) = &config.audience {
            query.append_pair("aud", aud);
        }

        for (key, value) in &config.extra_params {
            query.append_pair(key, value);
        }
    }
    url
}

fn fragment_params(redirect: &Url) -> HashMap<String, String> {
    redirect
        .fragment()
        .map(|f| {
            url::form_urlencoded::parse(f.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default()
}

/// Verifies `state`, then reports a server-side error if there is one.
fn check_redirect(
    params: &HashMap<String, String>,
    request: &AuthorizationRequest,
) -> Result<(), SmartError> {
    if params.get("state").map(String::as_str) != Some(request.state.as_str()) {
        tracing::warn!("Redirect state does not match the pending authorization");
        return Err(SmartError::StateMismatch);
    }

    if let Some(error) = params.get("error") {
        let description = params
            .get("error_description")
            .cloned()
            .unwrap_or_default();
        return Err(SmartError::authorization_denied(error.clone(), description));
    }

    Ok(())
}
