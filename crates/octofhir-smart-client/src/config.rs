//! Client configuration.
//!
//! [`SmartClientConfig`] is the serializable, file-level view of the client
//! settings. It is validated into a [`GrantConfiguration`] before a session
//! is created; validation is the only place an unsupported grant kind or a
//! missing required setting is reported.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::SmartError;

/// Default token response field carrying the launch context.
pub const DEFAULT_CONTEXT_FIELD: &str = "patient";

/// Client settings as stored in configuration files.
///
/// # Example (TOML)
///
/// ```toml
/// client_id = "my-smart-app"
/// scope = "launch/patient patient/*.read offline_access"
/// redirect_uri = "http://localhost:8765/callback"
/// grant = "authorization_code"
/// use_pkce = true
/// request_timeout = "30s"
/// token_expiry_leeway = "30s"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SmartClientConfig {
    /// OAuth 2.0 client identifier.
    pub client_id: String,

    /// Client secret for confidential clients.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    /// Space-separated scopes to request.
    pub scope: String,

    /// Redirect URI registered for this client.
    pub redirect_uri: String,

    /// Grant kind: "authorization_code" or "implicit".
    pub grant: String,

    /// Send a PKCE S256 challenge with the authorization-code grant.
    pub use_pkce: bool,

    /// Value of the `aud` parameter (usually the FHIR base URL).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,

    /// Token response field holding the launch context id.
    pub context_field: String,

    /// Additional authorization request parameters.
    pub extra_params: BTreeMap<String, String>,

    /// HTTP request timeout.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// A token expiring within this window is treated as expired.
    #[serde(with = "humantime_serde")]
    pub token_expiry_leeway: Duration,

    /// How long an authorization may stay pending before it expires.
    #[serde(
        with = "humantime_serde",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub pending_lifetime: Option<Duration>,
}

impl Default for SmartClientConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: None,
            scope: "launch/patient patient/*.read".to_string(),
            redirect_uri: String::new(),
            grant: GrantKind::AuthorizationCode.as_str().to_string(),
            use_pkce: false,
            audience: None,
            context_field: DEFAULT_CONTEXT_FIELD.to_string(),
            extra_params: BTreeMap::new(),
            request_timeout: Duration::from_secs(30),
            token_expiry_leeway: Duration::from_secs(30),
            pending_lifetime: None,
        }
    }
}

impl SmartClientConfig {
    /// Validates these settings into a [`GrantConfiguration`].
    ///
    /// # Errors
    ///
    /// Returns `SmartError::Configuration` if the grant kind is unsupported,
    /// the client id, scope, or redirect URI is missing, or the redirect URI
    /// is not a valid absolute URL.
    pub fn grant_configuration(&self) -> Result<GrantConfiguration, SmartError> {
        let kind: GrantKind = self.grant.parse()?;

        if self.client_id.trim().is_empty() {
            return Err(SmartError::configuration("client_id is required"));
        }
        if self.scope.trim().is_empty() {
            return Err(SmartError::configuration("scope is required"));
        }
        if self.redirect_uri.trim().is_empty() {
            return Err(SmartError::configuration("redirect_uri is required"));
        }
        let redirect_uri = Url::parse(&self.redirect_uri).map_err(|e| {
            SmartError::configuration(format!(
                "redirect_uri '{}' is not a valid URL: {}",
                self.redirect_uri, e
            ))
        })?;

        if kind == GrantKind::Implicit && self.use_pkce {
            tracing::warn!("PKCE is not used with the implicit grant; ignoring use_pkce");
        }

        let context_field = if self.context_field.trim().is_empty() {
            DEFAULT_CONTEXT_FIELD.to_string()
        } else {
            self.context_field.clone()
        };

        Ok(GrantConfiguration {
            kind,
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone().filter(|s| !s.is_empty()),
            scope: self.scope.clone(),
            redirect_uri,
            use_pkce: self.use_pkce && kind == GrantKind::AuthorizationCode,
            audience: self.audience.clone(),
            context_field,
            extra_params: self.extra_params.clone(),
        })
    }
}

/// The OAuth 2.0 grant used to authorize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantKind {
    /// Implicit grant: the token arrives in the redirect fragment.
    Implicit,
    /// Authorization-code grant: the code is exchanged at the token endpoint.
    AuthorizationCode,
}

impl GrantKind {
    /// Returns the configuration name of this grant kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Implicit => "implicit",
            Self::AuthorizationCode => "authorization_code",
        }
    }

    /// Returns the `response_type` sent with the authorization request.
    #[must_use]
    pub fn response_type(&self) -> &'static str {
        match self {
            Self::Implicit => "token",
            Self::AuthorizationCode => "code",
        }
    }
}

impl FromStr for GrantKind {
    type Err = SmartError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "implicit" | "token" => Ok(Self::Implicit),
            "authorization_code" | "code" => Ok(Self::AuthorizationCode),
            other => Err(SmartError::configuration(format!(
                "unsupported grant kind '{}' (expected 'authorization_code' or 'implicit')",
                other
            ))),
        }
    }
}

impl fmt::Display for GrantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Validated, immutable grant settings owned by an authorization session.
#[derive(Debug, Clone)]
pub struct GrantConfiguration {
    /// Grant kind.
    pub kind: GrantKind,
    /// OAuth 2.0 client identifier.
    pub client_id: String,
    /// Client secret for confidential clients.
    pub client_secret: Option<String>,
    /// Space-separated scopes.
    pub scope: String,
    /// Redirect URI.
    pub redirect_uri: Url,
    /// Whether PKCE is used (authorization-code grant only).
    pub use_pkce: bool,
    /// Optional `aud` parameter.
    pub audience: Option<String>,
    /// Token response field holding the launch context id.
    pub context_field: String,
    /// Additional authorization request parameters.
    pub extra_params: BTreeMap<String, String>,
}

impl GrantConfiguration {
    /// Creates a configuration with defaults for the optional settings.
    pub fn new(
        kind: GrantKind,
        client_id: impl Into<String>,
        scope: impl Into<String>,
        redirect_uri: Url,
    ) -> Self {
        Self {
            kind,
            client_id: client_id.into(),
            client_secret: None,
            scope: scope.into(),
            redirect_uri,
            use_pkce: false,
            audience: None,
            context_field: DEFAULT_CONTEXT_FIELD.to_string(),
            extra_params: BTreeMap::new(),
        }
    }

    /// Sets the client secret.
    #[must_use]
    pub fn with_client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    /// Enables or disables PKCE.
    #[must_use]
    pub fn with_pkce(mut self, enabled: bool) -> Self {
        self.use_pkce = enabled && self.kind == GrantKind::AuthorizationCode;
        self
    }

    /// Sets the `aud` parameter.
    #[must_use]
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    /// Sets the context field name.
    #[must_use]
    pub fn with_context_field(mut self, field: impl Into<String>) -> Self {
        self.context_field = field.into();
        self
    }

    /// Adds an extra authorization request parameter.
    #[must_use]
    pub fn with_extra_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_params.insert(key.into(), value.into());
        self
    }
}
