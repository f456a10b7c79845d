//! Error types for the SMART on FHIR client.
//!
//! Every fallible operation in this crate returns a [`SmartError`]. Errors are
//! delivered either as a returned `Result` or through the single completion of
//! an authorization; they never cross the presenter boundary as panics.
//!
//! Cancellation (an aborted or superseded authorization) is not
//! an error; see [`crate::session::AuthorizationOutcome`].

use std::fmt;

/// Errors that can occur while resolving, authorizing, or signing requests.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SmartError {
    /// The client configuration is invalid or incomplete.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// A transport-level failure occurred (DNS, connect, TLS, timeout).
    #[error("Network error: {message}")]
    Network {
        /// Description of the transport failure.
        message: String,
    },

    /// The response was not delivered over HTTP(S).
    #[error("Not an HTTP response")]
    NotHttp,

    /// The server answered with a non-success status code.
    #[error("HTTP error {status}: {message}")]
    Http {
        /// The HTTP status code.
        status: u16,
        /// Body excerpt or OperationOutcome diagnostics.
        message: String,
    },

    /// A response body could not be parsed.
    #[error("Parse error: {message}")]
    Parse {
        /// Description of the parse failure.
        message: String,
    },

    /// A required field is missing from a document, redirect, or response.
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// The `state` returned with the redirect does not match the pending authorization.
    #[error("State mismatch: redirect state does not match the pending authorization")]
    StateMismatch,

    /// The authorization server returned an error on the redirect.
    #[error("Authorization denied: {error} - {description}")]
    AuthorizationDenied {
        /// The OAuth 2.0 error code.
        error: String,
        /// Optional human-readable description.
        description: String,
    },

    /// The token endpoint rejected the request with an OAuth 2.0 error.
    #[error("Token endpoint error: {error} - {description}")]
    TokenEndpoint {
        /// The OAuth 2.0 error code.
        error: String,
        /// Optional human-readable description.
        description: String,
    },

    /// No access token is held.
    #[error("No access token available")]
    NoToken,

    /// The access token has expired and there is no refresh token.
    #[error("Access token has expired and cannot be refreshed")]
    ExpiredToken,

    /// The host could not present the authorization URL.
    #[error("Presentation error: {message}")]
    Presentation {
        /// Description of the presentation failure.
        message: String,
    },

    /// The token persistence collaborator failed.
    #[error("Persistence error: {message}")]
    Persistence {
        /// Description of the persistence failure.
        message: String,
    },

    /// A URL could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl SmartError {
    /// Creates a new `Configuration` error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new `Network` error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Creates a new `Http` error.
    #[must_use]
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    /// Creates a new `Parse` error.
    #[must_use]
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    /// Creates a new `MissingField` error.
    #[must_use]
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField(field.into())
    }

    /// Creates a new `AuthorizationDenied` error.
    #[must_use]
    pub fn authorization_denied(error: impl Into<String>, description: impl Into<String>) -> Self {
        Self::AuthorizationDenied {
            error: error.into(),
            description: description.into(),
        }
    }

    /// Creates a new `TokenEndpoint` error.
    #[must_use]
    pub fn token_endpoint(error: impl Into<String>, description: impl Into<String>) -> Self {
        Self::TokenEndpoint {
            error: error.into(),
            description: description.into(),
        }
    }

    /// Creates a new `Presentation` error.
    #[must_use]
    pub fn presentation(message: impl Into<String>) -> Self {
        Self::Presentation {
            message: message.into(),
        }
    }

    /// Creates a new `Persistence` error.
    #[must_use]
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    /// Returns `true` if the failure happened on the wire.
    #[must_use]
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::NotHttp | Self::Http { .. }
        )
    }

    /// Returns `true` if this error indicates a possible forged or replayed redirect.
    #[must_use]
    pub fn is_security_error(&self) -> bool {
        matches!(self, Self::StateMismatch)
    }

    /// Returns `true` if this is a token-related error.
    ///
    /// Callers typically answer these by starting a new authorization.
    #[must_use]
    pub fn is_token_error(&self) -> bool {
        matches!(self, Self::NoToken | Self::ExpiredToken)
    }

    /// Returns the OAuth 2.0 error code reported by the server, if any.
    #[must_use]
    pub fn oauth_error_code(&self) -> Option<&str> {
        match self {
            Self::AuthorizationDenied { error, .. } | Self::TokenEndpoint { error, .. } => {
                Some(error.as_str())
            }
            _ => None,
        }
    }

    /// Returns the error category for logging purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration { .. } | Self::InvalidUrl(_) => ErrorCategory::Configuration,
            Self::Network { .. } | Self::NotHttp | Self::Http { .. } => ErrorCategory::Transport,
            Self::Parse { .. } | Self::MissingField(_) => ErrorCategory::Protocol,
            Self::StateMismatch => ErrorCategory::Security,
            Self::AuthorizationDenied { .. } | Self::TokenEndpoint { .. } => {
                ErrorCategory::Authorization
            }
            Self::NoToken | Self::ExpiredToken => ErrorCategory::Token,
            Self::Presentation { .. } | Self::Persistence { .. } => ErrorCategory::Host,
        }
    }
}

/// Categories of client errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Invalid or incomplete setup; fatal, not retried.
    Configuration,
    /// Network, non-HTTP, or HTTP status failures.
    Transport,
    /// Malformed or incomplete documents and responses.
    Protocol,
    /// Anti-CSRF failures.
    Security,
    /// The authorization server refused the request.
    Authorization,
    /// Missing or expired credentials.
    Token,
    /// Failures of host-supplied collaborators.
    Host,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Transport => write!(f, "transport"),
            Self::Protocol => write!(f, "protocol"),
            Self::Security => write!(f, "security"),
            Self::Authorization => write!(f, "authorization"),
            Self::Token => write!(f, "token"),
            Self::Host => write!(f, "host"),
        }
    }
}
