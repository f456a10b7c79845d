//! # octofhir-smart-client
//!
//! SMART on FHIR client for OctoFHIR tooling.
//!
//! This crate provides:
//! - Discovery of OAuth 2.0 endpoints from a server's conformance statement
//! - Implicit and authorization-code grants, with optional PKCE
//! - An authorization session whose outcome is delivered exactly once
//! - A token store that signs requests and refreshes expired tokens
//! - A small FHIR client for signed read and search interactions
//!
//! ## Overview
//!
//! ```ignore
//! let server = FhirServer::connect(base_url, Duration::from_secs(30))?;
//! let session = server
//!     .authorization_session(&config, presenter, None)
//!     .await?;
//!
//! let ticket = session.start(PresentationMode::External).await;
//! // ... the host delivers the redirect:
//! session.handle_redirect(&redirect_url).await;
//!
//! if let AuthorizationOutcome::Authorized { context_id, .. } = ticket.outcome().await {
//!     let client = server.client(Some(&session));
//!     let patient = client.read("Patient", context_id.as_deref().unwrap_or("example")).await?;
//! }
//! ```
//!
//! UI presentation and token persistence are host collaborators; see
//! [`AuthorizationPresenter`] and [`TokenPersistence`].
//!
//! ## Modules
//!
//! - [`config`] - Client settings and grant configuration
//! - [`conformance`] - Conformance statement resolution
//! - [`grant`] - Implicit and authorization-code grant strategies
//! - [`session`] - Authorization session state machine
//! - [`token`] - Token store, signer, and persistence
//! - [`server`] - FHIR server facade with cached metadata
//! - [`client`] - Signed FHIR REST client
//! - [`http`] - HTTP transport abstraction

pub mod client;
pub mod config;
pub mod conformance;
pub mod error;
pub mod grant;
pub mod http;
pub mod pkce;
pub mod server;
pub mod session;
pub mod token;

#[cfg(test)]
mod testing;

pub use client::FhirClient;
pub use config::{DEFAULT_CONTEXT_FIELD, GrantConfiguration, GrantKind, SmartClientConfig};
pub use conformance::{ConformanceResolver, EndpointSet, OAUTH_URIS_EXTENSION, ServerMetadata};
pub use error::{ErrorCategory, SmartError};
pub use grant::{AuthorizationRequest, GrantStrategy};
pub use http::{HttpClient, HttpRequest, HttpResponse, ReqwestHttpClient};
pub use server::FhirServer;
pub use session::{
    AuthorizationOutcome, AuthorizationPresenter, AuthorizationSession,
    AuthorizationSessionBuilder, AuthorizationTicket, CancelReason, PresentationMode,
    SessionState,
};
pub use token::{InMemoryTokenPersistence, Token, TokenPersistence, TokenStore};

/// Type alias for client results.
pub type SmartResult<T> = Result<T, SmartError>;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use octofhir_smart_client::prelude::*;
/// ```
pub mod prelude {
    pub use crate::SmartResult;
    pub use crate::client::FhirClient;
    pub use crate::config::{GrantConfiguration, GrantKind, SmartClientConfig};
    pub use crate::conformance::{EndpointSet, ServerMetadata};
    pub use crate::error::{ErrorCategory, SmartError};
    pub use crate::http::{HttpClient, ReqwestHttpClient};
    pub use crate::server::FhirServer;
    pub use crate::session::{
        AuthorizationOutcome, AuthorizationPresenter, AuthorizationSession, CancelReason,
        PresentationMode, SessionState,
    };
    pub use crate::token::{InMemoryTokenPersistence, Token, TokenPersistence, TokenStore};
}
