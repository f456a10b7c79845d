//! FHIR server facade.
//!
//! [`FhirServer`] ties a base URL to its conformance statement. The
//! statement is fetched once and cached; authorization sessions and FHIR
//! clients for the server are created from here.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use url::Url;

use crate::client::FhirClient;
use crate::config::SmartClientConfig;
use crate::conformance::{ConformanceResolver, EndpointSet, ServerMetadata};
use crate::error::SmartError;
use crate::http::{HttpClient, ReqwestHttpClient};
use crate::session::{AuthorizationPresenter, AuthorizationSession};
use crate::token::TokenPersistence;

/// A SMART on FHIR server.
pub struct FhirServer {
    base_url: Url,
    http: Arc<dyn HttpClient>,
    resolver: ConformanceResolver,
    metadata: RwLock<Option<Arc<ServerMetadata>>>,
}

impl FhirServer {
    /// Creates a server that talks through the given HTTP client.
    #[must_use]
    pub fn new(base_url: Url, http: Arc<dyn HttpClient>) -> Self {
        Self {
            base_url,
            resolver: ConformanceResolver::new(http.clone()),
            http,
            metadata: RwLock::new(None),
        }
    }

    /// Creates a server backed by a [`ReqwestHttpClient`].
    ///
    /// # Errors
    ///
    /// Returns `SmartError::Configuration` if the HTTP client cannot be built.
    pub fn connect(base_url: Url, timeout: Duration) -> Result<Self, SmartError> {
        let http = ReqwestHttpClient::new(timeout)?;
        Ok(Self::new(base_url, Arc::new(http)))
    }

    /// Returns the base URL.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Returns the HTTP client.
    #[must_use]
    pub fn http(&self) -> Arc<dyn HttpClient> {
        self.http.clone()
    }

    /// Returns the conformance statement, fetching it on first use.
    ///
    /// # Errors
    ///
    /// Any error of [`ConformanceResolver::resolve`]. Failures are not cached.
    pub async fn metadata(&self) -> Result<Arc<ServerMetadata>, SmartError> {
        {
            let cached = self.metadata.read().await;
            if let Some(metadata) = cached.as_ref() {
                tracing::trace!("Using cached conformance statement for {}", self.base_url);
                return Ok(metadata.clone());
            }
        }

        self.refresh_metadata().await
    }

    /// Fetches the conformance statement again and replaces the cached one.
    ///
    /// # Errors
    ///
    /// Any error of [`ConformanceResolver::resolve`]; the cached statement is
    /// kept in that case.
    pub async fn refresh_metadata(&self) -> Result<Arc<ServerMetadata>, SmartError> {
        tracing::debug!("Fetching conformance statement from {}", self.base_url);
        let metadata = Arc::new(self.resolver.resolve(&self.base_url).await?);

        {
            let mut cached = self.metadata.write().await;
            *cached = Some(metadata.clone());
        }

        Ok(metadata)
    }

    /// Returns the OAuth endpoints, or `None` for an open server.
    pub async fn endpoints(&self) -> Result<Option<EndpointSet>, SmartError> {
        Ok(self.metadata().await?.endpoints.clone())
    }

    /// Returns the authorize endpoint.
    pub async fn authorize_url(&self) -> Result<Option<Url>, SmartError> {
        Ok(self.endpoints().await?.map(|e| e.authorization_url))
    }

    /// Returns the token endpoint.
    pub async fn token_url(&self) -> Result<Option<Url>, SmartError> {
        Ok(self.endpoints().await?.and_then(|e| e.token_url))
    }

    /// Returns the registration endpoint.
    pub async fn registration_url(&self) -> Result<Option<Url>, SmartError> {
        Ok(self.endpoints().await?.and_then(|e| e.registration_url))
    }

    /// Creates an authorization session configured with this server's endpoints.
    ///
    /// For an open server the session is left unconfigured, so starting an
    /// authorization fails with a configuration error.
    ///
    /// # Errors
    ///
    /// Conformance resolution errors, and `Configuration` if the settings do
    /// not validate against the advertised endpoints.
    pub async fn authorization_session(
        &self,
        config: &SmartClientConfig,
        presenter: Arc<dyn AuthorizationPresenter>,
        persistence: Option<Arc<dyn TokenPersistence>>,
    ) -> Result<AuthorizationSession, SmartError> {
        let endpoints = self.endpoints().await?;
        if endpoints.is_none() {
            tracing::debug!("{} advertises no OAuth endpoints", self.base_url);
        }

        let mut builder = AuthorizationSession::from_config(config, self.http.clone(), presenter)?
            .endpoints(endpoints);
        if let Some(persistence) = persistence {
            builder = builder.persistence(persistence);
        }
        builder.build()
    }

    /// Creates a FHIR client, signed with the session's token if one is given.
    #[must_use]
    pub fn client(&self, session: Option<&AuthorizationSession>) -> FhirClient {
        FhirClient::new(
            self.base_url.clone(),
            self.http.clone(),
            session.map(|s| s.tokens().clone()),
        )
    }
}

impl std::fmt::Debug for FhirServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FhirServer")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}
