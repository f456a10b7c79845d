//! HTTP collaborator.
//!
//! The conformance resolver, the authorization-code exchange, token refresh
//! and the FHIR client all talk to the network through the [`HttpClient`]
//! trait. [`ReqwestHttpClient`] is the default implementation; tests and
//! hosts with their own networking stack can supply another one.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::SmartError;

/// An outgoing HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method.
    pub method: Method,
    /// Target URL.
    pub url: Url,
    /// Request headers, in order.
    pub headers: Vec<(String, String)>,
    /// Optional request body.
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    /// Creates a request with no headers and no body.
    #[must_use]
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
            body: None,
        }
    }

    /// Creates a GET request.
    #[must_use]
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Creates a POST request with a URL-encoded form body.
    #[must_use]
    pub fn post_form<'a>(url: Url, params: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish();

        Self::new(Method::POST, url)
            .with_header("Content-Type", "application/x-www-form-urlencoded")
            .with_body(body.into_bytes())
    }

    /// Appends a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the body.
    #[must_use]
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    /// Sets a header, replacing any existing header with the same name.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
    }

    /// Returns the first value of a header (case-insensitive).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A received HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// The URL the response was delivered from, after redirects.
    pub url: Url,
    /// Response headers.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Returns `true` for 2xx status codes.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Returns `true` if the response was delivered over HTTP(S).
    #[must_use]
    pub fn is_http(&self) -> bool {
        is_http_url(&self.url)
    }

    /// Returns the body as (lossy) UTF-8 text.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Parses the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns `SmartError::Parse` if the body is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, SmartError> {
        serde_json::from_slice(&self.body).map_err(|e| SmartError::parse(e.to_string()))
    }
}

/// Returns `true` if the URL uses the `http` or `https` scheme.
#[must_use]
pub fn is_http_url(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}

/// Asynchronous HTTP transport.
///
/// Implementations report transport failures as `SmartError::Network` and
/// non-HTTP targets as `SmartError::NotHttp`. Non-success status codes are
/// not errors at this level; they are returned as responses.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Executes a request.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, SmartError>;
}

/// [`HttpClient`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    /// Creates a client with the given request timeout.
    ///
    /// # Errors
    ///
    /// Returns `SmartError::Configuration` if the TLS backend cannot be initialized.
    pub fn new(timeout: Duration) -> Result<Self, SmartError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SmartError::configuration(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Wraps an existing `reqwest` client.
    #[must_use]
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, SmartError> {
        if !is_http_url(&request.url) {
            return Err(SmartError::NotHttp);
        }

        let mut builder = self.client.request(request.method, request.url.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            tracing::debug!("HTTP request to {} failed: {}", request.url, e);
            SmartError::network(e.to_string())
        })?;

        let status = response.status().as_u16();
        let url = response.url().clone();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| SmartError::network(e.to_string()))?
            .to_vec();

        Ok(HttpResponse {
            status,
            url,
            headers,
            body,
        })
    }
}
