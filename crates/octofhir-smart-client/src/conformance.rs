//! Conformance statement resolution.
//!
//! A SMART on FHIR server advertises its OAuth endpoints in the
//! `rest[].security` element of its CapabilityStatement (formerly the
//! Conformance resource), served at `[base]/metadata`:
//!
//! ```json
//! {
//!   "resourceType": "CapabilityStatement",
//!   "rest": [{
//!     "mode": "server",
//!     "security": {
//!       "extension": [{
//!         "url": "http://fhir-registry.smarthealthit.org/StructureDefinition/oauth-uris",
//!         "extension": [
//!           {"url": "authorize", "valueUri": "https://ex.org/auth"},
//!           {"url": "token", "valueUri": "https://ex.org/token"}
//!         ]
//!       }]
//!     }
//!   }]
//! }
//! ```
//!
//! [`ConformanceResolver`] fetches that document and extracts an
//! [`EndpointSet`]. A server without an authorize endpoint is treated as an
//! open server rather than an error.
//!
//! # References
//!
//! - [SMART App Launch: Conformance](https://build.fhir.org/ig/HL7/smart-app-launch/conformance.html)

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::error::SmartError;
use crate::http::{HttpClient, HttpRequest, is_http_url};

/// Extension URL of the SMART OAuth URIs extension.
pub const OAUTH_URIS_EXTENSION: &str =
    "http://fhir-registry.smarthealthit.org/StructureDefinition/oauth-uris";

/// Prefix of the legacy, flat OAuth URIs extensions (`...#authorize`).
const LEGACY_OAUTH_URIS_PREFIX: &str = "http://fhir-registry.smarthealthit.org/Profile/oauth-uris#";

/// OAuth endpoints of a SMART server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSet {
    /// Authorization endpoint.
    pub authorization_url: Url,
    /// Token endpoint (required by the authorization-code grant).
    pub token_url: Option<Url>,
    /// Dynamic client registration endpoint.
    pub registration_url: Option<Url>,
}

impl EndpointSet {
    /// Creates an endpoint set with only an authorization URL.
    #[must_use]
    pub fn new(authorization_url: Url) -> Self {
        Self {
            authorization_url,
            token_url: None,
            registration_url: None,
        }
    }

    /// Sets the token URL.
    #[must_use]
    pub fn with_token_url(mut self, url: Url) -> Self {
        self.token_url = Some(url);
        self
    }

    /// Sets the registration URL.
    #[must_use]
    pub fn with_registration_url(mut self, url: Url) -> Self {
        self.registration_url = Some(url);
        self
    }
}

/// A resolved conformance statement.
#[derive(Debug, Clone)]
pub struct ServerMetadata {
    /// Base URL the statement was fetched from.
    pub base_url: Url,
    /// The raw statement.
    pub document: Value,
    /// OAuth endpoints, or `None` for an open server.
    pub endpoints: Option<EndpointSet>,
}

impl ServerMetadata {
    /// Returns `true` if the server does not advertise an authorize endpoint.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.endpoints.is_none()
    }

    /// Returns the FHIR version declared by the statement.
    #[must_use]
    pub fn fhir_version(&self) -> Option<&str> {
        self.document.get("fhirVersion").and_then(Value::as_str)
    }
}

/// `.well-known/smart-configuration` document, reduced to the endpoint fields.
#[derive(Debug, Clone, Deserialize)]
struct SmartConfigurationDocument {
    authorization_endpoint: Option<String>,
    token_endpoint: Option<String>,
    registration_endpoint: Option<String>,
}

/// Fetches conformance statements and extracts OAuth endpoints.
#[derive(Clone)]
pub struct ConformanceResolver {
    http: Arc<dyn HttpClient>,
}

impl ConformanceResolver {
    /// Creates a resolver that fetches through the given HTTP client.
    #[must_use]
    pub fn new(http: Arc<dyn HttpClient>) -> Self {
        Self { http }
    }

    /// Fetches `[base]/metadata` and extracts the OAuth endpoints.
    ///
    /// # Errors
    ///
    /// - `NotHttp` if the base URL or the response is not HTTP(S)
    /// - `Network` / `Http` if the fetch fails
    /// - `Parse` if the body is not JSON or an endpoint URL is malformed
    /// - `MissingField` if the document has no `rest` array
    pub async fn resolve(&self, base_url: &Url) -> Result<ServerMetadata, SmartError> {
        let document = self.fetch_json(base_url, "metadata").await?;
        let endpoints = extract_endpoints(&document)?;

        match &endpoints {
            Some(endpoints) => tracing::debug!(
                "Resolved SMART endpoints for {}: authorize={}, token={:?}",
                base_url,
                endpoints.authorization_url,
                endpoints.token_url.as_ref().map(Url::as_str)
            ),
            None => tracing::debug!(
                "Server {} advertises no authorize endpoint; treating as open",
                base_url
            ),
        }

        Ok(ServerMetadata {
            base_url: base_url.clone(),
            document,
            endpoints,
        })
    }

    /// Fetches `[base]/.well-known/smart-configuration` and extracts the endpoints.
    ///
    /// # Errors
    ///
    /// As [`resolve`](Self::resolve); additionally `MissingField` if the
    /// document has no `authorization_endpoint`.
    pub async fn resolve_well_known(&self, base_url: &Url) -> Result<EndpointSet, SmartError> {
        let document = self
            .fetch_json(base_url, ".well-known/smart-configuration")
            .await?;
        let config: SmartConfigurationDocument = serde_json::from_value(document)
            .map_err(|e| SmartError::parse(format!("Invalid smart-configuration: {e}")))?;

        let authorization_url = config
            .authorization_endpoint
            .as_deref()
            .ok_or_else(|| SmartError::missing_field("authorization_endpoint"))
            .and_then(|u| parse_endpoint("authorization_endpoint", u))?;

        Ok(EndpointSet {
            authorization_url,
            token_url: config
                .token_endpoint
                .as_deref()
                .map(|u| parse_endpoint("token_endpoint", u))
                .transpose()?,
            registration_url: config
                .registration_endpoint
                .as_deref()
                .map(|u| parse_endpoint("registration_endpoint", u))
                .transpose()?,
        })
    }

    async fn fetch_json(&self, base_url: &Url, path: &str) -> Result<Value, SmartError> {
        if !is_http_url(base_url) {
            return Err(SmartError::NotHttp);
        }

        let url = join_path(base_url, path);
        let request = HttpRequest::get(url.clone())
            .with_header("Accept", "application/fhir+json, application/json");

        let response = self.http.execute(request).await.map_err(|e| {
            tracing::warn!("Failed to fetch {}: {}", url, e);
            e
        })?;

        if !response.is_http() {
            return Err(SmartError::NotHttp);
        }
        if !response.is_success() {
            return Err(SmartError::http(response.status, response.text()));
        }

        response.json().map_err(|e| {
            tracing::warn!("Failed to parse document from {}: {}", url, e);
            e
        })
    }
}

/// Extracts the OAuth endpoints from a conformance statement.
///
/// Returns `Ok(None)` when the statement has no authorize endpoint.
///
/// # Errors
///
/// Returns `MissingField("rest")` if the statement has no `rest` array, and
/// `Parse` if an advertised endpoint is not a valid URL.
pub fn extract_endpoints(document: &Value) -> Result<Option<EndpointSet>, SmartError> {
    let rest = document
        .get("rest")
        .and_then(Value::as_array)
        .ok_or_else(|| SmartError::missing_field("rest"))?;

    let mut authorize = None;
    let mut token = None;
    let mut register = None;

    let extensions = rest
        .iter()
        .filter_map(|r| r.get("security"))
        .filter_map(|s| s.get("extension"))
        .filter_map(Value::as_array)
        .flatten();

    for extension in extensions {
        let Some(url) = extension.get("url").and_then(Value::as_str) else {
            continue;
        };

        if url == OAUTH_URIS_EXTENSION {
            let nested = extension
                .get("extension")
                .and_then(Value::as_array)
                .into_iter()
                .flatten();
            for item in nested {
                let name = item.get("url").and_then(Value::as_str).unwrap_or_default();
                let value = item.get("valueUri").and_then(Value::as_str);
                assign_endpoint(name, value, &mut authorize, &mut token, &mut register);
            }
        } else if let Some(name) = url.strip_prefix(LEGACY_OAUTH_URIS_PREFIX) {
            let value = extension.get("valueUri").and_then(Value::as_str);
            assign_endpoint(name, value, &mut authorize, &mut token, &mut register);
        }
    }

    let Some(authorize) = authorize else {
        return Ok(None);
    };

    Ok(Some(EndpointSet {
        authorization_url: parse_endpoint("authorize", authorize)?,
        token_url: token.map(|u| parse_endpoint("token", u)).transpose()?,
        registration_url: register.map(|u| parse_endpoint("register", u)).transpose()?,
    }))
}

fn assign_endpoint<'a>(
    name: &str,
    value: Option<&'a str>,
    authorize: &mut Option<&'a str>,
    token: &mut Option<&'a str>,
    register: &mut Option<&'a str>,
) {
    let Some(value) = value else {
        return;
    };
    let slot = match name {
        "authorize" => authorize,
        "token" => token,
        "register" => register,
        _ => return,
    };
    // First rest entry wins
    slot.get_or_insert(value);
}

fn parse_endpoint(name: &str, value: &str) -> Result<Url, SmartError> {
    Url::parse(value)
        .map_err(|e| SmartError::parse(format!("Invalid {name} URL '{value}': {e}")))
}

/// Appends a path to a base URL, ignoring trailing slashes on the base.
fn join_path(base: &Url, path: &str) -> Url {
    let mut url = base.clone();
    let base_path = base.path().trim_end_matches('/');
    url.set_path(&format!("{base_path}/{path}"));
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn statement(extensions: Value) -> Value {
        json!({
            "resourceType": "CapabilityStatement",
            "fhirVersion": "4.0.1",
            "rest": [{
                "mode": "server",
                "security": { "extension": extensions }
            }]
        })
    }

    #[test]
    fn test_extract_nested_extension() {
        let doc = statement(json!([{
            "url": OAUTH_URIS_EXTENSION,
            "extension": [
                {"url": "authorize", "valueUri": "https://ex.org/auth"},
                {"url": "token", "valueUri": "https://ex.org/token"}
            ]
        }]));

        let endpoints = extract_endpoints(&doc).unwrap().unwrap();
        assert_eq!(endpoints.authorization_url.as_str(), "https://ex.org/auth");
        assert_eq!(
            endpoints.token_url.as_ref().map(Url::as_str),
            Some("https://ex.org/token")
        );
        assert!(endpoints.registration_url.is_none());
    }

    #[test]
    fn test_extract_legacy_flat_extensions() {
        let doc = statement(json!([
            {"url": "http://fhir-registry.smarthealthit.org/Profile/oauth-uris#authorize", "valueUri": "https://ex.org/auth"},
            {"url": "http://fhir-registry.smarthealthit.org/Profile/oauth-uris#token", "valueUri": "https://ex.org/token"},
            {"url": "http://fhir-registry.smarthealthit.org/Profile/oauth-uris#register", "valueUri": "https://ex.org/register"}
        ]));

        let endpoints = extract_endpoints(&doc).unwrap().unwrap();
        assert_eq!(endpoints.authorization_url.as_str(), "https://ex.org/auth");
        assert_eq!(
            endpoints.registration_url.as_ref().map(Url::as_str),
            Some("https://ex.org/register")
        );
    }

    #[test]
    fn test_open_server_has_no_endpoints() {
        let doc = json!({
            "resourceType": "CapabilityStatement",
            "rest": [{"mode": "server"}]
        });
        assert!(extract_endpoints(&doc).unwrap().is_none());
    }

    #[test]
    fn test_missing_rest_is_error() {
        let doc = json!({"resourceType": "CapabilityStatement"});
        assert!(matches!(
            extract_endpoints(&doc),
            Err(SmartError::MissingField(field)) if field == "rest"
        ));

        let doc = json!({"rest": "invalid"});
        assert!(extract_endpoints(&doc).is_err());
    }

    #[test]
    fn test_invalid_endpoint_url_is_parse_error() {
        let doc = statement(json!([{
            "url": OAUTH_URIS_EXTENSION,
            "extension": [{"url": "authorize", "valueUri": "not a url"}]
        }]));
        assert!(matches!(
            extract_endpoints(&doc),
            Err(SmartError::Parse { .. })
        ));
    }

    #[test]
    fn test_join_path() {
        let base = Url::parse("https://api.io").unwrap();
        assert_eq!(join_path(&base, "metadata").as_str(), "https://api.io/metadata");

        let base = Url::parse("https://api.io/fhir/").unwrap();
        assert_eq!(
            join_path(&base, "metadata").as_str(),
            "https://api.io/fhir/metadata"
        );

        let base = Url::parse("https://api.io/r4").unwrap();
        assert_eq!(
            join_path(&base, ".well-known/smart-configuration").as_str(),
            "https://api.io/r4/.well-known/smart-configuration"
        );
    }

    #[test]
    fn test_server_metadata_accessors() {
        let metadata = ServerMetadata {
            base_url: Url::parse("https://api.io").unwrap(),
            document: statement(json!([])),
            endpoints: None,
        };
        assert!(metadata.is_open());
        assert_eq!(metadata.fhir_version(), Some("4.0.1"));
    }
}
