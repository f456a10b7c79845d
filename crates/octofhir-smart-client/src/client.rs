//! FHIR REST client.
//!
//! Issues GET interactions against a FHIR base URL and, when a token store
//! is attached, signs them with its bearer token.

use std::sync::Arc;

use serde_json::Value;
use url::Url;

use crate::error::SmartError;
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::token::TokenStore;

const FHIR_JSON: &str = "application/fhir+json";

/// Client for the read-side FHIR interactions.
#[derive(Clone)]
pub struct FhirClient {
    base_url: Url,
    http: Arc<dyn HttpClient>,
    tokens: Option<TokenStore>,
}

impl FhirClient {
    /// Creates a client; requests are signed when `tokens` is given.
    #[must_use]
    pub fn new(base_url: Url, http: Arc<dyn HttpClient>, tokens: Option<TokenStore>) -> Self {
        Self {
            base_url,
            http,
            tokens,
        }
    }

    /// Returns the FHIR base URL.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `GET [base]/[type]/[id]`
    pub async fn read(&self, resource_type: &str, id: &str) -> Result<Value, SmartError> {
        let url = self.fhir_url(&format!("{resource_type}/{id}"));
        self.get(url).await
    }

    /// `GET [base]/[type]?params`
    pub async fn search(
        &self,
        resource_type: &str,
        params: &[(String, String)],
    ) -> Result<Value, SmartError> {
        let mut url = self.fhir_url(resource_type);
        if !params.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(params.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        self.get(url).await
    }

    /// `GET [base]/metadata`
    pub async fn metadata(&self) -> Result<Value, SmartError> {
        self.get(self.fhir_url("metadata")).await
    }

    /// Signs (if a token store is attached) and executes a request.
    ///
    /// # Errors
    ///
    /// Token errors from signing, transport errors, and `Http` for
    /// non-success responses (with OperationOutcome diagnostics when the
    /// server sent them).
    pub async fn execute(&self, request: HttpRequest) -> Result<Value, SmartError> {
        let request = match &self.tokens {
            Some(tokens) => tokens.sign(request).await?,
            None => request,
        };

        tracing::debug!("{} {}", request.method, request.url);
        let response = self.http.execute(request).await?;
        handle_response(&response)
    }

    async fn get(&self, url: Url) -> Result<Value, SmartError> {
        self.execute(HttpRequest::get(url).with_header("Accept", FHIR_JSON))
            .await
    }

    fn fhir_url(&self, path: &str) -> Url {
        let mut url = self.base_url.clone();
        let base_path = self.base_url.path().trim_end_matches('/');
        url.set_path(&format!("{base_path}/{path}"));
        url
    }
}

impl std::fmt::Debug for FhirClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FhirClient")
            .field("base_url", &self.base_url.as_str())
            .field("signed", &self.tokens.is_some())
            .finish_non_exhaustive()
    }
}

fn handle_response(response: &HttpResponse) -> Result<Value, SmartError> {
    if !response.is_success() {
        let body = response.text();
        if let Ok(json) = serde_json::from_str::<Value>(&body)
            && json.get("resourceType").and_then(|v| v.as_str()) == Some("OperationOutcome")
            && let Some(issues) = json.get("issue").and_then(|v| v.as_array())
        {
            let msgs: Vec<&str> = issues
                .iter()
                .filter_map(|i| i.get("diagnostics").and_then(|d| d.as_str()))
                .collect();
            if !msgs.is_empty() {
                return Err(SmartError::http(response.status, msgs.join("; ")));
            }
        }
        return Err(SmartError::http(response.status, body));
    }

    if response.body.is_empty() {
        return Ok(Value::Null);
    }
    response.json()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHttpClient;
    use crate::token::Token;
    use serde_json::json;

    fn base() -> Url {
        Url::parse("https://ex.org/fhir/").unwrap()
    }

    #[tokio::test]
    async fn test_read_builds_url() {
        let http = Arc::new(FakeHttpClient::new());
        http.push_json(200, json!({"resourceType": "Patient", "id": "1"}));
        let client = FhirClient::new(base(), http.clone(), None);

        let patient = client.read("Patient", "1").await.unwrap();
        assert_eq!(patient["id"], "1");

        let sent = http.requests();
        assert_eq!(sent[0].url.as_str(), "https://ex.org/fhir/Patient/1");
        assert_eq!(sent[0].header("Accept"), Some(FHIR_JSON));
        assert!(sent[0].header("Authorization").is_none());
    }

    #[tokio::test]
    async fn test_search_is_signed() {
        let http = Arc::new(FakeHttpClient::new());
        http.push_json(200, json!({"resourceType": "Bundle", "type": "searchset"}));
        let tokens = TokenStore::builder("my_app", http.clone()).build();
        tokens.set_token(Token::bearer("abc")).await;
        let client = FhirClient::new(base(), http.clone(), Some(tokens));

        let params = vec![("name".to_string(), "Smith".to_string())];
        client.search("Patient", &params).await.unwrap();

        let sent = http.requests();
        assert_eq!(sent[0].url.as_str(), "https://ex.org/fhir/Patient?name=Smith");
        assert_eq!(sent[0].header("Authorization"), Some("Bearer abc"));
    }

    #[tokio::test]
    async fn test_unsigned_request_without_token_fails() {
        let http = Arc::new(FakeHttpClient::new());
        let tokens = TokenStore::builder("my_app", http.clone()).build();
        let client = FhirClient::new(base(), http.clone(), Some(tokens));

        assert!(matches!(
            client.metadata().await,
            Err(SmartError::NoToken)
        ));
        assert_eq!(http.calls(), 0);
    }

    #[test]
    fn test_operation_outcome_diagnostics() {
        let response = HttpResponse {
            status: 404,
            url: base(),
            headers: vec![],
            body: serde_json::to_vec(&json!({
                "resourceType": "OperationOutcome",
                "issue": [{
                    "severity": "error",
                    "code": "not-found",
                    "diagnostics": "Patient/9 not found"
                }]
            }))
            .unwrap(),
        };

        let err = handle_response(&response).unwrap_err();
        assert_eq!(err.to_string(), "HTTP error 404: Patient/9 not found");
    }
}
