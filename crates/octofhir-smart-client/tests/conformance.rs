//! Conformance resolution against a mock FHIR server.

use std::sync::Arc;
use std::time::Duration;

use octofhir_smart_client::{
    ConformanceResolver, FhirServer, OAUTH_URIS_EXTENSION, ReqwestHttpClient, SmartError,
};
use serde_json::json;
use url::Url;
use wiremock::matchers::{headers, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn resolver() -> ConformanceResolver {
    let http = ReqwestHttpClient::new(Duration::from_secs(5)).unwrap();
    ConformanceResolver::new(Arc::new(http))
}

fn capability_statement() -> serde_json::Value {
    json!({
        "resourceType": "CapabilityStatement",
        "fhirVersion": "4.0.1",
        "rest": [{
            "mode": "server",
            "security": {
                "service": [{"coding": [{"code": "SMART-on-FHIR"}]}],
                "extension": [{
                    "url": OAUTH_URIS_EXTENSION,
                    "extension": [
                        {"url": "authorize", "valueUri": "https://ex.org/auth"},
                        {"url": "token", "valueUri": "https://ex.org/token"}
                    ]
                }]
            }
        }]
    })
}

#[tokio::test]
async fn test_resolve_endpoints() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/fhir/metadata"))
        .and(headers("Accept", vec!["application/fhir+json", "application/json"]))
        .respond_with(ResponseTemplate::new(200).set_body_json(capability_statement()))
        .expect(1)
        .mount(&mock_server)
        .await;

    let base = Url::parse(&format!("{}/fhir/", mock_server.uri())).unwrap();
    let metadata = resolver().resolve(&base).await.unwrap();

    let endpoints = metadata.endpoints.clone().unwrap();
    assert_eq!(endpoints.authorization_url.as_str(), "https://ex.org/auth");
    assert_eq!(
        endpoints.token_url.map(|u| u.to_string()),
        Some("https://ex.org/token".to_string())
    );
    assert!(endpoints.registration_url.is_none());
    assert_eq!(metadata.fhir_version(), Some("4.0.1"));
}

#[tokio::test]
async fn test_resolve_file_url_is_not_http() {
    let base = Url::parse("file:///tmp/fhir").unwrap();

    let err = resolver().resolve(&base).await.unwrap_err();
    assert!(matches!(err, SmartError::NotHttp));
    assert_eq!(err.to_string(), "Not an HTTP response");
}

#[tokio::test]
async fn test_resolve_invalid_json() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/metadata"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>not json</html>"))
        .mount(&mock_server)
        .await;

    let base = Url::parse(&mock_server.uri()).unwrap();
    let err = resolver().resolve(&base).await.unwrap_err();
    assert!(matches!(err, SmartError::Parse { .. }));
}

#[tokio::test]
async fn test_resolve_http_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/metadata"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    let base = Url::parse(&mock_server.uri()).unwrap();
    let err = resolver().resolve(&base).await.unwrap_err();
    assert!(matches!(err, SmartError::Http { status: 503, .. }));
    assert!(err.is_transport_error());
}

#[tokio::test]
async fn test_resolve_unreachable_host() {
    // Port 9 (discard) is closed on test hosts
    let base = Url::parse("http://127.0.0.1:9/fhir").unwrap();
    let err = resolver().resolve(&base).await.unwrap_err();
    assert!(matches!(err, SmartError::Network { .. }));
}

#[tokio::test]
async fn test_resolve_well_known() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/.well-known/smart-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "authorization_endpoint": "https://ex.org/auth",
            "token_endpoint": "https://ex.org/token",
            "capabilities": ["launch-standalone", "client-public"]
        })))
        .mount(&mock_server)
        .await;

    let base = Url::parse(&mock_server.uri()).unwrap();
    let endpoints = resolver().resolve_well_known(&base).await.unwrap();
    assert_eq!(endpoints.authorization_url.as_str(), "https://ex.org/auth");
    assert!(endpoints.token_url.is_some());
}

#[tokio::test]
async fn test_server_caches_metadata() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/metadata"))
        .respond_with(ResponseTemplate::new(200).set_body_json(capability_statement()))
        .expect(1)
        .mount(&mock_server)
        .await;

    let server = FhirServer::connect(
        Url::parse(&mock_server.uri()).unwrap(),
        Duration::from_secs(5),
    )
    .unwrap();

    assert!(server.authorize_url().await.unwrap().is_some());
    assert!(server.token_url().await.unwrap().is_some());
    assert!(server.registration_url().await.unwrap().is_none());
}
