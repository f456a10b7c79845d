//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;
use url::Url;

use crate::error::SmartError;
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::session::AuthorizationPresenter;
use crate::token::{InMemoryTokenPersistence, Token, TokenPersistence};

/// [`HttpClient`] that records requests and replays queued responses.
///
/// A gated client waits for a permit on its gate before answering, which lets
/// a test act while a request is in flight.
#[derive(Default)]
pub(crate) struct FakeHttpClient {
    responses: Mutex<VecDeque<Result<HttpResponse, SmartError>>>,
    requests: Mutex<Vec<HttpRequest>>,
    calls: AtomicUsize,
    gate: Option<Arc<Notify>>,
}

impl FakeHttpClient {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn gated() -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let client = Self {
            gate: Some(gate.clone()),
            ..Self::default()
        };
        (client, gate)
    }

    pub(crate) fn push_json(&self, status: u16, body: Value) {
        let response = HttpResponse {
            status,
            url: Url::parse("https://ex.org/").unwrap(),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: serde_json::to_vec(&body).unwrap(),
        };
        self.responses.lock().unwrap().push_back(Ok(response));
    }

    pub(crate) fn push_error(&self, error: SmartError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Yields until at least `n` requests have been received.
    pub(crate) async fn wait_for_calls(&self, n: usize) {
        while self.calls() < n {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl HttpClient for FakeHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, SmartError> {
        self.requests.lock().unwrap().push(request);
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(SmartError::network("no response queued")))
    }
}

/// Presenter that records the URLs it was asked to show.
#[derive(Default)]
pub(crate) struct RecordingPresenter {
    embedded: Mutex<Vec<Url>>,
    external: Mutex<Vec<Url>>,
    fail: bool,
}

impl RecordingPresenter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub(crate) fn embedded(&self) -> Vec<Url> {
        self.embedded.lock().unwrap().clone()
    }

    pub(crate) fn external(&self) -> Vec<Url> {
        self.external.lock().unwrap().clone()
    }

    /// The last presented URL; embedded presentations are listed first.
    pub(crate) fn last(&self) -> Option<Url> {
        let mut all = self.embedded();
        all.extend(self.external());
        all.pop()
    }
}

impl AuthorizationPresenter for RecordingPresenter {
    fn present_embedded(&self, url: &Url) -> Result<(), SmartError> {
        if self.fail {
            return Err(SmartError::presentation("no web view available"));
        }
        self.embedded.lock().unwrap().push(url.clone());
        Ok(())
    }

    fn open_externally(&self, url: &Url) -> Result<(), SmartError> {
        if self.fail {
            return Err(SmartError::presentation("no browser available"));
        }
        self.external.lock().unwrap().push(url.clone());
        Ok(())
    }
}

/// [`TokenPersistence`] whose saves block until `release` is notified.
///
/// `entered` is notified when a save starts waiting.
#[derive(Default)]
pub(crate) struct SlowSavePersistence {
    inner: InMemoryTokenPersistence,
    pub(crate) entered: Notify,
    pub(crate) release: Notify,
}

#[async_trait]
impl TokenPersistence for SlowSavePersistence {
    async fn load(&self, client_id: &str) -> Result<Option<Token>, SmartError> {
        self.inner.load(client_id).await
    }

    async fn save(&self, client_id: &str, token: &Token) -> Result<(), SmartError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.save(client_id, token).await
    }

    async fn remove(&self, client_id: &str) -> Result<(), SmartError> {
        self.inner.remove(client_id).await
    }
}
