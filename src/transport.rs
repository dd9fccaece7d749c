//! HTTP transport for the OTLP exporter with swappable auth headers.
//!
//! The OTLP exporter fixes its headers at build time, so live credentials are
//! injected one layer down: [`AuthenticatedHttpClient`] adds whatever
//! [`SharedHeaders`] currently holds to every outgoing request and records
//! the response status so the exporter can tell an auth rejection from any
//! other failure. Exporters that cannot swap headers themselves hand the
//! client a [`JwtProvider`] instead, and every request carries a fresh token.

use crate::exporter::JwtProvider;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct HeaderState {
    headers: HashMap<String, String>,
    last_status: Option<StatusCode>,
}

/// Header set shared between an exporter and its HTTP transport.
#[derive(Debug, Clone, Default)]
pub struct SharedHeaders {
    state: Arc<Mutex<HeaderState>>,
}

impl SharedHeaders {
    /// Creates an empty header set.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HeaderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a copy of the headers currently installed.
    pub fn current(&self) -> HashMap<String, String> {
        self.lock().headers.clone()
    }

    /// Installs `headers` until the returned guard is dropped.
    ///
    /// Dropping the guard puts the previous headers back, whichever way the
    /// enclosing scope is left.
    pub fn swap(&self, headers: HashMap<String, String>) -> HeaderSwapGuard {
        let previous = std::mem::replace(&mut self.lock().headers, headers);
        HeaderSwapGuard {
            shared: self.clone(),
            previous: Some(previous),
        }
    }

    /// Records the status of the latest response.
    pub fn record_status(&self, status: StatusCode) {
        self.lock().last_status = Some(status);
    }

    /// Returns and clears the status of the latest response.
    pub fn take_status(&self) -> Option<StatusCode> {
        self.lock().last_status.take()
    }
}

/// Restores the previous headers of a [`SharedHeaders`] on drop.
#[derive(Debug)]
pub struct HeaderSwapGuard {
    shared: SharedHeaders,
    previous: Option<HashMap<String, String>>,
}

impl Drop for HeaderSwapGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.shared.lock().headers = previous;
        }
    }
}

/// `opentelemetry_http::HttpClient` that injects [`SharedHeaders`] per request.
///
/// Requests go out through a blocking `reqwest` client: span processors drive
/// exports from their own thread, outside any async runtime.
#[derive(Clone)]
pub struct AuthenticatedHttpClient {
    client: reqwest::blocking::Client,
    headers: SharedHeaders,
    jwt_provider: Option<Arc<dyn JwtProvider>>,
}

impl Debug for AuthenticatedHttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticatedHttpClient")
            .field("headers", &self.headers)
            .field("has_jwt_provider", &self.jwt_provider.is_some())
            .finish()
    }
}

impl AuthenticatedHttpClient {
    /// Wraps `client`, reading headers from `headers` on every request.
    pub fn new(client: reqwest::blocking::Client, headers: SharedHeaders) -> Self {
        Self {
            client,
            headers,
            jwt_provider: None,
        }
    }

    /// Asks `provider` for a token on every request and sends it as a
    /// bearer `Authorization` header. A 401 or 403 answer invalidates it.
    pub fn with_jwt_provider(mut self, provider: Arc<dyn JwtProvider>) -> Self {
        self.jwt_provider = Some(provider);
        self
    }

    /// The header set this transport reads from.
    pub fn headers(&self) -> &SharedHeaders {
        &self.headers
    }

    fn note_status(&self, status: StatusCode) {
        self.headers.record_status(status);
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            if let Some(provider) = &self.jwt_provider {
                tracing::warn!(%status, "collector rejected token, invalidating it");
                provider.invalidate();
            }
        }
    }
}

#[async_trait::async_trait]
impl opentelemetry_http::HttpClient for AuthenticatedHttpClient {
    async fn send_bytes(
        &self,
        mut request: http::Request<Bytes>,
    ) -> Result<http::Response<Bytes>, Box<dyn std::error::Error + Send + Sync + 'static>> {
        for (name, value) in self.headers.current() {
            let name = HeaderName::from_bytes(name.as_bytes())?;
            let value = HeaderValue::from_str(&value)?;
            request.headers_mut().insert(name, value);
        }
        if let Some(provider) = &self.jwt_provider {
            if let Some(token) = provider.current_token()? {
                let value = HeaderValue::from_str(&format!("Bearer {}", token))?;
                request.headers_mut().insert(AUTHORIZATION, value);
            }
        }

        let request: reqwest::blocking::Request = request.map(|body| body.to_vec()).try_into()?;
        let response = match self.client.execute(request) {
            Ok(response) => response,
            Err(err) => {
                if let Some(status) = err.status() {
                    self.note_status(status);
                }
                return Err(Box::new(err));
            }
        };

        let status = response.status();
        self.note_status(status);
        let response_headers = response.headers().clone();
        let body = response.bytes()?;

        let mut http_response = http::Response::builder().status(status).body(body)?;
        *http_response.headers_mut() = response_headers;
        Ok(http_response)
    }
}
