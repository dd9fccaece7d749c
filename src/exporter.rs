//! Authenticated OTLP span export.
//!
//! This module provides [`AuthenticatedOtlpExporter`], a [`SpanExporter`]
//! decorator that attaches a live JWT to every export and backs off after an
//! authentication failure, and [`ExporterBuilder`] for wiring it to an
//! OTLP/HTTP collector.
//!
//! Export never fails loudly: every error is logged and reported to the span
//! processor as an [`OTelSdkError`], and a failure opens a cooldown window
//! during which exports are skipped without touching the network.

use crate::api_client::shared_http_client;
use crate::config::Config;
use crate::constants::{is_protected_header, DEFAULT_AUTH_FAILURE_THRESHOLD_SECS};
use crate::endpoint;
use crate::transport::{AuthenticatedHttpClient, SharedHeaders};
use crate::{Error, Result};
use opentelemetry_otlp::{WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::error::{OTelSdkError, OTelSdkResult};
use opentelemetry_sdk::trace::{SpanData, SpanExporter};
use opentelemetry_sdk::Resource;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Source of the bearer token attached to each export.
///
/// Any `Fn() -> Result<Option<String>>` closure is a provider.
pub trait JwtProvider: Send + Sync {
    /// Returns the token to send, or `None` to export without one.
    fn current_token(&self) -> Result<Option<String>>;

    /// Called after the collector rejected the token.
    fn invalidate(&self) {}
}

impl<F> JwtProvider for F
where
    F: Fn() -> Result<Option<String>> + Send + Sync,
{
    fn current_token(&self) -> Result<Option<String>> {
        self()
    }
}

// The failure an export saw when it passed the cooldown check.
#[derive(Debug, Clone, Copy)]
struct ExportTicket {
    observed: Option<Instant>,
}

/// Whether the exporter is currently willing to export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExporterState {
    /// Exports go out normally.
    Ready,
    /// A recent failure is still within the cooldown window.
    AuthCooldown,
}

#[derive(Debug)]
enum ExportFailure {
    Rejected(StatusCode),
    TokenExpired,
    Authentication(String),
    Server(StatusCode),
    Transport(String),
    Unexpected(String),
}

impl ExportFailure {
    fn from_provider_error(err: Error) -> Self {
        match err {
            Error::TokenExpired => ExportFailure::TokenExpired,
            err if err.is_auth_failure() => ExportFailure::Authentication(err.to_string()),
            err => ExportFailure::Unexpected(err.to_string()),
        }
    }

    fn is_auth(&self) -> bool {
        matches!(
            self,
            ExportFailure::Rejected(_)
                | ExportFailure::TokenExpired
                | ExportFailure::Authentication(_)
        )
    }
}

impl fmt::Display for ExportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFailure::Rejected(status) => {
                write!(f, "collector rejected credentials ({})", status)
            }
            ExportFailure::TokenExpired => f.write_str("JWT token expired"),
            ExportFailure::Authentication(msg) => write!(f, "authentication failed: {}", msg),
            ExportFailure::Server(status) => write!(f, "collector answered {}", status),
            ExportFailure::Transport(msg) => write!(f, "transport error: {}", msg),
            ExportFailure::Unexpected(msg) => write!(f, "unexpected error: {}", msg),
        }
    }
}

/// A span exporter that authenticates each export with a live JWT.
///
/// The token comes from the [`JwtProvider`] when one is set, otherwise from
/// the stored token (see [`AuthenticatedOtlpExporter::update_token`]).
/// Custom headers are sent along, but never ones naming a protected header.
pub struct AuthenticatedOtlpExporter<E: SpanExporter = opentelemetry_otlp::SpanExporter> {
    inner: E,
    headers: SharedHeaders,
    custom_headers: HashMap<String, String>,
    jwt: RwLock<Option<String>>,
    jwt_provider: Option<Arc<dyn JwtProvider>>,
    auth_failure_threshold: Duration,
    last_auth_failure: Mutex<Option<Instant>>,
}

impl<E: SpanExporter> Debug for AuthenticatedOtlpExporter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticatedOtlpExporter")
            .field("inner", &self.inner)
            .field("has_jwt_provider", &self.jwt_provider.is_some())
            .field("auth_failure_threshold", &self.auth_failure_threshold)
            .finish()
    }
}

impl<E: SpanExporter> AuthenticatedOtlpExporter<E> {
    /// Wraps `inner`, whose transport reads its headers from `headers`.
    pub fn with_inner(inner: E, headers: SharedHeaders) -> Self {
        Self {
            inner,
            headers,
            custom_headers: HashMap::new(),
            jwt: RwLock::new(None),
            jwt_provider: None,
            auth_failure_threshold: Duration::from_secs(DEFAULT_AUTH_FAILURE_THRESHOLD_SECS),
            last_auth_failure: Mutex::new(None),
        }
    }

    /// Sets the stored token.
    pub fn with_jwt(self, jwt: impl Into<String>) -> Self {
        self.update_token(Some(jwt.into()));
        self
    }

    /// Sets the token provider; it takes precedence over the stored token.
    pub fn with_jwt_provider(mut self, provider: Arc<dyn JwtProvider>) -> Self {
        self.jwt_provider = Some(provider);
        self
    }

    /// Sets the headers sent with every export.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.custom_headers = headers;
        self
    }

    /// Sets how long exports are skipped after a failure.
    pub fn with_auth_failure_threshold(mut self, threshold: Duration) -> Self {
        self.auth_failure_threshold = threshold;
        self
    }

    /// Replaces the stored token.
    pub fn update_token(&self, jwt: Option<String>) {
        *self.jwt.write().unwrap_or_else(PoisonError::into_inner) = jwt;
    }

    /// Drops buffered state. The exporter buffers nothing, so this does nothing.
    pub fn clear(&self) {}

    /// Returns whether exports currently go out.
    pub fn state(&self) -> ExporterState {
        if self.cooldown_remaining().is_some() {
            ExporterState::AuthCooldown
        } else {
            ExporterState::Ready
        }
    }

    /// Time of the last recorded failure, if it has not been cleared by a success.
    pub fn last_auth_failure(&self) -> Option<Instant> {
        *self.failure_slot()
    }

    fn failure_slot(&self) -> MutexGuard<'_, Option<Instant>> {
        self.last_auth_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn cooldown_remaining(&self) -> Option<Duration> {
        self.remaining_after(*self.failure_slot())
    }

    fn remaining_after(&self, failed_at: Option<Instant>) -> Option<Duration> {
        self.auth_failure_threshold
            .checked_sub(failed_at?.elapsed())
            .filter(|remaining| !remaining.is_zero())
    }

    // Checks the cooldown and remembers the failure it saw, under one lock.
    fn begin_export(&self) -> std::result::Result<ExportTicket, Duration> {
        let slot = self.failure_slot();
        match self.remaining_after(*slot) {
            Some(remaining) => Err(remaining),
            None => Ok(ExportTicket { observed: *slot }),
        }
    }

    // A success only clears the failure that was current when it started.
    fn record_success(&self, ticket: ExportTicket) {
        let mut slot = self.failure_slot();
        if *slot == ticket.observed {
            *slot = None;
        }
    }

    fn resolve_token(&self) -> Result<Option<String>> {
        match &self.jwt_provider {
            Some(provider) => provider.current_token(),
            None => Ok(self
                .jwt
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()),
        }
    }

    fn prepare_headers(&self, token: Option<&str>) -> HashMap<String, String> {
        let mut headers: HashMap<String, String> = self
            .custom_headers
            .iter()
            .filter(|(name, _)| !is_protected_header(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        if let Some(token) = token {
            headers.insert("Authorization".to_string(), format!("Bearer {}", token));
        }
        headers
    }

    fn record_failure(&self, failure: ExportFailure) -> OTelSdkError {
        *self.failure_slot() = Some(Instant::now());

        if failure.is_auth() {
            tracing::warn!(
                error = %failure,
                cooldown = ?self.auth_failure_threshold,
                "span export not authorized, backing off"
            );
            if let Some(provider) = &self.jwt_provider {
                provider.invalidate();
            }
        } else {
            tracing::error!(
                error = %failure,
                cooldown = ?self.auth_failure_threshold,
                "span export failed"
            );
        }

        OTelSdkError::InternalFailure(failure.to_string())
    }

    fn classify(
        result: OTelSdkResult,
        status: Option<StatusCode>,
    ) -> std::result::Result<(), ExportFailure> {
        match (status, result) {
            (Some(status), _)
                if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN =>
            {
                Err(ExportFailure::Rejected(status))
            }
            (Some(status), Ok(())) if !status.is_success() => {
                Err(ExportFailure::Server(status))
            }
            (_, Err(err)) => Err(ExportFailure::Transport(err.to_string())),
            (_, Ok(())) => Ok(()),
        }
    }
}

impl<E: SpanExporter> SpanExporter for AuthenticatedOtlpExporter<E> {
    async fn export(&self, batch: Vec<SpanData>) -> OTelSdkResult {
        let ticket = match self.begin_export() {
            Ok(ticket) => ticket,
            Err(remaining) => {
                tracing::debug!(
                    ?remaining,
                    spans = batch.len(),
                    "auth cooldown active, skipping export"
                );
                return Err(OTelSdkError::InternalFailure(format!(
                    "export skipped during auth cooldown ({:?} remaining)",
                    remaining
                )));
            }
        };

        let token = match self.resolve_token() {
            Ok(token) => token,
            Err(err) => {
                return Err(self.record_failure(ExportFailure::from_provider_error(err)));
            }
        };

        self.headers.take_status();
        let result = {
            let _restore = self.headers.swap(self.prepare_headers(token.as_deref()));
            self.inner.export(batch).await
        };
        let status = self.headers.take_status();

        match Self::classify(result, status) {
            Ok(()) => {
                self.record_success(ticket);
                Ok(())
            }
            Err(failure) => Err(self.record_failure(failure)),
        }
    }

    fn shutdown_with_timeout(&mut self, timeout: Duration) -> OTelSdkResult {
        self.inner.shutdown_with_timeout(timeout)
    }

    fn set_resource(&mut self, resource: &Resource) {
        self.inner.set_resource(resource);
    }
}

/// Builder for an [`AuthenticatedOtlpExporter`] over OTLP/HTTP.
pub struct ExporterBuilder {
    endpoint: Option<String>,
    jwt: Option<String>,
    jwt_provider: Option<Arc<dyn JwtProvider>>,
    timeout: Option<Duration>,
    auth_failure_threshold: Duration,
    additional_headers: HashMap<String, String>,
    http_client: Option<reqwest::blocking::Client>,
}

impl ExporterBuilder {
    /// Creates a new ExporterBuilder.
    pub fn new() -> Self {
        Self {
            endpoint: None,
            jwt: None,
            jwt_provider: None,
            timeout: None,
            auth_failure_threshold: Duration::from_secs(DEFAULT_AUTH_FAILURE_THRESHOLD_SECS),
            additional_headers: HashMap::new(),
            http_client: None,
        }
    }

    /// Creates a builder targeting the collector and cooldown of `config`.
    pub fn from_config(config: &Config) -> Self {
        Self::new()
            .with_endpoint(config.traces_endpoint())
            .with_auth_failure_threshold(config.auth_failure_threshold)
    }

    /// Sets the complete OTLP traces URL.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Sets the collector base URL; `/v1/traces` is appended.
    pub fn with_host(mut self, host: &str) -> Self {
        self.endpoint = Some(endpoint::build_traces_endpoint(host));
        self
    }

    /// Sets a fixed JWT.
    pub fn with_jwt(mut self, jwt: impl Into<String>) -> Self {
        self.jwt = Some(jwt.into());
        self
    }

    /// Sets the token provider consulted on every export.
    pub fn with_jwt_provider(mut self, provider: Arc<dyn JwtProvider>) -> Self {
        self.jwt_provider = Some(provider);
        self
    }

    /// Sets the HTTP timeout for the exporter.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets how long exports are skipped after a failure.
    pub fn with_auth_failure_threshold(mut self, threshold: Duration) -> Self {
        self.auth_failure_threshold = threshold;
        self
    }

    /// Sets a custom blocking HTTP client instead of the shared pool.
    pub fn with_http_client(mut self, client: reqwest::blocking::Client) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Adds an additional HTTP header. Protected headers are ignored at export time.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.additional_headers.insert(name.into(), value.into());
        self
    }

    /// Adds multiple HTTP headers.
    pub fn with_headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.additional_headers
            .extend(headers.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Builds the exporter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingConfiguration`] without an endpoint, or the
    /// OTLP build error.
    pub fn build(self) -> Result<AuthenticatedOtlpExporter> {
        let endpoint = self
            .endpoint
            .ok_or(Error::MissingConfiguration("endpoint"))?;

        let shared = SharedHeaders::new();
        let transport = AuthenticatedHttpClient::new(
            self.http_client.unwrap_or_else(shared_http_client),
            shared.clone(),
        );

        let mut http_config = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_http_client(transport)
            .with_endpoint(endpoint);

        if let Some(timeout) = self.timeout {
            http_config = http_config.with_timeout(timeout);
        }

        let mut exporter = AuthenticatedOtlpExporter::with_inner(http_config.build()?, shared)
            .with_headers(self.additional_headers)
            .with_auth_failure_threshold(self.auth_failure_threshold);

        if let Some(jwt) = self.jwt {
            exporter = exporter.with_jwt(jwt);
        }
        if let Some(provider) = self.jwt_provider {
            exporter = exporter.with_jwt_provider(provider);
        }
        Ok(exporter)
    }
}

impl Default for ExporterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Creates an authenticated exporter for the collector at `host`.
///
/// # Example
///
/// ```no_run
/// use opentelemetry_agentops::{exporter, ApiClient};
/// use std::sync::Arc;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = Arc::new(ApiClient::new("https://api.agentops.ai"));
/// let exporter = exporter("https://otlp.agentops.ai", client.jwt_provider("my-api-key"))?;
/// // Use the exporter with your TracerProvider setup
/// # Ok(())
/// # }
/// ```
pub fn exporter(
    host: &str,
    jwt_provider: Arc<dyn JwtProvider>,
) -> Result<AuthenticatedOtlpExporter> {
    ExporterBuilder::new()
        .with_host(host)
        .with_jwt_provider(jwt_provider)
        .build()
}
