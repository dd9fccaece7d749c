//! Error types for the opentelemetry-agentops library.

use opentelemetry_sdk::error::OTelSdkError;
use thiserror::Error;
use uuid::Uuid;

/// Error type for opentelemetry-agentops operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Required configuration is missing.
    #[error("Missing configuration: {0}")]
    MissingConfiguration(&'static str),

    /// A configuration value could not be parsed.
    #[error("Invalid configuration for {key}: {value:?}")]
    InvalidConfiguration {
        /// Name of the offending setting.
        key: &'static str,
        /// The raw value that failed to parse.
        value: String,
    },

    /// The API key was rejected or the token endpoint returned no token.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The backend reported that the JWT has expired.
    #[error("JWT token expired")]
    TokenExpired,

    /// The server answered with a status the caller cannot handle.
    #[error("Unexpected HTTP status {status}: {body}")]
    UnexpectedStatus {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly truncated by the server.
        body: String,
    },

    /// Transport-level HTTP failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The HTTP method is not supported by the API client.
    #[error("Unsupported HTTP method: {0}")]
    UnsupportedMethod(String),

    /// No live session is registered under this id.
    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    /// OpenTelemetry SDK error.
    #[error("OpenTelemetry error: {0}")]
    OpenTelemetry(#[from] OTelSdkError),

    /// OTLP exporter build error.
    #[error("OTLP exporter error: {0}")]
    OtlpExporter(#[from] opentelemetry_otlp::ExporterBuildError),

    /// The worker pool no longer accepts jobs.
    #[error("Worker pool is shut down")]
    PoolClosed,

    /// I/O error, e.g. when spawning a worker thread.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns true for failures that mean the credentials are no longer usable.
    pub fn is_auth_failure(&self) -> bool {
        match self {
            Error::Authentication(_) | Error::TokenExpired => true,
            Error::UnexpectedStatus { status, .. } => *status == 401 || *status == 403,
            _ => false,
        }
    }
}

/// Result type alias for opentelemetry-agentops operations.
pub type Result<T> = std::result::Result<T, Error>;
