//! Constants for the opentelemetry-agentops library.

pub use opentelemetry_otlp::OTEL_EXPORTER_OTLP_ENDPOINT;

/// Environment variable name for the AgentOps API key.
pub const ENV_AGENTOPS_API_KEY: &str = "AGENTOPS_API_KEY";

/// Environment variable name for the AgentOps REST API base URL.
pub const ENV_AGENTOPS_API_ENDPOINT: &str = "AGENTOPS_API_ENDPOINT";

/// Environment variable name for the OTLP collector base URL.
pub const ENV_AGENTOPS_EXPORTER_ENDPOINT: &str = "AGENTOPS_EXPORTER_ENDPOINT";

/// Environment variable name for the reported `service.name`.
pub const ENV_AGENTOPS_SERVICE_NAME: &str = "AGENTOPS_SERVICE_NAME";

/// Environment variable name for the number of 5xx retries.
pub const ENV_AGENTOPS_MAX_RETRIES: &str = "AGENTOPS_MAX_RETRIES";

/// Environment variable name for the exporter auth cooldown, in seconds.
pub const ENV_AGENTOPS_AUTH_COOLDOWN_SECS: &str = "AGENTOPS_AUTH_COOLDOWN_SECS";

/// Environment variable name toggling stdout/stderr capture.
pub const ENV_AGENTOPS_CAPTURE_LOGS: &str = "AGENTOPS_CAPTURE_LOGS";

/// Default AgentOps REST API host URL.
pub const DEFAULT_API_ENDPOINT: &str = "https://api.agentops.ai";

/// Default OTLP collector host URL.
pub const DEFAULT_EXPORTER_ENDPOINT: &str = "https://otlp.agentops.ai";

/// Default `service.name` resource attribute.
pub const DEFAULT_SERVICE_NAME: &str = "agentops";

/// Default number of retries for 5xx responses.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base factor of the exponential retry backoff, in milliseconds.
pub const DEFAULT_BACKOFF_FACTOR_MS: u64 = 100;

/// Default exporter cooldown after an authentication failure, in seconds.
pub const DEFAULT_AUTH_FAILURE_THRESHOLD_SECS: u64 = 60;

/// Time each processor gets to drain when a session shuts down, in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// Upper bound on idle pooled connections per host.
pub const POOL_MAXSIZE: usize = 256;

/// Status codes the API client retries with backoff.
pub const RETRY_STATUSES: [u16; 4] = [500, 502, 503, 504];

/// Path of the token exchange endpoint.
pub const AUTH_TOKEN_PATH: &str = "/v3/auth/token";

/// Path appended to the collector base URL for traces.
pub const OTLP_TRACES_PATH: &str = "/v1/traces";

/// Path appended to the collector base URL for logs.
pub const OTLP_LOGS_PATH: &str = "/v1/logs";

/// Header carrying the raw API key.
pub const API_KEY_HEADER: &str = "X-Api-Key";

/// Content type sent by the API client.
pub const JSON_CONTENT_TYPE: &str = "application/json; charset=UTF-8";

/// Header names callers may never override, compared case-insensitively.
pub const PROTECTED_HEADERS: [&str; 8] = [
    "authorization",
    "content-type",
    "user-agent",
    "x-api-key",
    "api-key",
    "bearer",
    "x-auth-token",
    "x-session-token",
];

/// Name of the root span every session owns.
pub const SESSION_SPAN_NAME: &str = "session";

/// Lifecycle span emitted right after the root span starts.
pub const SESSION_START_SPAN_NAME: &str = "session.start";

/// Lifecycle span emitted right before the root span ends.
pub const SESSION_END_SPAN_NAME: &str = "session.end";

/// Span names routed to the lifecycle exporter.
pub const LIFECYCLE_SPAN_NAMES: [&str; 2] = [SESSION_START_SPAN_NAME, SESSION_END_SPAN_NAME];

/// Resource and span attribute carrying the session id.
pub const SESSION_ID_ATTRIBUTE: &str = "session.id";

/// Instrumentation scope name used for every tracer and logger.
pub const INSTRUMENTATION_NAME: &str = "agentops";

/// User agent reported by the API client.
pub const USER_AGENT: &str = concat!("agentops-rs/", env!("CARGO_PKG_VERSION"));

/// Returns true if `name` is one of the [`PROTECTED_HEADERS`].
pub fn is_protected_header(name: &str) -> bool {
    PROTECTED_HEADERS
        .iter()
        .any(|protected| protected.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protected_header_matching_ignores_case() {
        assert!(is_protected_header("Authorization"));
        assert!(is_protected_header("X-API-KEY"));
        assert!(is_protected_header("x-session-token"));
        assert!(!is_protected_header("X-Request-Id"));
    }
}
