//! Endpoint URL utilities for AgentOps.

use crate::constants::{AUTH_TOKEN_PATH, OTLP_LOGS_PATH, OTLP_TRACES_PATH};

fn join(base_url: &str, path: &str) -> String {
    let url = base_url.trim_end_matches('/');
    format!("{}{}", url, path)
}

/// Builds the OTLP traces endpoint URL by appending `/v1/traces`.
///
/// # Example
///
/// ```
/// use opentelemetry_agentops::endpoint::build_traces_endpoint;
///
/// let endpoint = build_traces_endpoint("https://otlp.agentops.ai/");
/// assert_eq!(endpoint, "https://otlp.agentops.ai/v1/traces");
/// ```
pub fn build_traces_endpoint(base_url: &str) -> String {
    join(base_url, OTLP_TRACES_PATH)
}

/// Builds the OTLP logs endpoint URL by appending `/v1/logs`.
pub fn build_logs_endpoint(base_url: &str) -> String {
    join(base_url, OTLP_LOGS_PATH)
}

/// Builds the token exchange URL by appending `/v3/auth/token`.
///
/// # Example
///
/// ```
/// use opentelemetry_agentops::endpoint::build_token_url;
///
/// let url = build_token_url("https://api.agentops.ai");
/// assert_eq!(url, "https://api.agentops.ai/v3/auth/token");
/// ```
pub fn build_token_url(api_endpoint: &str) -> String {
    join(api_endpoint, AUTH_TOKEN_PATH)
}

/// Joins an API base URL with a request path, tolerating missing or doubled slashes.
pub fn build_api_url(api_endpoint: &str, path: &str) -> String {
    if path.starts_with('/') {
        join(api_endpoint, path)
    } else {
        join(api_endpoint, &format!("/{}", path))
    }
}
