//! Runtime configuration.
//!
//! [`Config`] gathers the plain values the API client, the exporters and the
//! session instrumentor are built from. It can be assembled by hand with the
//! `with_*` setters or read from the environment:
//!
//! - `AGENTOPS_API_KEY`: API key exchanged for a JWT (optional)
//! - `AGENTOPS_API_ENDPOINT`: REST API base URL (defaults to `https://api.agentops.ai`)
//! - `AGENTOPS_EXPORTER_ENDPOINT`: collector base URL, falling back to
//!   `OTEL_EXPORTER_OTLP_ENDPOINT` and then `https://otlp.agentops.ai`
//! - `AGENTOPS_SERVICE_NAME`: `service.name` resource attribute
//! - `AGENTOPS_MAX_RETRIES`: retries on 5xx responses
//! - `AGENTOPS_AUTH_COOLDOWN_SECS`: exporter back-off after an auth failure
//! - `AGENTOPS_CAPTURE_LOGS`: capture stdout/stderr into log records

use crate::constants::{
    DEFAULT_API_ENDPOINT, DEFAULT_AUTH_FAILURE_THRESHOLD_SECS, DEFAULT_BACKOFF_FACTOR_MS,
    DEFAULT_EXPORTER_ENDPOINT, DEFAULT_MAX_RETRIES, DEFAULT_SERVICE_NAME,
    ENV_AGENTOPS_API_ENDPOINT, ENV_AGENTOPS_API_KEY, ENV_AGENTOPS_AUTH_COOLDOWN_SECS,
    ENV_AGENTOPS_CAPTURE_LOGS, ENV_AGENTOPS_EXPORTER_ENDPOINT, ENV_AGENTOPS_MAX_RETRIES,
    ENV_AGENTOPS_SERVICE_NAME, OTEL_EXPORTER_OTLP_ENDPOINT,
};
use crate::endpoint;
use crate::{Error, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Configuration shared by the tracing core components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// API key exchanged for a JWT. Without one, requests go out unauthenticated.
    pub api_key: Option<String>,
    /// Base URL of the REST API (token exchange lives here).
    pub api_endpoint: String,
    /// Base URL of the OTLP collector.
    pub exporter_endpoint: String,
    /// Value of the `service.name` resource attribute.
    pub service_name: String,
    /// How many times a 5xx response is retried.
    pub max_retries: u32,
    /// Base factor of the exponential backoff between retries.
    pub retry_backoff: Duration,
    /// How long exports are skipped after an authentication failure.
    pub auth_failure_threshold: Duration,
    /// Whether sessions capture stdout/stderr into log records.
    pub capture_logs: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            api_endpoint: DEFAULT_API_ENDPOINT.to_string(),
            exporter_endpoint: DEFAULT_EXPORTER_ENDPOINT.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: Duration::from_millis(DEFAULT_BACKOFF_FACTOR_MS),
            auth_failure_threshold: Duration::from_secs(DEFAULT_AUTH_FAILURE_THRESHOLD_SECS),
            capture_logs: false,
        }
    }
}

impl Config {
    /// Creates a configuration with default endpoints and no API key.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the configuration from environment variables.
    ///
    /// Unset variables keep their defaults. A variable that is set but cannot
    /// be parsed yields [`Error::InvalidConfiguration`].
    ///
    /// # Example
    ///
    /// ```no_run
    /// use opentelemetry_agentops::Config;
    ///
    /// # fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let config = Config::from_env()?.with_service_name("my-agent");
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        config.api_key = env::var(ENV_AGENTOPS_API_KEY)
            .ok()
            .filter(|key| !key.trim().is_empty());

        if let Ok(url) = env::var(ENV_AGENTOPS_API_ENDPOINT) {
            config.api_endpoint = url;
        }

        if let Ok(url) = env::var(ENV_AGENTOPS_EXPORTER_ENDPOINT)
            .or_else(|_| env::var(OTEL_EXPORTER_OTLP_ENDPOINT))
        {
            config.exporter_endpoint = url;
        }

        if let Ok(name) = env::var(ENV_AGENTOPS_SERVICE_NAME) {
            config.service_name = name;
        }

        if let Some(retries) = parse_env::<u32>(ENV_AGENTOPS_MAX_RETRIES)? {
            config.max_retries = retries;
        }

        if let Some(secs) = parse_env::<u64>(ENV_AGENTOPS_AUTH_COOLDOWN_SECS)? {
            config.auth_failure_threshold = Duration::from_secs(secs);
        }

        if let Some(capture) = parse_env::<bool>(ENV_AGENTOPS_CAPTURE_LOGS)? {
            config.capture_logs = capture;
        }

        Ok(config)
    }

    /// Sets the API key.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Sets the REST API base URL.
    pub fn with_api_endpoint(mut self, url: impl Into<String>) -> Self {
        self.api_endpoint = url.into();
        self
    }

    /// Sets the collector base URL.
    pub fn with_exporter_endpoint(mut self, url: impl Into<String>) -> Self {
        self.exporter_endpoint = url.into();
        self
    }

    /// Sets the `service.name` resource attribute.
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Sets the number of 5xx retries.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the backoff factor between retries.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Sets the exporter cooldown after an authentication failure.
    pub fn with_auth_failure_threshold(mut self, threshold: Duration) -> Self {
        self.auth_failure_threshold = threshold;
        self
    }

    /// Enables or disables stdout/stderr capture.
    pub fn with_capture_logs(mut self, capture: bool) -> Self {
        self.capture_logs = capture;
        self
    }

    /// Full OTLP traces URL derived from [`Config::exporter_endpoint`].
    pub fn traces_endpoint(&self) -> String {
        endpoint::build_traces_endpoint(&self.exporter_endpoint)
    }

    /// Full OTLP logs URL derived from [`Config::exporter_endpoint`].
    pub fn logs_endpoint(&self) -> String {
        endpoint::build_logs_endpoint(&self.exporter_endpoint)
    }
}

fn parse_env<T: FromStr>(key: &'static str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::InvalidConfiguration { key, value: raw }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            ENV_AGENTOPS_API_KEY,
            ENV_AGENTOPS_API_ENDPOINT,
            ENV_AGENTOPS_EXPORTER_ENDPOINT,
            ENV_AGENTOPS_SERVICE_NAME,
            ENV_AGENTOPS_MAX_RETRIES,
            ENV_AGENTOPS_AUTH_COOLDOWN_SECS,
            ENV_AGENTOPS_CAPTURE_LOGS,
            OTEL_EXPORTER_OTLP_ENDPOINT,
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();

        let config = Config::from_env().unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.traces_endpoint(), "https://otlp.agentops.ai/v1/traces");
        assert_eq!(config.auth_failure_threshold, Duration::from_secs(60));
    }

    #[test]
    #[serial]
    fn test_from_env_reads_variables() {
        clear_env();
        env::set_var(ENV_AGENTOPS_API_KEY, "key-123");
        env::set_var(ENV_AGENTOPS_API_ENDPOINT, "http://localhost:8000");
        env::set_var(OTEL_EXPORTER_OTLP_ENDPOINT, "http://localhost:4318");
        env::set_var(ENV_AGENTOPS_MAX_RETRIES, "5");
        env::set_var(ENV_AGENTOPS_AUTH_COOLDOWN_SECS, "10");
        env::set_var(ENV_AGENTOPS_CAPTURE_LOGS, "true");

        let config = Config::from_env().unwrap();
        assert_eq!(config.api_key.as_deref(), Some("key-123"));
        assert_eq!(config.api_endpoint, "http://localhost:8000");
        assert_eq!(config.logs_endpoint(), "http://localhost:4318/v1/logs");
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.auth_failure_threshold, Duration::from_secs(10));
        assert!(config.capture_logs);

        // The AgentOps-specific variable wins over the OTEL one
        env::set_var(ENV_AGENTOPS_EXPORTER_ENDPOINT, "http://collector:4318");
        let config = Config::from_env().unwrap();
        assert_eq!(config.exporter_endpoint, "http://collector:4318");

        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_garbage() {
        clear_env();
        env::set_var(ENV_AGENTOPS_MAX_RETRIES, "many");

        let result = Config::from_env();
        assert!(matches!(
            result,
            Err(Error::InvalidConfiguration {
                key: ENV_AGENTOPS_MAX_RETRIES,
                ..
            })
        ));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_blank_api_key_is_ignored() {
        clear_env();
        env::set_var(ENV_AGENTOPS_API_KEY, "   ");
        assert!(Config::from_env().unwrap().api_key.is_none());
        clear_env();
    }
}
