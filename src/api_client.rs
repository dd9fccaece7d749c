//! Pooled HTTP client for the AgentOps REST API.
//!
//! All clients share one lazily created connection pool per process. Responses
//! with a status in [`RETRY_STATUSES`] are retried with exponential backoff for
//! idempotent methods, and [`ApiClient::authenticated_request`] refreshes the
//! JWT once when the server rejects it.

use crate::auth::AuthManager;
use crate::config::Config;
use crate::constants::{
    API_KEY_HEADER, DEFAULT_BACKOFF_FACTOR_MS, DEFAULT_MAX_RETRIES, JSON_CONTENT_TYPE,
    POOL_MAXSIZE, RETRY_STATUSES, USER_AGENT,
};
use crate::endpoint;
use crate::exporter::JwtProvider;
use crate::{Error, Result};
use reqwest::blocking::Client;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

lazy_static::lazy_static! {
    /// Process-wide HTTP client; clones share its connection pool.
    static ref SHARED_CLIENT: Client = Client::builder()
        .pool_max_idle_per_host(POOL_MAXSIZE)
        .user_agent(USER_AGENT)
        .build()
        .unwrap_or_else(|err| {
            tracing::warn!(error = %err, "falling back to default HTTP client");
            Client::new()
        });
}

/// Returns a handle to the shared, pooled HTTP client.
pub fn shared_http_client() -> Client {
    SHARED_CLIENT.clone()
}

/// HTTP methods the API client knows how to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    /// `GET`
    Get,
    /// `POST`
    Post,
    /// `PUT`
    Put,
    /// `DELETE`
    Delete,
}

impl HttpMethod {
    /// Whether repeating the request is safe.
    pub fn is_idempotent(self) -> bool {
        !matches!(self, HttpMethod::Post)
    }

    fn as_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

impl FromStr for HttpMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "DELETE" => Ok(HttpMethod::Delete),
            _ => Err(Error::UnsupportedMethod(s.to_string())),
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_reqwest().as_str())
    }
}

/// Retry behaviour for server errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before retry `n` is `backoff_factor * 2^n`.
    pub backoff_factor: Duration,
    /// Statuses that trigger a retry.
    pub statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_factor: Duration::from_millis(DEFAULT_BACKOFF_FACTOR_MS),
            statuses: RETRY_STATUSES.to_vec(),
        }
    }
}

impl RetryPolicy {
    /// Returns the delay before retry number `attempt` (zero-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_factor
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    fn should_retry(&self, method: HttpMethod, status: StatusCode, attempt: u32) -> bool {
        method.is_idempotent()
            && attempt < self.max_retries
            && self.statuses.contains(&status.as_u16())
    }
}

/// A fully read HTTP response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// Status code.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body as text.
    pub body: String,
}

impl ApiResponse {
    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// The body as text.
    pub fn text(&self) -> &str {
        &self.body
    }

    /// Turns a non-2xx response into [`Error::UnexpectedStatus`].
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        Err(Error::UnexpectedStatus {
            status: self.status.as_u16(),
            body: self.body,
        })
    }

    /// Deserializes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }

    fn from_reqwest(response: reqwest::blocking::Response) -> Result<Self> {
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text()?;
        Ok(Self {
            status,
            headers,
            body,
        })
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
}

/// Client for the AgentOps REST API.
#[derive(Debug)]
pub struct ApiClient {
    endpoint: String,
    http: Client,
    auth: AuthManager,
    retry_policy: RetryPolicy,
}

impl ApiClient {
    /// Creates a client for `endpoint` backed by the shared connection pool.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_http_client(endpoint, shared_http_client())
    }

    /// Creates a client with a caller-supplied HTTP client.
    pub fn with_http_client(endpoint: impl Into<String>, http: Client) -> Self {
        let endpoint = endpoint.into();
        Self {
            auth: AuthManager::new(endpoint.clone()),
            endpoint,
            http,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Creates a client from the API endpoint and retry settings of `config`.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.api_endpoint.clone()).with_retry_policy(RetryPolicy {
            max_retries: config.max_retries,
            backoff_factor: config.retry_backoff,
            ..RetryPolicy::default()
        })
    }

    /// Replaces the retry policy.
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// The base URL requests are sent to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The token holder used for authenticated requests.
    pub fn auth(&self) -> &AuthManager {
        &self.auth
    }

    /// Exchanges an API key for a JWT at `POST /v3/auth/token`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Authentication`] for any non-200 answer or a body
    /// without a `token` field.
    pub fn fetch_auth_token(&self, api_key: &str) -> Result<String> {
        // Built by hand: the auth manager's lock is held while this runs.
        let response = self
            .http
            .post(endpoint::build_token_url(&self.endpoint))
            .header("Content-Type", JSON_CONTENT_TYPE)
            .header("Accept", "*/*")
            .header(API_KEY_HEADER, api_key)
            .json(&serde_json::json!({ "api_key": api_key }))
            .send()?;
        let response = ApiResponse::from_reqwest(response)?;

        if response.status != StatusCode::OK {
            tracing::error!(status = %response.status, "token exchange rejected");
            return Err(Error::Authentication(format!(
                "token endpoint returned {}",
                response.status
            )));
        }

        response
            .json::<TokenResponse>()
            .ok()
            .and_then(|payload| payload.token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| Error::Authentication("token missing from response".to_string()))
    }

    /// Returns the held JWT, exchanging `api_key` for one if needed.
    pub fn get_valid_token(&self, api_key: &str) -> Result<String> {
        self.auth
            .get_valid_token(api_key, |key| self.fetch_auth_token(key))
    }

    /// Builds headers for an authenticated call; see [`AuthManager::prepare_auth_headers`].
    pub fn prepare_headers(
        &self,
        api_key: &str,
        custom_headers: Option<&HashMap<String, String>>,
    ) -> HashMap<String, String> {
        self.auth.prepare_auth_headers(api_key, custom_headers)
    }

    fn send_once(
        &self,
        method: HttpMethod,
        url: &str,
        data: Option<&JsonValue>,
        headers: &HashMap<String, String>,
    ) -> Result<ApiResponse> {
        let mut request = self.http.request(method.as_reqwest(), url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = data {
            request = request.json(body);
        }
        ApiResponse::from_reqwest(request.send()?)
    }

    /// Sends a request, retrying server errors according to the retry policy.
    pub fn request(
        &self,
        method: HttpMethod,
        path: &str,
        data: Option<&JsonValue>,
        headers: &HashMap<String, String>,
    ) -> Result<ApiResponse> {
        let url = endpoint::build_api_url(&self.endpoint, path);
        let mut attempt = 0;
        loop {
            let response = self.send_once(method, &url, data, headers)?;
            if !self
                .retry_policy
                .should_retry(method, response.status, attempt)
            {
                return Ok(response);
            }

            let delay = self.retry_policy.backoff(attempt);
            tracing::warn!(
                %method,
                %url,
                status = %response.status,
                attempt = attempt + 1,
                ?delay,
                "server error, retrying"
            );
            thread::sleep(delay);
            attempt += 1;
        }
    }

    /// Sends a `GET` request.
    pub fn get(&self, path: &str, headers: &HashMap<String, String>) -> Result<ApiResponse> {
        self.request(HttpMethod::Get, path, None, headers)
    }

    /// Sends a `POST` request with a JSON body.
    pub fn post(
        &self,
        path: &str,
        data: &JsonValue,
        headers: &HashMap<String, String>,
    ) -> Result<ApiResponse> {
        self.request(HttpMethod::Post, path, Some(data), headers)
    }

    /// Sends a `PUT` request with a JSON body.
    pub fn put(
        &self,
        path: &str,
        data: &JsonValue,
        headers: &HashMap<String, String>,
    ) -> Result<ApiResponse> {
        self.request(HttpMethod::Put, path, Some(data), headers)
    }

    /// Sends a `DELETE` request.
    pub fn delete(&self, path: &str, headers: &HashMap<String, String>) -> Result<ApiResponse> {
        self.request(HttpMethod::Delete, path, None, headers)
    }

    /// Sends a request carrying the JWT for `api_key`.
    ///
    /// A 401/403 answer clears the token, fetches a new one and repeats the
    /// request exactly once; the second response is returned as is.
    pub fn authenticated_request(
        &self,
        method: HttpMethod,
        path: &str,
        api_key: &str,
        data: Option<&JsonValue>,
        custom_headers: Option<&HashMap<String, String>>,
    ) -> Result<ApiResponse> {
        self.get_valid_token(api_key)?;
        let headers = self.prepare_headers(api_key, custom_headers);
        let response = self.request(method, path, data, &headers)?;

        if !matches!(response.status.as_u16(), 401 | 403) {
            return Ok(response);
        }

        tracing::warn!(
            %method,
            path,
            status = %response.status,
            expired = AuthManager::is_token_expired_response(&response),
            "token rejected, refreshing and retrying once"
        );
        self.auth.clear_token();
        self.get_valid_token(api_key)?;
        let headers = self.prepare_headers(api_key, custom_headers);
        self.request(method, path, data, &headers)
    }

    /// Returns a [`JwtProvider`] that serves this client's token for `api_key`.
    pub fn jwt_provider(self: &Arc<Self>, api_key: impl Into<String>) -> Arc<dyn JwtProvider> {
        Arc::new(ApiTokenProvider {
            client: Arc::clone(self),
            api_key: api_key.into(),
        })
    }
}

/// [`JwtProvider`] backed by an [`ApiClient`].
struct ApiTokenProvider {
    client: Arc<ApiClient>,
    api_key: String,
}

impl JwtProvider for ApiTokenProvider {
    fn current_token(&self) -> Result<Option<String>> {
        self.client.get_valid_token(&self.api_key).map(Some)
    }

    fn invalidate(&self) {
        self.client.auth().clear_token();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn client_for(server: &mockito::ServerGuard) -> ApiClient {
        ApiClient::with_http_client(server.url(), Client::new()).with_retry_policy(RetryPolicy {
            backoff_factor: Duration::from_millis(1),
            ..RetryPolicy::default()
        })
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("get".parse::<HttpMethod>().unwrap(), HttpMethod::Get);
        assert_eq!("DELETE".parse::<HttpMethod>().unwrap(), HttpMethod::Delete);
        assert!(matches!(
            "PATCH".parse::<HttpMethod>(),
            Err(Error::UnsupportedMethod(m)) if m == "PATCH"
        ));
    }

    #[test]
    fn test_backoff_is_exponential() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
    }

    #[test]
    fn test_fetch_auth_token() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/v3/auth/token")
            .match_header("x-api-key", "key")
            .match_body(Matcher::Json(json!({ "api_key": "key" })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"token": "tok1"}"#)
            .expect(1)
            .create();

        let client = client_for(&server);
        assert_eq!(client.get_valid_token("key").unwrap(), "tok1");
        // Cached: no second exchange
        assert_eq!(client.get_valid_token("key").unwrap(), "tok1");
        assert!(client.auth().is_token_valid());
        mock.assert();
    }

    #[test]
    fn test_fetch_auth_token_failures() {
        let mut server = mockito::Server::new();
        let client = client_for(&server);

        let rejected = server
            .mock("POST", "/v3/auth/token")
            .match_header("x-api-key", "bad")
            .with_status(401)
            .with_body(r#"{"error": "invalid api key"}"#)
            .create();
        assert!(matches!(
            client.fetch_auth_token("bad"),
            Err(Error::Authentication(_))
        ));
        rejected.assert();

        let missing = server
            .mock("POST", "/v3/auth/token")
            .match_header("x-api-key", "empty")
            .with_status(200)
            .with_body(r#"{"status": "ok"}"#)
            .create();
        assert!(matches!(
            client.fetch_auth_token("empty"),
            Err(Error::Authentication(_))
        ));
        missing.assert();
        assert!(!client.auth().is_token_valid());
    }

    #[test]
    fn test_retries_server_errors_for_idempotent_methods() {
        let mut server = mockito::Server::new();
        let failing = server
            .mock("GET", "/v3/flaky")
            .with_status(503)
            .expect(4)
            .create();

        let client = client_for(&server);
        let response = client.get("/v3/flaky", &HashMap::new()).unwrap();
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        failing.assert();
    }

    #[test]
    fn test_post_is_not_retried() {
        let mut server = mockito::Server::new();
        let failing = server
            .mock("POST", "/v3/events")
            .with_status(502)
            .expect(1)
            .create();

        let client = client_for(&server);
        let response = client
            .post("/v3/events", &json!({ "n": 1 }), &HashMap::new())
            .unwrap();
        assert_eq!(response.status.as_u16(), 502);
        failing.assert();
    }

    #[test]
    fn test_client_errors_are_not_retried() {
        let mut server = mockito::Server::new();
        let missing = server
            .mock("GET", "/v3/missing")
            .with_status(404)
            .expect(1)
            .create();

        let client = client_for(&server);
        let response = client.get("/v3/missing", &HashMap::new()).unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        missing.assert();
    }

    #[test]
    fn test_authenticated_request_refreshes_once_on_401() {
        let mut server = mockito::Server::new();
        let token = server
            .mock("POST", "/v3/auth/token")
            .with_status(200)
            .with_body(r#"{"token": "fresh"}"#)
            .expect(1)
            .create();
        let stale = server
            .mock("GET", "/v3/session")
            .match_header("authorization", "Bearer stale")
            .with_status(401)
            .with_body(r#"{"error": "token expired"}"#)
            .expect(1)
            .create();
        let fresh = server
            .mock("GET", "/v3/session")
            .match_header("authorization", "Bearer fresh")
            .with_status(200)
            .with_body(r#"{"id": "s-1"}"#)
            .expect(1)
            .create();

        let client = client_for(&server);
        client
            .auth()
            .get_valid_token("key", |_| Ok("stale".to_string()))
            .unwrap();

        let response = client
            .authenticated_request(HttpMethod::Get, "/v3/session", "key", None, None)
            .unwrap();
        assert!(response.is_success());
        assert_eq!(response.json::<JsonValue>().unwrap()["id"], "s-1");
        assert_eq!(client.auth().token().as_deref(), Some("fresh"));

        token.assert();
        stale.assert();
        fresh.assert();
    }

    #[test]
    fn test_authenticated_request_retries_at_most_once() {
        let mut server = mockito::Server::new();
        let token = server
            .mock("POST", "/v3/auth/token")
            .with_status(200)
            .with_body(r#"{"token": "still-bad"}"#)
            .expect(1)
            .create();
        let first = server
            .mock("PUT", "/v3/session")
            .match_header("authorization", "Bearer stale")
            .with_status(403)
            .expect(1)
            .create();
        let second = server
            .mock("PUT", "/v3/session")
            .match_header("authorization", "Bearer still-bad")
            .with_status(403)
            .expect(1)
            .create();

        let client = client_for(&server);
        client
            .auth()
            .get_valid_token("key", |_| Ok("stale".to_string()))
            .unwrap();

        let response = client
            .authenticated_request(
                HttpMethod::Put,
                "/v3/session",
                "key",
                Some(&json!({ "state": "ended" })),
                None,
            )
            .unwrap();
        assert_eq!(response.status, StatusCode::FORBIDDEN);
        let err = response.error_for_status().unwrap_err();
        assert!(err.is_auth_failure());
        assert!(matches!(err, Error::UnexpectedStatus { status: 403, .. }));

        token.assert();
        first.assert();
        second.assert();
    }

    #[test]
    fn test_custom_headers_cannot_override_credentials() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/v3/me")
            .match_header("authorization", "Bearer tok")
            .match_header("x-api-key", "key")
            .match_header("x-trace", "1")
            .with_status(200)
            .expect(1)
            .create();

        let client = client_for(&server);
        client
            .auth()
            .get_valid_token("key", |_| Ok("tok".to_string()))
            .unwrap();
        let custom = HashMap::from([
            ("Authorization".to_string(), "Bearer hacked".to_string()),
            ("X-Api-Key".to_string(), "other".to_string()),
            ("X-Trace".to_string(), "1".to_string()),
        ]);

        let response = client
            .authenticated_request(HttpMethod::Get, "/v3/me", "key", None, Some(&custom))
            .unwrap();
        assert!(response.is_success());
        mock.assert();
    }

    #[test]
    fn test_jwt_provider_invalidation() {
        let mut server = mockito::Server::new();
        let token = server
            .mock("POST", "/v3/auth/token")
            .with_status(200)
            .with_body(r#"{"token": "tok"}"#)
            .expect(2)
            .create();

        let client = Arc::new(client_for(&server));
        let provider = client.jwt_provider("key");
        assert_eq!(provider.current_token().unwrap().as_deref(), Some("tok"));
        provider.invalidate();
        assert!(!client.auth().is_token_valid());
        assert_eq!(provider.current_token().unwrap().as_deref(), Some("tok"));
        token.assert();
    }
}
