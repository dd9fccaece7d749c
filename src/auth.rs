//! JWT lifecycle for a single AgentOps endpoint.
//!
//! [`AuthManager`] holds at most one bearer token. A held token is considered
//! valid; expiry is discovered reactively, when the backend answers 401/403
//! and the caller clears the token. Refreshing is single-flight: concurrent
//! callers serialize on the manager's lock and only the first one to observe
//! an empty slot invokes the fetcher.

use crate::api_client::ApiResponse;
use crate::constants::{is_protected_header, API_KEY_HEADER, JSON_CONTENT_TYPE};
use crate::Result;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Holds and refreshes the bearer token for one endpoint.
#[derive(Debug)]
pub struct AuthManager {
    endpoint: String,
    jwt_token: Mutex<Option<String>>,
}

impl AuthManager {
    /// Creates a manager for `endpoint` with no token held.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            jwt_token: Mutex::new(None),
        }
    }

    /// The endpoint this manager authenticates against.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn slot(&self) -> MutexGuard<'_, Option<String>> {
        self.jwt_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns whether a token is currently held.
    ///
    /// No expiry check is made here.
    pub fn is_token_valid(&self) -> bool {
        self.slot().is_some()
    }

    /// Returns a snapshot of the held token.
    pub fn token(&self) -> Option<String> {
        self.slot().clone()
    }

    /// Returns the held token, fetching one first if none is held.
    ///
    /// The lock is held for the duration of the fetch, so at most one fetch
    /// runs per manager; other callers wait and then reuse its result. Errors
    /// from `token_fetcher` are returned unchanged and leave the slot empty.
    ///
    /// # Example
    ///
    /// ```
    /// use opentelemetry_agentops::AuthManager;
    ///
    /// let manager = AuthManager::new("https://api.agentops.ai");
    /// let token = manager
    ///     .get_valid_token("key", |_api_key| Ok("tok1".to_string()))
    ///     .unwrap();
    /// assert_eq!(token, "tok1");
    /// assert!(manager.is_token_valid());
    /// ```
    pub fn get_valid_token<F>(&self, api_key: &str, token_fetcher: F) -> Result<String>
    where
        F: FnOnce(&str) -> Result<String>,
    {
        let mut slot = self.slot();
        if let Some(token) = slot.as_ref() {
            return Ok(token.clone());
        }

        tracing::debug!(endpoint = %self.endpoint, "fetching new auth token");
        let token = token_fetcher(api_key)?;
        *slot = Some(token.clone());
        Ok(token)
    }

    /// Builds the request headers for an authenticated call.
    ///
    /// The result always carries `Content-Type` and `Accept`, carries
    /// `X-Api-Key` when `api_key` is non-empty and `Authorization` only while
    /// a token is held. Custom headers are merged in, except those naming a
    /// protected header, which are dropped.
    pub fn prepare_auth_headers(
        &self,
        api_key: &str,
        custom_headers: Option<&HashMap<String, String>>,
    ) -> HashMap<String, String> {
        let mut headers = HashMap::new();

        if let Some(custom) = custom_headers {
            headers.extend(
                custom
                    .iter()
                    .filter(|(name, _)| !is_protected_header(name))
                    .map(|(name, value)| (name.clone(), value.clone())),
            );
        }

        headers.insert("Content-Type".to_string(), JSON_CONTENT_TYPE.to_string());
        headers.insert("Accept".to_string(), "*/*".to_string());

        if !api_key.is_empty() {
            headers.insert(API_KEY_HEADER.to_string(), api_key.to_string());
        }

        if let Some(token) = self.slot().as_ref() {
            headers.insert("Authorization".to_string(), format!("Bearer {}", token));
        }

        headers
    }

    /// Returns true if `response` says the token has expired.
    ///
    /// Requires a 401/403 status plus either a JSON `error` field mentioning
    /// "expired" or "token", or, for a non-JSON body, the word "expired".
    pub fn is_token_expired_response(response: &ApiResponse) -> bool {
        let status = response.status.as_u16();
        if status != 401 && status != 403 {
            return false;
        }

        match serde_json::from_str::<serde_json::Value>(&response.body) {
            Ok(json) => json
                .get("error")
                .map(|error| {
                    let message = match error.as_str() {
                        Some(text) => text.to_lowercase(),
                        None => error.to_string().to_lowercase(),
                    };
                    message.contains("expired") || message.contains("token")
                })
                .unwrap_or(false),
            Err(_) => response.body.to_lowercase().contains("expired"),
        }
    }

    /// Drops the held token so the next [`AuthManager::get_valid_token`] refetches.
    pub fn clear_token(&self) {
        *self.slot() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use http::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    fn response(status: u16, body: &str) -> ApiResponse {
        ApiResponse {
            status: StatusCode::from_u16(status).unwrap(),
            headers: Default::default(),
            body: body.to_string(),
        }
    }

    #[test]
    fn test_fetches_once_then_reuses() {
        let manager = AuthManager::new("https://api.example.com");
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let token = manager
                .get_valid_token("key", |key| {
                    assert_eq!(key, "key");
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("tok1".to_string())
                })
                .unwrap();
            assert_eq!(token, "tok1");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_single_flight_under_contention() {
        const CALLERS: usize = 16;
        let manager = Arc::new(AuthManager::new("https://api.example.com"));
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(CALLERS));

        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let calls = Arc::clone(&calls);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    manager
                        .get_valid_token("key", |_| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(20));
                            Ok("shared-token".to_string())
                        })
                        .unwrap()
                })
            })
            .collect();

        let tokens: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(tokens.iter().all(|t| t == "shared-token"));
    }

    #[test]
    fn test_fetch_error_propagates_and_leaves_slot_empty() {
        let manager = AuthManager::new("https://api.example.com");

        let result = manager.get_valid_token("bad", |_| Err(Error::Authentication("nope".into())));
        assert!(matches!(result, Err(Error::Authentication(_))));
        assert!(!manager.is_token_valid());

        // The next call fetches again
        let token = manager
            .get_valid_token("good", |_| Ok("tok2".to_string()))
            .unwrap();
        assert_eq!(token, "tok2");
    }

    #[test]
    fn test_clear_token_forces_refetch() {
        let manager = AuthManager::new("https://api.example.com");
        manager
            .get_valid_token("key", |_| Ok("old".to_string()))
            .unwrap();

        manager.clear_token();
        assert!(!manager.is_token_valid());
        assert_eq!(manager.token(), None);

        let token = manager
            .get_valid_token("key", |_| Ok("new".to_string()))
            .unwrap();
        assert_eq!(token, "new");
    }

    #[test]
    fn test_prepare_headers_protects_credentials() {
        let manager = AuthManager::new("https://api.example.com");
        let custom = HashMap::from([
            ("Authorization".to_string(), "hacked".to_string()),
            ("x-api-key".to_string(), "stolen".to_string()),
            ("CONTENT-TYPE".to_string(), "text/plain".to_string()),
            ("User-Agent".to_string(), "evil".to_string()),
            ("X-Request-Id".to_string(), "abc".to_string()),
        ]);

        // No token held: no Authorization at all
        let headers = manager.prepare_auth_headers("key", Some(&custom));
        assert!(!headers
            .keys()
            .any(|k| k.eq_ignore_ascii_case("authorization")));
        assert_eq!(headers.get("X-Api-Key").map(String::as_str), Some("key"));
        assert!(!headers.contains_key("x-api-key"));
        assert_eq!(
            headers.get("Content-Type").map(String::as_str),
            Some(JSON_CONTENT_TYPE)
        );
        assert!(!headers.contains_key("CONTENT-TYPE"));
        assert!(!headers.contains_key("User-Agent"));
        assert_eq!(headers.get("Accept").map(String::as_str), Some("*/*"));
        assert_eq!(headers.get("X-Request-Id").map(String::as_str), Some("abc"));

        manager
            .get_valid_token("key", |_| Ok("tok1".to_string()))
            .unwrap();
        let headers = manager.prepare_auth_headers("key", Some(&custom));
        assert_eq!(
            headers.get("Authorization").map(String::as_str),
            Some("Bearer tok1")
        );
        assert!(!headers.values().any(|v| v == "hacked" || v == "stolen"));
    }

    #[test]
    fn test_prepare_headers_without_api_key() {
        let manager = AuthManager::new("https://api.example.com");
        let headers = manager.prepare_auth_headers("", None);
        assert!(!headers.contains_key(API_KEY_HEADER));
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn test_token_expired_classification() {
        assert!(AuthManager::is_token_expired_response(&response(
            401,
            r#"{"error": "Token has expired"}"#
        )));
        assert!(AuthManager::is_token_expired_response(&response(
            403,
            r#"{"error": "invalid token"}"#
        )));
        assert!(AuthManager::is_token_expired_response(&response(
            401,
            "jwt expired"
        )));

        // Wrong status
        assert!(!AuthManager::is_token_expired_response(&response(
            500,
            r#"{"error": "token expired"}"#
        )));
        // JSON without a matching error field
        assert!(!AuthManager::is_token_expired_response(&response(
            401,
            r#"{"error": "forbidden", "detail": "expired"}"#
        )));
        assert!(!AuthManager::is_token_expired_response(&response(
            401,
            r#"{"message": "expired"}"#
        )));
        // Plain text without the keyword
        assert!(!AuthManager::is_token_expired_response(&response(
            403,
            "forbidden"
        )));
    }
}
