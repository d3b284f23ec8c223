//! Caller identity extraction.
//!
//! Turns request headers into the key that buckets are stored under.

use axum::http::HeaderMap;

use crate::error::ThrottlerError;

/// Strategy for generating rate limit keys
#[derive(Debug, Clone, PartialEq)]
pub enum KeyStrategy {
    /// Use API key from `x-api-key`, or the credentials of `authorization`
    ApiKey,
    /// Use user ID from the `x-user-id` header
    UserId,
    /// First source that is present wins
    FirstOf(Vec<KeyStrategy>),
}

/// Generates rate limiting keys based on request context
#[derive(Debug, Clone)]
pub struct KeyGenerator {
    default_strategy: KeyStrategy,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

impl KeyGenerator {
    pub fn new(strategy: KeyStrategy) -> Self {
        Self {
            default_strategy: strategy,
        }
    }

    pub fn generate_key(&self, headers: &HeaderMap) -> Result<String, ThrottlerError> {
        self.generate_key_with_strategy(&self.default_strategy, headers)
    }

    pub fn generate_key_with_strategy(
        &self,
        strategy: &KeyStrategy,
        headers: &HeaderMap,
    ) -> Result<String, ThrottlerError> {
        match strategy {
            KeyStrategy::ApiKey => Ok(format!("api:{}", Self::sanitize_key(Self::api_key(headers)?))),
            KeyStrategy::UserId => Ok(Self::sanitize_key(Self::user_id(headers)?)),
            KeyStrategy::FirstOf(strategies) => {
                let mut last_err = ThrottlerError::MissingUserId;
                for sub_strategy in strategies {
                    match self.generate_key_with_strategy(sub_strategy, headers) {
                        Ok(key) => return Ok(key),
                        Err(e) => last_err = e,
                    }
                }
                Err(last_err)
            }
        }
    }

    fn api_key(headers: &HeaderMap) -> Result<&str, ThrottlerError> {
        header(headers, "x-api-key")
            .or_else(|| header(headers, "authorization").map(Self::credentials))
            .filter(|v| !v.is_empty())
            .ok_or(ThrottlerError::MissingApiKey)
    }

    /// `Bearer abc` and `ApiKey abc` both identify the caller as `abc`.
    fn credentials(authorization: &str) -> &str {
        match authorization.split_once(char::is_whitespace) {
            Some((_scheme, token)) => token.trim(),
            None => authorization,
        }
    }

    fn user_id(headers: &HeaderMap) -> Result<&str, ThrottlerError> {
        header(headers, "x-user-id").ok_or(ThrottlerError::MissingUserId)
    }

    /// Replace anything outside the key alphabet with `_`.
    pub fn sanitize_key(key: &str) -> String {
        key.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, ':' | '-' | '_' | '.' | '@') {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl Default for KeyGenerator {
    /// User id, then API key.
    fn default() -> Self {
        Self::new(KeyStrategy::FirstOf(vec![KeyStrategy::UserId, KeyStrategy::ApiKey]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn create_test_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("test-api-key"));
        headers.insert("x-user-id", HeaderValue::from_static("user123"));
        headers
    }

    #[test]
    fn test_api_key_strategy() {
        let generator = KeyGenerator::new(KeyStrategy::ApiKey);
        let key = generator.generate_key(&create_test_headers()).unwrap();
        assert_eq!(key, "api:test-api-key");
    }

    #[test]
    fn test_authorization_scheme_is_stripped() {
        let generator = KeyGenerator::new(KeyStrategy::ApiKey);

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer abc123"));
        assert_eq!(generator.generate_key(&headers).unwrap(), "api:abc123");

        headers.insert("authorization", HeaderValue::from_static("raw-token"));
        assert_eq!(generator.generate_key(&headers).unwrap(), "api:raw-token");

        headers.insert("authorization", HeaderValue::from_static("Basic dXNlcjpwYXNz=="));
        assert_eq!(generator.generate_key(&headers).unwrap(), "api:dXNlcjpwYXNz__");
    }

    #[test]
    fn test_user_id_strategy() {
        let generator = KeyGenerator::new(KeyStrategy::UserId);
        let key = generator.generate_key(&create_test_headers()).unwrap();
        assert_eq!(key, "user123");

        let err = generator.generate_key(&HeaderMap::new()).unwrap_err();
        assert!(matches!(err, ThrottlerError::MissingUserId));
    }

    #[test]
    fn test_header_values_are_sanitized() {
        let generator = KeyGenerator::default();
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_static("jane doe/42"));
        assert_eq!(generator.generate_key(&headers).unwrap(), "jane_doe_42");
    }

    #[test]
    fn test_default_prefers_user_id_then_api_key() {
        let generator = KeyGenerator::default();
        assert_eq!(generator.generate_key(&create_test_headers()).unwrap(), "user123");

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("k-1"));
        assert_eq!(generator.generate_key(&headers).unwrap(), "api:k-1");

        let err = generator.generate_key(&HeaderMap::new()).unwrap_err();
        assert!(matches!(err, ThrottlerError::MissingApiKey));
    }

    #[test]
    fn test_sanitize_key() {
        let sanitized = KeyGenerator::sanitize_key("test#key with$special%chars@example.com");
        assert_eq!(sanitized, "test_key_with_special_chars@example.com");
        assert_eq!(KeyGenerator::sanitize_key("clé"), "cl_");
    }
}
