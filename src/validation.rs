use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;
use validator::Validate;

use crate::error::ThrottlerError;

static KEY_PATTERN: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.:@\-]{1,256}$"));

/// Body of `POST /acquire`. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct AcquireRequest {
    /// Caller key, used when no identity header is present
    #[validate(length(min = 1, max = 256))]
    pub key: Option<String>,
    /// Permits to take; missing means one
    pub tokens: Option<i64>,
    #[validate(length(max = 64))]
    pub algorithm: Option<String>,
}

impl AcquireRequest {
    pub fn permits(&self) -> i64 {
        self.tokens.unwrap_or(1)
    }
}

/// Request validation utilities
pub struct RequestValidator;

impl RequestValidator {
    /// Field-level checks. The permit count's sign is left to the
    /// throttler, which counts negative requests as errors.
    pub fn validate_acquire(request: &AcquireRequest) -> Result<(), ThrottlerError> {
        request
            .validate()
            .map_err(|e| ThrottlerError::ValidationError(e.to_string()))
    }

    /// Validates a caller key and returns it trimmed.
    pub fn validate_key(key: &str) -> Result<String, ThrottlerError> {
        let key = key.trim();
        if key.is_empty() {
            return Err(ThrottlerError::ValidationError(
                "Rate limit key cannot be empty".to_string(),
            ));
        }

        let pattern = KEY_PATTERN
            .as_ref()
            .map_err(|e| ThrottlerError::InternalError(format!("key pattern: {}", e)))?;
        if !pattern.is_match(key) {
            return Err(ThrottlerError::ValidationError(
                "Rate limit key may only contain letters, digits and '_', '-', '.', ':', '@' (at most 256)".to_string(),
            ));
        }

        Ok(key.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let request: AcquireRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(request.permits(), 1);
        assert!(RequestValidator::validate_acquire(&request).is_ok());
    }

    #[test]
    fn test_negative_tokens_pass_through() {
        let request: AcquireRequest = serde_json::from_str(r#"{"tokens":-1}"#).unwrap();
        assert!(RequestValidator::validate_acquire(&request).is_ok());
        assert_eq!(request.permits(), -1);
    }

    #[test]
    fn test_zero_tokens_are_allowed() {
        let request: AcquireRequest = serde_json::from_str(r#"{"tokens":0,"algorithm":"leaky_bucket"}"#).unwrap();
        assert!(RequestValidator::validate_acquire(&request).is_ok());
        assert_eq!(request.permits(), 0);
    }

    #[test]
    fn test_oversized_fields_fail_validation() {
        let request = AcquireRequest {
            algorithm: Some("x".repeat(65)),
            ..AcquireRequest::default()
        };
        let err = RequestValidator::validate_acquire(&request).unwrap_err();
        assert!(matches!(err, ThrottlerError::ValidationError(_)));

        let request = AcquireRequest {
            key: Some(String::new()),
            ..AcquireRequest::default()
        };
        assert!(RequestValidator::validate_acquire(&request).is_err());
    }

    #[test]
    fn test_validate_key() {
        assert_eq!(RequestValidator::validate_key(" user-1 ").unwrap(), "user-1");
        assert!(RequestValidator::validate_key("tenant:42@example.com").is_ok());
        assert!(RequestValidator::validate_key("").is_err());
        assert!(RequestValidator::validate_key("invalid key!").is_err());
        assert!(RequestValidator::validate_key(&"a".repeat(257)).is_err());
    }
}
