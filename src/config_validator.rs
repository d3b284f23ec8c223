use crate::config::Config;
use crate::error::ThrottlerError;

/// Validates configuration objects for consistency and correctness
pub struct ConfigValidator;

impl ConfigValidator {
    /// Prefix bare `host:port` endpoints with `redis://`.
    pub fn normalize_redis_url(endpoint: &str) -> String {
        let endpoint = endpoint.trim();
        if endpoint.starts_with("redis://") || endpoint.starts_with("rediss://") {
            endpoint.to_string()
        } else {
            format!("redis://{}", endpoint)
        }
    }

    /// Validates a Redis endpoint, either a URL or `host:port`
    pub fn validate_redis_url(url: &str) -> Result<(), ThrottlerError> {
        if url.trim().is_empty() {
            return Err(ThrottlerError::ValidationError(
                "Redis URL cannot be empty".to_string(),
            ));
        }

        if url.contains("://") && !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(ThrottlerError::ValidationError(format!(
                "Redis URL '{}' must start with 'redis://' or 'rediss://'",
                url
            )));
        }

        let normalized = Self::normalize_redis_url(url);
        redis::parse_redis_url(&normalized).ok_or_else(|| {
            ThrottlerError::ValidationError(format!("Redis URL '{}' cannot be parsed", url))
        })?;

        Ok(())
    }

    /// Validates a bind address
    pub fn validate_bind_address(address: &str) -> Result<(), ThrottlerError> {
        if address.is_empty() {
            return Err(ThrottlerError::ValidationError(
                "Bind address cannot be empty".to_string(),
            ));
        }

        // Check if it looks like host:port format
        let port = address.rsplit_once(':').map(|(_, port)| port);
        match port.map(str::parse::<u16>) {
            Some(Ok(_)) => Ok(()),
            _ => Err(ThrottlerError::ValidationError(
                "Bind address must be in host:port format".to_string(),
            )),
        }
    }

    /// Validates rate limit parameters
    pub fn validate_rate_limit(capacity: u64, period: std::time::Duration) -> Result<(), ThrottlerError> {
        if capacity == 0 {
            return Err(ThrottlerError::ValidationError(
                "Rate limit capacity must be greater than 0".to_string(),
            ));
        }

        if period.is_zero() {
            return Err(ThrottlerError::ValidationError(
                "Refill period must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// At least one shard, each endpoint valid. Zero shards is fatal.
    pub fn validate_shards(endpoints: &[String]) -> Result<(), ThrottlerError> {
        if endpoints.is_empty() {
            return Err(ThrottlerError::ConfigurationError(
                "at least one Redis instance must be configured".to_string(),
            ));
        }
        endpoints
            .iter()
            .try_for_each(|endpoint| Self::validate_redis_url(endpoint))
    }

    pub fn validate_config(config: &Config) -> Result<(), ThrottlerError> {
        Self::validate_bind_address(&config.bind_addr)?;
        Self::validate_shards(&config.endpoints())?;
        Self::validate_rate_limit(config.default_capacity, config.default_refill_rate)?;

        for (name, value) in [
            ("remote timeout", config.remote_timeout),
            ("health timeout", config.health_timeout),
            ("key TTL", config.key_ttl),
            ("sweep interval", config.sweep_interval),
        ] {
            if value.is_zero() {
                return Err(ThrottlerError::ValidationError(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if config.cas_retries == 0 {
            return Err(ThrottlerError::ValidationError(
                "CAS retries must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_valid_redis_url() {
        assert!(ConfigValidator::validate_redis_url("redis://localhost:6379").is_ok());
        assert!(ConfigValidator::validate_redis_url("rediss://localhost:6379").is_ok());
        assert!(ConfigValidator::validate_redis_url("10.0.0.5:6380").is_ok());
    }

    #[test]
    fn test_invalid_redis_url() {
        assert!(ConfigValidator::validate_redis_url("").is_err());
        assert!(ConfigValidator::validate_redis_url("http://localhost:6379").is_err());
    }

    #[test]
    fn test_normalize_redis_url() {
        assert_eq!(ConfigValidator::normalize_redis_url("host:6379"), "redis://host:6379");
        assert_eq!(ConfigValidator::normalize_redis_url("rediss://host:6379"), "rediss://host:6379");
    }

    #[test]
    fn test_valid_bind_address() {
        assert!(ConfigValidator::validate_bind_address("127.0.0.1:8080").is_ok());
        assert!(ConfigValidator::validate_bind_address("0.0.0.0:3000").is_ok());
    }

    #[test]
    fn test_invalid_bind_address() {
        assert!(ConfigValidator::validate_bind_address("").is_err());
        assert!(ConfigValidator::validate_bind_address("localhost").is_err());
        assert!(ConfigValidator::validate_bind_address("localhost:http").is_err());
    }

    #[test]
    fn test_invalid_rate_limit() {
        assert!(ConfigValidator::validate_rate_limit(100, Duration::from_secs(1)).is_ok());
        assert!(ConfigValidator::validate_rate_limit(0, Duration::from_secs(1)).is_err());
        assert!(ConfigValidator::validate_rate_limit(100, Duration::ZERO).is_err());
    }

    #[test]
    fn test_zero_shards_is_a_configuration_error() {
        let err = ConfigValidator::validate_shards(&[]).unwrap_err();
        assert!(matches!(err, ThrottlerError::ConfigurationError(_)));
    }

    #[test]
    fn test_validate_config() {
        let mut config = Config::default();
        config.redis_instances = vec!["redis://127.0.0.1:6379".to_string()];
        assert!(ConfigValidator::validate_config(&config).is_ok());

        config.redis_instances = vec![" ".to_string()];
        assert!(ConfigValidator::validate_config(&config).is_err());

        config.redis_instances = vec!["127.0.0.1:6379".to_string()];
        config.cas_retries = 0;
        assert!(ConfigValidator::validate_config(&config).is_err());
    }
}
