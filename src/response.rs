use serde::Serialize;

use crate::rate_limit_config::RateLimitRule;

#[derive(Debug, Serialize)]
pub struct AcquireResponse {
    pub allowed: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl AcquireResponse {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            message: "Request allowed".to_string(),
            retry_after: None,
        }
    }

    pub fn denied(retry_after: u64) -> Self {
        Self {
            allowed: false,
            message: "Rate limit exceeded".to_string(),
            retry_after: Some(retry_after),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RuleResponse {
    pub message: String,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<RateLimitRule>,
}

impl RuleResponse {
    pub fn updated(key: String, rule: RateLimitRule) -> Self {
        Self {
            message: "Rate limit rule updated".to_string(),
            key,
            rule: Some(rule),
        }
    }

    pub fn removed(key: String, rule: Option<RateLimitRule>) -> Self {
        let message = if rule.is_some() {
            "Rate limit rule removed"
        } else {
            "No rule configured for key"
        };
        Self {
            message: message.to_string(),
            key,
            rule,
        }
    }
}
