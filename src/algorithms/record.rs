//! Wire format of a bucket as stored on a shard.

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{Algorithm, BucketState};

/// JSON record kept under `rate_limit:{algorithm}:{key}`.
///
/// Every numeric field is an integer so the Lua side can read it without
/// going through floating point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub algorithm: Algorithm,
    pub capacity: u64,
    pub level: u64,
    pub period_nanos: u64,
    pub anchor_time_nanos: u64,
    pub last_updated_nanos: u64,
}

impl StoredRecord {
    pub fn from_state(state: &BucketState, now_nanos: u64) -> Self {
        Self {
            algorithm: state.algorithm,
            capacity: state.capacity,
            level: state.level,
            period_nanos: state.period_nanos,
            anchor_time_nanos: state.anchor_nanos,
            last_updated_nanos: now_nanos,
        }
    }

    pub fn into_state(self) -> BucketState {
        BucketState {
            algorithm: self.algorithm,
            capacity: self.capacity,
            level: self.level,
            period_nanos: self.period_nanos,
            anchor_nanos: self.anchor_time_nanos,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a stored record, treating anything unusable as absent.
    pub fn decode(raw: &str, expected: Algorithm) -> Option<Self> {
        let record: StoredRecord = match serde_json::from_str(raw) {
            Ok(record) => record,
            Err(e) => {
                warn!(algorithm = %expected, error = %e, "discarding undecodable bucket record");
                return None;
            }
        };

        if record.algorithm != expected
            || record.period_nanos == 0
            || record.capacity == 0
            || record.level > record.capacity
        {
            warn!(algorithm = %expected, ?record, "discarding inconsistent bucket record");
            return None;
        }

        Some(record)
    }
}

/// Shard key for a caller key under one algorithm.
pub fn storage_key(algorithm: Algorithm, key: &str) -> String {
    format!("rate_limit:{}:{}", algorithm.as_str(), key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_keys_are_namespaced_per_algorithm() {
        assert_eq!(storage_key(Algorithm::TokenBucket, "alice"), "rate_limit:token_bucket:alice");
        assert_ne!(
            storage_key(Algorithm::TokenBucket, "alice"),
            storage_key(Algorithm::LeakyBucket, "alice")
        );
    }

    #[test]
    fn test_field_names_match_script() {
        let state = BucketState {
            algorithm: Algorithm::LeakyBucket,
            capacity: 5,
            level: 2,
            period_nanos: 200_000_000,
            anchor_nanos: 1_704_067_200_123_456_789,
        };
        let raw = StoredRecord::from_state(&state, 1_704_067_200_500_000_000)
            .encode()
            .unwrap();
        assert!(raw.contains(r#""algorithm":"leaky_bucket""#));
        assert!(raw.contains(r#""anchor_time_nanos":1704067200123456789"#));
        assert!(raw.contains(r#""last_updated_nanos":1704067200500000000"#));

        let decoded = StoredRecord::decode(&raw, Algorithm::LeakyBucket).unwrap();
        assert_eq!(decoded.into_state(), state);
    }

    #[test]
    fn test_corrupt_records_are_absent() {
        assert!(StoredRecord::decode("not json", Algorithm::TokenBucket).is_none());
        assert!(StoredRecord::decode("{\"level\":3}", Algorithm::TokenBucket).is_none());

        let wrong_algorithm = r#"{"algorithm":"leaky_bucket","capacity":5,"level":1,"period_nanos":10,"anchor_time_nanos":1,"last_updated_nanos":1}"#;
        assert!(StoredRecord::decode(wrong_algorithm, Algorithm::TokenBucket).is_none());

        let overfull = r#"{"algorithm":"token_bucket","capacity":5,"level":6,"period_nanos":10,"anchor_time_nanos":1,"last_updated_nanos":1}"#;
        assert!(StoredRecord::decode(overfull, Algorithm::TokenBucket).is_none());
    }
}
