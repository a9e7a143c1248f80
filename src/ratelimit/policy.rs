//! Quota definitions and identity-to-quota matching.
//!
//! A policy table is built once at startup from configuration and is
//! read-only afterwards, so lookups need no synchronization.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

use super::identity::{IdentityKey, IdentityKind};
use crate::error::{Result, TurnstileError};

/// A (capacity, refill rate) pair governing one identity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "QuotaFields")]
pub struct Quota {
    /// Maximum tokens the bucket can hold
    pub capacity: u32,
    /// Tokens added per second
    pub refill_per_sec: f64,
    /// Seconds an identity stays blocked after being denied (0 disables)
    pub block_secs: u64,
}

/// Accepted input shape for a [`Quota`].
///
/// `limit` and `block_duration` are accepted in place of `capacity` and
/// `block_secs`. Without `refill_per_sec` the whole capacity refills each
/// second.
#[derive(Deserialize)]
struct QuotaFields {
    #[serde(alias = "limit")]
    capacity: u32,
    #[serde(default)]
    refill_per_sec: Option<f64>,
    #[serde(default, alias = "block_duration")]
    block_secs: u64,
}

impl From<QuotaFields> for Quota {
    fn from(fields: QuotaFields) -> Self {
        Self {
            capacity: fields.capacity,
            refill_per_sec: fields
                .refill_per_sec
                .unwrap_or(fields.capacity as f64),
            block_secs: fields.block_secs,
        }
    }
}

impl Quota {
    /// A quota of `requests` per second with an equal burst capacity.
    pub fn per_second(requests: u32) -> Self {
        Self {
            capacity: requests,
            refill_per_sec: requests as f64,
            block_secs: 0,
        }
    }

    /// Block the identity for `secs` after it is denied.
    pub fn with_block(mut self, secs: u64) -> Self {
        self.block_secs = secs;
        self
    }

    pub fn block_duration(&self) -> Option<Duration> {
        (self.block_secs > 0).then(|| Duration::from_secs(self.block_secs))
    }

    /// Check `capacity >= 1` and a finite, positive refill rate.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(TurnstileError::Config(
                "quota capacity must be at least 1".to_string(),
            ));
        }
        if !self.refill_per_sec.is_finite() || self.refill_per_sec <= 0.0 {
            return Err(TurnstileError::Config(format!(
                "quota refill rate must be a positive number, got {}",
                self.refill_per_sec
            )));
        }
        Ok(())
    }
}

impl Default for Quota {
    fn default() -> Self {
        Self::per_second(10)
    }
}

/// Maps identities to quotas.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    tokens: HashMap<String, Quota>,
    default: Quota,
    ip_default: Option<Quota>,
}

impl PolicyTable {
    /// Create a table where every identity gets `default`.
    pub fn new(default: Quota) -> Self {
        Self {
            tokens: HashMap::new(),
            default,
            ip_default: None,
        }
    }

    /// Build a validated table from its parts.
    pub fn from_parts(
        default: Quota,
        ip_default: Option<Quota>,
        tokens: HashMap<String, Quota>,
    ) -> Result<Self> {
        default.validate()?;
        if let Some(ref quota) = ip_default {
            quota.validate()?;
        }
        for (token, quota) in &tokens {
            quota.validate().map_err(|e| {
                TurnstileError::Config(format!("invalid quota for token '{}': {}", token, e))
            })?;
        }

        info!(
            tokens = tokens.len(),
            default_capacity = default.capacity,
            default_refill = default.refill_per_sec,
            "Policy table loaded"
        );

        Ok(Self {
            tokens,
            default,
            ip_default,
        })
    }

    /// Add or replace the quota for a token.
    pub fn with_token(mut self, token: impl Into<String>, quota: Quota) -> Self {
        self.tokens.insert(token.into(), quota);
        self
    }

    /// Use `quota` for IP identities instead of the default.
    pub fn with_ip_default(mut self, quota: Quota) -> Self {
        self.ip_default = Some(quota);
        self
    }

    /// Find the quota for an identity.
    ///
    /// Tokens are matched exactly against the table. Anything else falls
    /// back to a default, so lookup never fails.
    pub fn lookup(&self, key: &IdentityKey) -> Quota {
        match key.kind() {
            IdentityKind::Token => self
                .tokens
                .get(key.value())
                .copied()
                .unwrap_or(self.default),
            IdentityKind::Ip => self.ip_default.unwrap_or(self.default),
        }
    }

    pub fn default_quota(&self) -> Quota {
        self.default
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }
}

/// Parse a token table from JSON, e.g.
/// `{"abc123": {"capacity": 100, "refill_per_sec": 100}}` or
/// `{"abc123": {"limit": 100, "block_duration": 60}}`.
pub fn tokens_from_json(json: &str) -> Result<HashMap<String, Quota>> {
    serde_json::from_str(json)
        .map_err(|e| TurnstileError::Config(format!("Failed to parse token limits: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PolicyTable {
        PolicyTable::new(Quota::per_second(50))
            .with_token("abc123", Quota::per_second(100))
            .with_token("def456", Quota::per_second(70))
    }

    #[test]
    fn test_lookup_known_token() {
        let quota = table().lookup(&IdentityKey::token("abc123"));
        assert_eq!(quota.capacity, 100);
        assert_eq!(quota.refill_per_sec, 100.0);
    }

    #[test]
    fn test_lookup_unknown_token_uses_default() {
        let quota = table().lookup(&IdentityKey::token("xyz000"));
        assert_eq!(quota, Quota::per_second(50));
    }

    #[test]
    fn test_lookup_is_exact_match() {
        let table = table();
        assert_eq!(table.lookup(&IdentityKey::token("ABC123")).capacity, 50);
        assert_eq!(table.lookup(&IdentityKey::token("abc1234")).capacity, 50);
    }

    #[test]
    fn test_ip_identity_does_not_match_token_table() {
        let quota = table().lookup(&IdentityKey::ip("abc123"));
        assert_eq!(quota.capacity, 50);
    }

    #[test]
    fn test_ip_default_override() {
        let table = table().with_ip_default(Quota::per_second(20));
        assert_eq!(table.lookup(&IdentityKey::ip("10.0.0.1")).capacity, 20);
        assert_eq!(table.lookup(&IdentityKey::token("ghi789")).capacity, 50);
    }

    #[test]
    fn test_validate_rejects_bad_quotas() {
        let zero_capacity = Quota {
            capacity: 0,
            refill_per_sec: 1.0,
            block_secs: 0,
        };
        assert!(zero_capacity.validate().is_err());

        let zero_rate = Quota {
            capacity: 1,
            refill_per_sec: 0.0,
            block_secs: 0,
        };
        assert!(zero_rate.validate().is_err());

        let nan_rate = Quota {
            capacity: 1,
            refill_per_sec: f64::NAN,
            block_secs: 0,
        };
        assert!(nan_rate.validate().is_err());

        assert!(Quota::per_second(1).validate().is_ok());
    }

    #[test]
    fn test_from_parts_rejects_invalid_token_quota() {
        let mut tokens = HashMap::new();
        tokens.insert(
            "broken".to_string(),
            Quota {
                capacity: 0,
                refill_per_sec: 1.0,
                block_secs: 0,
            },
        );
        let err = PolicyTable::from_parts(Quota::default(), None, tokens).unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_tokens_from_json() {
        let json = r#"{
            "abc123": {"capacity": 100, "refill_per_sec": 100},
            "def456": {"capacity": 70, "refill_per_sec": 70, "block_secs": 5}
        }"#;
        let tokens = tokens_from_json(json).unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens["abc123"], Quota::per_second(100));
        assert_eq!(tokens["def456"].block_duration(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_tokens_from_json_limit_shape() {
        let json = r#"{
            "abc123": {"limit": 100, "block_duration": 60},
            "def456": {"limit": 70}
        }"#;
        let tokens = tokens_from_json(json).unwrap();
        assert_eq!(tokens["abc123"], Quota::per_second(100).with_block(60));
        assert_eq!(tokens["def456"], Quota::per_second(70));
    }

    #[test]
    fn test_tokens_from_json_missing_capacity() {
        let err = tokens_from_json(r#"{"abc123": {"block_duration": 60}}"#).unwrap_err();
        assert!(err.to_string().contains("capacity"));
    }

    #[test]
    fn test_tokens_from_json_malformed() {
        assert!(tokens_from_json("{not json").is_err());
    }
}
