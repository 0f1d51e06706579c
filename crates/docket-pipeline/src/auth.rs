//! Authorization context implementations.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use tracing::{debug, warn};

use docket_core::defaults::{RATE_LIMIT_PERIOD_SECS, RATE_LIMIT_REQUESTS};
use docket_core::hashing::sha256_hex;
use docket_core::{Action, Authorizer, Credential, Error, Principal, Result};
use docket_core::logging::SUBSYSTEM_PIPELINE;

/// Authorizer for open deployments: every caller is the system principal.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllAuthorizer;

#[async_trait]
impl Authorizer for AllowAllAuthorizer {
    async fn authorize(&self, _credential: &Credential, _action: Action) -> Result<Principal> {
        Ok(Principal::system())
    }
}

#[derive(Debug, Clone)]
struct KeyGrant {
    principal: Principal,
    read_only: bool,
}

/// API-key authorizer with per-bucket rate limiting.
///
/// Keys are held as SHA-256 digests. Each key maps to an identity, a
/// rate-limit bucket, and optionally read-only access.
pub struct ApiKeyAuthorizer {
    keys: HashMap<String, KeyGrant>,
    limiter: DefaultKeyedRateLimiter<String>,
}

impl ApiKeyAuthorizer {
    /// Create an authorizer allowing `requests` per `period` for each bucket.
    pub fn new(requests: u32, period: Duration) -> Result<Self> {
        let burst = NonZeroU32::new(requests)
            .ok_or_else(|| Error::Config("Rate limit must be non-zero".to_string()))?;
        let quota = Quota::with_period(period / burst.get())
            .ok_or_else(|| Error::Config("Rate limit period must be non-zero".to_string()))?
            .allow_burst(burst);
        Ok(Self {
            keys: HashMap::new(),
            limiter: RateLimiter::keyed(quota),
        })
    }

    /// Register a plaintext key.
    pub fn with_key(mut self, key: &str, identity: &str, bucket: &str, read_only: bool) -> Self {
        self.keys.insert(
            sha256_hex(key),
            KeyGrant {
                principal: Principal {
                    identity: identity.to_string(),
                    rate_limit_bucket: bucket.to_string(),
                },
                read_only,
            },
        );
        self
    }

    /// Parse a key list of the form `key:identity:bucket[:read],...`.
    ///
    /// Identity defaults to `key-N` and bucket to the identity.
    pub fn parse_keys(mut self, spec: &str) -> Result<Self> {
        for (idx, entry) in spec.split(',').map(str::trim).filter(|e| !e.is_empty()).enumerate() {
            let mut parts = entry.split(':');
            let key = parts.next().unwrap_or_default();
            if key.is_empty() {
                return Err(Error::Config(format!("API key entry {} has no key", idx)));
            }
            let identity = parts
                .next()
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("key-{}", idx));
            let bucket = parts
                .next()
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| identity.clone());
            let read_only = match parts.next() {
                None | Some("") | Some("write") => false,
                Some("read") => true,
                Some(other) => {
                    return Err(Error::Config(format!("unknown API key scope: {}", other)));
                }
            };
            self = self.with_key(key, &identity, &bucket, read_only);
        }
        Ok(self)
    }

    /// Build from the environment; `None` when `DOCKET_API_KEYS` is unset.
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `DOCKET_API_KEYS` | unset | `key:identity:bucket[:read],...` |
    /// | `RATE_LIMIT_REQUESTS` | `100` | Requests per period per bucket |
    /// | `RATE_LIMIT_PERIOD_SECS` | `60` | Rate-limit period |
    pub fn from_env() -> Result<Option<Self>> {
        let spec = match std::env::var("DOCKET_API_KEYS") {
            Ok(spec) if !spec.trim().is_empty() => spec,
            _ => return Ok(None),
        };
        let requests = std::env::var("RATE_LIMIT_REQUESTS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(RATE_LIMIT_REQUESTS);
        let period = std::env::var("RATE_LIMIT_PERIOD_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(RATE_LIMIT_PERIOD_SECS);
        Self::new(requests, Duration::from_secs(period))?
            .parse_keys(&spec)
            .map(Some)
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }
}

fn is_mutation(action: Action) -> bool {
    !matches!(action, Action::Read)
}

#[async_trait]
impl Authorizer for ApiKeyAuthorizer {
    async fn authorize(&self, credential: &Credential, action: Action) -> Result<Principal> {
        let key = match credential {
            Credential::ApiKey(key) => key,
            Credential::Anonymous => {
                return Err(Error::Unauthorized("API key required".to_string()));
            }
        };

        let grant = self
            .keys
            .get(&sha256_hex(key))
            .ok_or_else(|| Error::Unauthorized("unknown API key".to_string()))?;

        if grant.read_only && is_mutation(action) {
            return Err(Error::Forbidden(format!(
                "{} is read-only",
                grant.principal.identity
            )));
        }

        if self
            .limiter
            .check_key(&grant.principal.rate_limit_bucket)
            .is_err()
        {
            warn!(
                subsystem = SUBSYSTEM_PIPELINE,
                component = "auth",
                bucket = %grant.principal.rate_limit_bucket,
                "Rate limit exceeded"
            );
            return Err(Error::RateLimited(grant.principal.rate_limit_bucket.clone()));
        }

        debug!(identity = %grant.principal.identity, ?action, "Authorized");
        Ok(grant.principal.clone())
    }
}
