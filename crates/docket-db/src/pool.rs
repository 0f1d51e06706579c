//! Postgres connection pool: configuration, creation, and status.

use std::time::{Duration, Instant};

use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, warn};

use docket_core::defaults::{
    DB_ACQUIRE_TIMEOUT_SECS, DB_IDLE_TIMEOUT_SECS, DB_MAX_CONNECTIONS, DB_MAX_LIFETIME_SECS,
    DB_MIN_CONNECTIONS,
};
use docket_core::logging::SUBSYSTEM_DB;
use docket_core::{Error, Result};

/// Sizing and connection-lifetime limits of the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    /// How long `acquire` waits before giving up.
    pub acquire_timeout: Duration,
    /// Idle connections above `min_connections` are closed after this long.
    pub idle_timeout: Duration,
    /// Connections are recycled after this long; `None` keeps them forever.
    pub max_lifetime: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DB_MAX_CONNECTIONS,
            min_connections: DB_MIN_CONNECTIONS,
            acquire_timeout: Duration::from_secs(DB_ACQUIRE_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(DB_IDLE_TIMEOUT_SECS),
            max_lifetime: Some(Duration::from_secs(DB_MAX_LIFETIME_SECS)),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// | Variable | Default |
    /// |----------|---------|
    /// | `DATABASE_MAX_CONNECTIONS` | 10 |
    /// | `DATABASE_MIN_CONNECTIONS` | 1 |
    /// | `DATABASE_ACQUIRE_TIMEOUT_SECS` | 30 |
    /// | `DATABASE_IDLE_TIMEOUT_SECS` | 600 |
    /// | `DATABASE_MAX_LIFETIME_SECS` | 1800, `0` disables recycling |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let max_lifetime = match env_parse::<u64>("DATABASE_MAX_LIFETIME_SECS") {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.max_lifetime,
        };
        Self {
            max_connections: env_parse("DATABASE_MAX_CONNECTIONS")
                .unwrap_or(defaults.max_connections)
                .max(1),
            min_connections: env_parse("DATABASE_MIN_CONNECTIONS").unwrap_or(defaults.min_connections),
            acquire_timeout: env_parse("DATABASE_ACQUIRE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.acquire_timeout),
            idle_timeout: env_parse("DATABASE_IDLE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
            max_lifetime,
        }
        .clamped()
    }

    pub fn with_max_connections(mut self, n: u32) -> Self {
        self.max_connections = n.max(1);
        self.clamped()
    }

    pub fn with_min_connections(mut self, n: u32) -> Self {
        self.min_connections = n;
        self.clamped()
    }

    pub fn with_max_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    /// The floor never exceeds the ceiling.
    fn clamped(mut self) -> Self {
        self.min_connections = self.min_connections.min(self.max_connections);
        self
    }

    fn options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .acquire_timeout(self.acquire_timeout)
            .idle_timeout(self.idle_timeout)
            .max_lifetime(self.max_lifetime)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Pool with the default configuration.
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    create_pool_with_config(database_url, PoolConfig::default()).await
}

/// Connect and wait for the first connection.
pub async fn create_pool_with_config(database_url: &str, config: PoolConfig) -> Result<PgPool> {
    let start = Instant::now();
    let pool = config
        .options()
        .connect(database_url)
        .await
        .map_err(Error::Database)?;
    info!(
        subsystem = SUBSYSTEM_DB,
        component = "pool",
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        pool_size = pool.size(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Connected to PostgreSQL"
    );
    Ok(pool)
}

/// Snapshot of pool occupancy, reported by the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Open connections, idle or in use.
    pub size: u32,
    pub idle: usize,
    pub max_connections: u32,
}

impl PoolStatus {
    pub fn of(pool: &PgPool) -> Self {
        Self {
            size: pool.size(),
            idle: pool.num_idle(),
            max_connections: pool.options().get_max_connections(),
        }
    }

    pub fn in_use(&self) -> u32 {
        self.size.saturating_sub(self.idle as u32)
    }

    /// Every allowed connection is open and busy; callers queue on `acquire`.
    pub fn saturated(&self) -> bool {
        self.idle == 0 && self.size >= self.max_connections
    }

    /// Log the snapshot, warning when the pool is saturated.
    pub fn log(&self) {
        if self.saturated() {
            warn!(
                subsystem = SUBSYSTEM_DB,
                component = "pool",
                pool_size = self.size,
                "Connection pool saturated"
            );
        } else {
            debug!(
                subsystem = SUBSYSTEM_DB,
                component = "pool",
                pool_size = self.size,
                pool_idle = self.idle,
                "Connection pool status"
            );
        }
    }
}
