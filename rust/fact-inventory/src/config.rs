use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};

/// Database URL scheme that selects the in-process repository.
pub const MEMORY_DATABASE_URL: &str = "memory://";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub database_url: String,
    pub max_pool_size: u32,
    pub pg_ssl_root_cert: Option<String>,
    pub pg_ssl_cert: Option<String>,
    pub pg_ssl_key: Option<String>,
    pub auto_migrate: bool,
    pub limits: SubmissionLimits,
    pub rate_limit: RateLimitConfig,
    pub trust_forwarded_for: bool,
}

/// Size ceilings enforced by the fact validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionLimits {
    pub max_field_bytes: usize,
    pub max_body_bytes: usize,
}

impl Default for SubmissionLimits {
    fn default() -> Self {
        Self {
            max_field_bytes: default_max_field_bytes(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Minimum spacing between accepted submissions from one address.
    pub interval: Duration,
    /// Back-off applied after a failed write so clients cannot hammer a
    /// failing backend.
    pub storage_retry_cooldown: Duration,
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(default_rate_limit_minutes() * 60),
            storage_retry_cooldown: Duration::from_secs(default_retry_cooldown_secs()),
            sweep_interval: Duration::from_secs(default_sweep_interval_secs()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    facts_listen_addr: Option<String>,
    #[serde(default)]
    facts_listen_host: Option<String>,
    #[serde(default)]
    facts_listen_port: Option<u16>,
    #[serde(default)]
    facts_database_url: Option<String>,
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default = "default_pool_size")]
    facts_max_pool_size: u32,
    #[serde(default)]
    pgsslrootcert: Option<String>,
    #[serde(default)]
    pgsslcert: Option<String>,
    #[serde(default)]
    pgsslkey: Option<String>,
    #[serde(default = "default_true")]
    facts_auto_migrate: bool,
    #[serde(default)]
    facts_rate_limit_minutes: Option<u64>,
    #[serde(default)]
    rate_limit_minutes: Option<u64>,
    #[serde(default = "default_max_field_bytes")]
    facts_max_field_bytes: usize,
    #[serde(default = "default_max_body_bytes")]
    facts_max_body_bytes: usize,
    #[serde(default = "default_retry_cooldown_secs")]
    facts_storage_retry_cooldown_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    facts_sweep_interval_secs: u64,
    #[serde(default)]
    facts_trust_forwarded_for: bool,
}

const fn default_pool_size() -> u32 {
    10
}

const fn default_true() -> bool {
    true
}

const fn default_rate_limit_minutes() -> u64 {
    27
}

const fn default_max_field_bytes() -> usize {
    4 * 1024 * 1024
}

const fn default_max_body_bytes() -> usize {
    9 * 1024 * 1024
}

const fn default_retry_cooldown_secs() -> u64 {
    60
}

const fn default_sweep_interval_secs() -> u64 {
    300
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let raw: RawConfig =
            envy::from_env().context("failed to parse FACTS_* environment variables")?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        let listen_addr = resolve_addr(
            raw.facts_listen_addr,
            raw.facts_listen_host,
            raw.facts_listen_port,
        )?;

        let database_url = raw
            .facts_database_url
            .or(raw.database_url)
            .context("FACTS_DATABASE_URL or DATABASE_URL must be set")?;

        let minutes = raw
            .facts_rate_limit_minutes
            .or(raw.rate_limit_minutes)
            .unwrap_or_else(default_rate_limit_minutes);

        let max_body_bytes = raw.facts_max_body_bytes.max(1);
        let limits = SubmissionLimits {
            max_field_bytes: raw.facts_max_field_bytes.clamp(1, max_body_bytes),
            max_body_bytes,
        };

        Ok(Self {
            listen_addr,
            database_url,
            max_pool_size: raw.facts_max_pool_size.max(1),
            pg_ssl_root_cert: raw.pgsslrootcert,
            pg_ssl_cert: raw.pgsslcert,
            pg_ssl_key: raw.pgsslkey,
            auto_migrate: raw.facts_auto_migrate,
            limits,
            rate_limit: RateLimitConfig {
                interval: Duration::from_secs(minutes.saturating_mul(60)),
                storage_retry_cooldown: Duration::from_secs(raw.facts_storage_retry_cooldown_secs),
                sweep_interval: Duration::from_secs(raw.facts_sweep_interval_secs.max(1)),
            },
            trust_forwarded_for: raw.facts_trust_forwarded_for,
        })
    }

    pub fn uses_memory_store(&self) -> bool {
        self.database_url.starts_with(MEMORY_DATABASE_URL)
    }
}

fn resolve_addr(
    addr: Option<String>,
    host: Option<String>,
    port: Option<u16>,
) -> Result<SocketAddr> {
    if let Some(addr) = addr {
        return addr
            .to_socket_addrs()
            .context("invalid FACTS_LISTEN_ADDR value")?
            .next()
            .context("FACTS_LISTEN_ADDR resolved to no addresses");
    }

    let host = host.unwrap_or_else(|| "0.0.0.0".to_string());
    let port = port.unwrap_or(8000);
    let combined = format!("{}:{}", host, port);
    combined
        .to_socket_addrs()
        .context("invalid listen host/port combination")?
        .next()
        .context("listen address resolved to no targets")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(pairs: &[(&str, &str)]) -> RawConfig {
        let vars = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()));
        envy::from_iter(vars).expect("raw config should deserialize")
    }

    #[test]
    fn defaults_follow_service_policy() {
        let config = AppConfig::from_raw(raw(&[("FACTS_DATABASE_URL", "memory://")])).unwrap();

        assert_eq!(config.listen_addr, "0.0.0.0:8000".parse().unwrap());
        assert_eq!(config.rate_limit.interval, Duration::from_secs(27 * 60));
        assert_eq!(config.rate_limit.storage_retry_cooldown, Duration::from_secs(60));
        assert_eq!(config.limits.max_field_bytes, 4 * 1024 * 1024);
        assert_eq!(config.limits.max_body_bytes, 9 * 1024 * 1024);
        assert!(config.auto_migrate);
        assert!(!config.trust_forwarded_for);
        assert!(config.uses_memory_store());
    }

    #[test]
    fn prefixed_rate_limit_wins_over_legacy_name() {
        let config = AppConfig::from_raw(raw(&[
            ("DATABASE_URL", "postgres://facts@db/facts"),
            ("RATE_LIMIT_MINUTES", "5"),
            ("FACTS_RATE_LIMIT_MINUTES", "10"),
        ]))
        .unwrap();
        assert_eq!(config.rate_limit.interval, Duration::from_secs(600));
        assert!(!config.uses_memory_store());

        let legacy = AppConfig::from_raw(raw(&[
            ("DATABASE_URL", "postgres://facts@db/facts"),
            ("RATE_LIMIT_MINUTES", "5"),
        ]))
        .unwrap();
        assert_eq!(legacy.rate_limit.interval, Duration::from_secs(300));
    }

    #[test]
    fn field_ceiling_never_exceeds_body_ceiling() {
        let config = AppConfig::from_raw(raw(&[
            ("FACTS_DATABASE_URL", "memory://"),
            ("FACTS_MAX_FIELD_BYTES", "2048"),
            ("FACTS_MAX_BODY_BYTES", "1024"),
        ]))
        .unwrap();
        assert_eq!(config.limits.max_field_bytes, 1024);
        assert_eq!(config.limits.max_body_bytes, 1024);
    }

    #[test]
    fn listen_host_and_port_combine() {
        let config = AppConfig::from_raw(raw(&[
            ("FACTS_DATABASE_URL", "memory://"),
            ("FACTS_LISTEN_HOST", "127.0.0.1"),
            ("FACTS_LISTEN_PORT", "9100"),
        ]))
        .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9100".parse().unwrap());
    }
}
