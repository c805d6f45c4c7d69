use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::providers::{ProviderConfig, ProvidersConfig};
use crate::registry::DbConfig;
use crate::scanner::PurgeConfig;

#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    pub interval: Duration,
    /// Time a single pool's provisioning may take.
    pub pool_budget: Duration,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            interval: fleet_reconcile::DEFAULT_PROVISION_INTERVAL,
            pool_budget: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,
    /// `None` runs against the in-memory registry.
    pub database: Option<DbConfig>,
    pub provisioner: ProvisionerConfig,
    pub purge: PurgeConfig,
    /// Base URL of the task queue's pending-count API.
    pub queue_url: Option<String>,
    pub providers: ProvidersConfig,
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(v) => v
            .parse()
            .with_context(|| format!("{name} must be a non-negative integer")),
        Err(_) => Ok(default),
    }
}

fn env_secs(name: &str, default: Duration) -> Result<Duration> {
    env_u64(name, default.as_secs()).map(Duration::from_secs)
}

/// Single static provider named `static`.
fn default_providers() -> ProvidersConfig {
    ProvidersConfig::from([("static".to_string(), ProviderConfig::Static)])
}

fn load_providers() -> Result<ProvidersConfig> {
    if let Ok(path) = std::env::var("FLEET_PROVIDERS_FILE") {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read providers file {path}"))?;
        return parse_providers(&raw).with_context(|| format!("invalid providers file {path}"));
    }
    if let Ok(raw) = std::env::var("FLEET_PROVIDERS") {
        return parse_providers(&raw).context("invalid FLEET_PROVIDERS");
    }
    Ok(default_providers())
}

pub fn parse_providers(raw: &str) -> Result<ProvidersConfig> {
    Ok(serde_json::from_str(raw)?)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("FLEET_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()?;

        let log_level = std::env::var("FLEET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = std::env::var("FLEET_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let provisioner_defaults = ProvisionerConfig::default();
        let purge_defaults = PurgeConfig::default();

        let provisioner = ProvisionerConfig {
            interval: env_secs("FLEET_PROVISION_INTERVAL_SECS", provisioner_defaults.interval)?,
            pool_budget: env_secs("FLEET_POOL_BUDGET_SECS", provisioner_defaults.pool_budget)?,
        };
        let purge = PurgeConfig {
            interval: env_secs("FLEET_PURGE_INTERVAL_SECS", purge_defaults.interval)?,
            stopped_retention: Duration::from_secs(
                env_u64(
                    "FLEET_STOPPED_RETENTION_HOURS",
                    purge_defaults.stopped_retention.as_secs() / 3600,
                )?
                .saturating_mul(3600),
            ),
        };

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            database: DbConfig::from_env(),
            provisioner,
            purge,
            queue_url: std::env::var("FLEET_QUEUE_URL").ok(),
            providers: load_providers()?,
        })
    }
}
