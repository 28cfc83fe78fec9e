use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::lock::ReleasePolicy;

/// Raw configuration, layered from defaults and `PGLEASE_*` environment
/// variables.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LeaseConfig {
    /// Name of the lock table.
    pub table_name: String,
    /// How long an acquired lease stays valid without a heartbeat.
    pub lease_duration_ms: u64,
    /// Heartbeat period. Defaults to a third of the lease duration.
    pub heartbeat_interval_ms: Option<u64>,
    /// How long `acquire` keeps polling a held lock. Unset means fail fast.
    pub acquire_timeout_ms: Option<u64>,
    /// First pause between acquire attempts.
    pub retry_interval_ms: u64,
    /// Upper bound of the acquire backoff.
    pub retry_max_interval_ms: u64,
    /// How long `close` waits for an in-flight heartbeat before abandoning it.
    pub close_timeout_ms: u64,
    /// `strict` or `resync`.
    pub release_policy: ReleasePolicy,
    /// Connection string or URL. Unset means the libpq `PG*` variables.
    pub database_url: Option<String>,
    /// Log format: "compact" or "json".
    pub log_format: String,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            table_name: "locks".to_string(),
            lease_duration_ms: 20_000,
            heartbeat_interval_ms: None,
            acquire_timeout_ms: None,
            retry_interval_ms: 100,
            retry_max_interval_ms: 2_000,
            close_timeout_ms: 1_000,
            release_policy: ReleasePolicy::Strict,
            database_url: None,
            log_format: "compact".to_string(),
        }
    }
}

impl LeaseConfig {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(config::Environment::with_prefix("PGLEASE"))
    }

    fn load_from(environment: config::Environment) -> anyhow::Result<Self> {
        let defaults_json = serde_json::to_string(&Self::default())
            .with_context(|| "failed to serialize defaults")?;
        let settings = config::Config::builder()
            .add_source(
                config::File::from_str(&defaults_json, config::FileFormat::Json).required(false),
            )
            .add_source(environment)
            .build()
            .with_context(|| "failed to load configuration")?;
        let cfg: LeaseConfig = settings
            .try_deserialize()
            .with_context(|| "failed to deserialize configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        validate_table_name(&self.table_name)?;
        if self.lease_duration_ms == 0 {
            bail!("lease_duration_ms must be greater than zero");
        }
        if let Some(interval) = self.heartbeat_interval_ms {
            if interval == 0 || interval >= self.lease_duration_ms {
                bail!(
                    "heartbeat_interval_ms ({interval}) must be between 1 and lease_duration_ms ({})",
                    self.lease_duration_ms
                );
            }
        }
        if self.lease_duration_ms < 3 && self.heartbeat_interval_ms.is_none() {
            bail!("lease_duration_ms is too short to derive a heartbeat interval");
        }
        if self.retry_interval_ms == 0 {
            bail!("retry_interval_ms must be greater than zero");
        }
        if !matches!(self.log_format.as_str(), "compact" | "json") {
            bail!("log_format must be \"compact\" or \"json\"");
        }
        Ok(())
    }
}

/// Lock table names are plain, unqualified identifiers.
pub fn validate_table_name(name: &str) -> anyhow::Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !valid_start
        || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        || name.len() > 63
    {
        bail!("invalid lock table name {name:?}");
    }
    Ok(())
}
