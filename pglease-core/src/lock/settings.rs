use std::time::Duration;

use crate::config::{validate_table_name, LeaseConfig};
use crate::error::LockError;

use super::{ReleasePolicy, WaitPolicy};

/// Normalized settings consumed by [`LockClient`](super::LockClient).
#[derive(Debug, Clone)]
pub struct LeaseSettings {
    pub table_name: String,
    pub lease_duration: Duration,
    /// `None` derives the interval from the lease duration.
    pub heartbeat_interval: Option<Duration>,
    pub wait_policy: WaitPolicy,
    pub close_timeout: Duration,
    pub release_policy: ReleasePolicy,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self::from_config(&LeaseConfig::default())
    }
}

impl LeaseSettings {
    pub fn from_config(config: &LeaseConfig) -> Self {
        let wait_policy = match config.acquire_timeout_ms {
            Some(timeout) => WaitPolicy::Poll {
                interval: Duration::from_millis(config.retry_interval_ms),
                max_interval: Duration::from_millis(config.retry_max_interval_ms),
                timeout: Duration::from_millis(timeout),
            },
            None => WaitPolicy::FailFast,
        };
        Self {
            table_name: config.table_name.clone(),
            lease_duration: Duration::from_millis(config.lease_duration_ms),
            heartbeat_interval: config.heartbeat_interval_ms.map(Duration::from_millis),
            wait_policy,
            close_timeout: Duration::from_millis(config.close_timeout_ms),
            release_policy: config.release_policy,
        }
    }

    pub fn with_table(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    pub fn with_lease_duration(mut self, ttl: Duration) -> Self {
        self.lease_duration = ttl;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn with_wait_policy(mut self, policy: WaitPolicy) -> Self {
        self.wait_policy = policy;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn with_release_policy(mut self, policy: ReleasePolicy) -> Self {
        self.release_policy = policy;
        self
    }

    /// Heartbeat period for a lease of `ttl`.
    pub fn heartbeat_for(&self, ttl: Duration) -> Result<Duration, LockError> {
        let interval = self.heartbeat_interval.unwrap_or(ttl / 3);
        if interval.is_zero() || interval >= ttl {
            return Err(LockError::InvalidConfig(format!(
                "heartbeat interval {interval:?} must be non-zero and shorter than the lease {ttl:?}"
            )));
        }
        Ok(interval)
    }

    pub fn validate(&self) -> Result<(), LockError> {
        validate_table_name(&self.table_name)
            .map_err(|e| LockError::InvalidConfig(e.to_string()))?;
        self.heartbeat_for(self.lease_duration)?;
        if let WaitPolicy::Poll { interval, .. } = self.wait_policy {
            if interval.is_zero() {
                return Err(LockError::InvalidConfig(
                    "poll interval must be non-zero".to_string(),
                ));
            }
        }
        Ok(())
    }
}
