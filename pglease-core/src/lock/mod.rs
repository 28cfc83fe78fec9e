//! Lease-based distributed locks on a PostgreSQL table.
//!
//! A [`LockClient`] owns the storage gateway and hands out [`LockHandle`]s.
//! Each handle keeps its lease alive with a heartbeat task until it is closed.
//! Ownership is decided only by conditional writes on the row's
//! `record_version`, never by local state.

mod handle;
mod heartbeat;
mod lease;
mod options;
mod settings;

pub use handle::LockHandle;
pub use options::{AcquireOptions, ReleasePolicy, WaitPolicy};
pub use settings::LeaseSettings;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::LockError;
use crate::metrics::LockMetrics;
use crate::store::{Gateway, LockRecord, LockStore, Statement};
use crate::trace::StatementTracer;

use handle::{HandleParts, LeaseState};

/// Read-only view of one lock row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockInfo {
    pub name: String,
    pub owner: Option<String>,
    pub record_version: i64,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub data: Option<Vec<u8>>,
    /// Whether the lease had run out when the row was read.
    pub expired: bool,
}

impl LockInfo {
    pub fn is_held(&self) -> bool {
        self.owner.is_some() && !self.expired
    }
}

impl From<LockRecord> for LockInfo {
    fn from(record: LockRecord) -> Self {
        Self {
            name: record.name,
            owner: record.owner_token,
            record_version: record.record_version,
            lease_expires_at: record.lease_expires_at,
            data: record.data,
            expired: record.expired,
        }
    }
}

pub struct LockClient<S: LockStore> {
    gateway: Arc<Gateway<S>>,
    settings: LeaseSettings,
    metrics: LockMetrics,
}

impl<S: LockStore> LockClient<S> {
    pub fn new(store: S, settings: LeaseSettings) -> Result<Self, LockError> {
        settings.validate()?;
        Ok(Self {
            gateway: Arc::new(Gateway::new(store, settings.table_name.clone())),
            settings,
            metrics: LockMetrics::new(),
        })
    }

    pub fn settings(&self) -> &LeaseSettings {
        &self.settings
    }

    pub fn metrics(&self) -> &LockMetrics {
        &self.metrics
    }

    pub fn store(&self) -> &S {
        self.gateway.store()
    }

    pub async fn create_table(&self) -> Result<(), LockError> {
        match self.gateway.run(&Statement::CreateTable).await {
            Ok(_) => {
                info!(table = %self.gateway.table(), "lock table ready");
                Ok(())
            }
            Err(LockError::Storage(err)) if err.is_already_exists() => Ok(()),
            Err(LockError::Storage(err)) => Err(LockError::Schema(err)),
            Err(err) => Err(err),
        }
    }

    pub async fn drop_table(&self) -> Result<(), LockError> {
        match self.gateway.run(&Statement::DropTable).await {
            Ok(_) => Ok(()),
            Err(LockError::Storage(err)) => Err(LockError::Schema(err)),
            Err(err) => Err(err),
        }
    }

    /// Acquire `name` and start heartbeating it.
    pub async fn acquire(
        &self,
        name: &str,
        options: AcquireOptions,
    ) -> Result<LockHandle<S>, LockError> {
        let ttl = options.lease_duration.unwrap_or(self.settings.lease_duration);
        let interval = self.settings.heartbeat_for(ttl)?;
        let wait = options.wait.unwrap_or(self.settings.wait_policy);

        let acquired =
            lease::acquire(&self.gateway, name, ttl, &wait, options.data, &self.metrics).await?;
        let version = acquired.record.record_version;
        info!(
            lock = %name,
            owner = %acquired.owner_token,
            version,
            ttl_ms = ttl.as_millis() as u64,
            "lock acquired"
        );

        Ok(LockHandle::start(HandleParts {
            gateway: self.gateway.clone(),
            state: LeaseState::new(
                name.to_string(),
                acquired.owner_token,
                version,
                acquired.record.data,
            ),
            ttl,
            interval,
            scope: options.heartbeat_scope.unwrap_or_default(),
            release_policy: self.settings.release_policy,
            close_timeout: self.settings.close_timeout,
            metrics: self.metrics.clone(),
        }))
    }

    /// Hold `name` for the duration of `f`. `f` receives the handle's lost
    /// signal. The lock is closed afterwards and a failed close is returned
    /// instead of `f`'s output.
    pub async fn with_lock<F, Fut, T>(
        &self,
        name: &str,
        options: AcquireOptions,
        f: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T>,
    {
        let mut handle = self.acquire(name, options).await?;
        let output = f(handle.lost_signal()).await;
        handle.close().await?;
        Ok(output)
    }

    pub async fn get(&self, name: &str) -> Result<Option<LockInfo>, LockError> {
        Ok(lease::read(&self.gateway, name, None)
            .await?
            .map(LockInfo::from))
    }

    pub async fn get_all(&self) -> Result<Vec<LockInfo>, LockError> {
        let rows = self.gateway.run(&Statement::ReadAll).await?;
        Ok(rows.into_iter().map(LockInfo::from).collect())
    }

    /// Extend a lease by owner token and version, without a handle.
    pub async fn extend(
        &self,
        name: &str,
        owner_token: &str,
        version: i64,
        ttl: Duration,
    ) -> Result<i64, LockError> {
        let record = lease::extend(&self.gateway, name, owner_token, version, ttl, None).await?;
        Ok(record.record_version)
    }

    /// Release a lease by owner token and version, without a handle.
    pub async fn release(
        &self,
        name: &str,
        owner_token: &str,
        version: i64,
    ) -> Result<(), LockError> {
        lease::release(&self.gateway, name, owner_token, version).await?;
        self.metrics.record_release_ok();
        Ok(())
    }
}

impl<S: LockStore + Clone> LockClient<S> {
    /// Route every statement through `tracer`. Handles acquired earlier keep
    /// the previous tracer.
    pub fn with_tracer(self, tracer: Arc<dyn StatementTracer>) -> Self {
        let gateway = Gateway::new(self.gateway.store().clone(), self.gateway.table())
            .with_tracer(tracer);
        Self {
            gateway: Arc::new(gateway),
            ..self
        }
    }
}
