//! Reproduces the cancelled-heartbeat / release race against a live PostgreSQL.
//!
//! The heartbeat's UPDATE is cancelled shortly after it starts. If it reached
//! the server, the record version moved without this process seeing it, and a
//! strict `close` reports the lock as already released.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use pglease_core::store::StatementKind;
use pglease_core::trace::{StatementEnd, StatementStart, StatementTracer};
use pglease_core::{
    AcquireOptions, LeaseConfig, LeaseSettings, LockClient, LockError, PgConnectConfig,
    PostgresStore, ReleasePolicy,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pglease-repro")]
#[command(about = "Cancel a lock heartbeat mid-flight, then release the lock", long_about = None)]
struct Args {
    /// Lock to acquire
    #[arg(long, default_value = "test")]
    lock_name: String,

    /// How long to hold the lock before closing it
    #[arg(long, default_value_t = 500)]
    hold_ms: u64,

    /// Delay between a heartbeat UPDATE starting and its cancellation
    #[arg(long, default_value_t = 10)]
    cancel_after_ms: u64,

    /// Heartbeat period; must fire at least once while the lock is held
    #[arg(long, default_value_t = 100)]
    heartbeat_ms: u64,

    /// strict or resync (defaults to PGLEASE_RELEASE_POLICY)
    #[arg(long)]
    release_policy: Option<ReleasePolicy>,
}

/// Cancels the heartbeat scope a fixed delay after a heartbeat starts.
struct CancelHeartbeat {
    scope: CancellationToken,
    delay: Duration,
}

impl StatementTracer for CancelHeartbeat {
    fn statement_start(&self, event: &StatementStart<'_>) {
        debug!(kind = %event.kind, sql = %event.sql, "statement start");
        if event.kind != StatementKind::Heartbeat {
            return;
        }
        let scope = self.scope.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            info!(delay_ms = delay.as_millis() as u64, "cancelling heartbeat scope");
            scope.cancel();
        });
    }

    fn statement_end(&self, event: &StatementEnd<'_>) {
        debug!(
            kind = %event.kind,
            elapsed_ms = event.elapsed.as_millis() as u64,
            "statement end"
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = LeaseConfig::load().context("failed to load configuration")?;
    init_tracing(&config);

    let settings = LeaseSettings::from_config(&config)
        .with_heartbeat_interval(Duration::from_millis(args.heartbeat_ms))
        .with_release_policy(args.release_policy.unwrap_or(config.release_policy));
    info!(?settings, "repro settings");

    let store = PostgresStore::connect(&PgConnectConfig::resolve(config.database_url.as_deref()))
        .await
        .context("failed to connect to postgres")?;

    let scope = CancellationToken::new();
    let tracer = Arc::new(CancelHeartbeat {
        scope: scope.clone(),
        delay: Duration::from_millis(args.cancel_after_ms),
    });
    let client = LockClient::new(store, settings)?.with_tracer(tracer);

    if let Err(err) = client.drop_table().await {
        debug!(error = %err, "drop table failed; continuing");
    }
    client
        .create_table()
        .await
        .context("failed to create lock table")?;

    let mut handle = client
        .acquire(&args.lock_name, AcquireOptions::new().heartbeat_scope(scope))
        .await
        .with_context(|| format!("failed to acquire {:?}", args.lock_name))?;
    info!(lock = %args.lock_name, owner = %handle.owner_token(), "locked");

    tokio::time::sleep(Duration::from_millis(args.hold_ms)).await;

    match handle.close().await {
        Ok(()) => println!("OK: unlocked ok"),
        Err(LockError::AlreadyReleased { .. }) => println!("!!! unlocked already released"),
        Err(err) => println!("!!! unlocked other error: {err}"),
    }
    info!(metrics = ?client.metrics().snapshot(), "done");
    Ok(())
}

fn init_tracing(config: &LeaseConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pglease_core=debug"));

    if config.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_line_number(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .compact()
            .with_env_filter(filter)
            .with_target(false)
            .with_line_number(true)
            .init();
    }
}
