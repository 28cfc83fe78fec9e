use std::time::Duration;

use anyhow::{bail, ensure, Result};
use pglease_core::{AcquireOptions, LeaseSettings, LockError};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::CliArgs;

const LOCK: &str = "stale_takeover";
const LEASE: Duration = Duration::from_millis(800);

pub async fn run(args: &CliArgs) -> Result<()> {
    info!("scenario: stale takeover");
    let settings = LeaseSettings::default().with_lease_duration(LEASE);
    let stale_client = args.client(settings.clone()).await?;
    let fresh_client = args.client(settings).await?;

    let scope = CancellationToken::new();
    let mut stale = stale_client
        .acquire(LOCK, AcquireOptions::new().heartbeat_scope(scope.clone()))
        .await?;
    // A process that stops heartbeating: its lease runs out on the server.
    scope.cancel();
    tokio::time::sleep(LEASE + Duration::from_millis(200)).await;

    let mut fresh = fresh_client.acquire(LOCK, AcquireOptions::new()).await?;
    ensure!(
        fresh.record_version() > stale.record_version(),
        "takeover must bump the record version"
    );

    match stale.heartbeat().await {
        Err(LockError::NotHeldByCaller { .. }) => {}
        other => bail!("stale heartbeat returned {other:?}"),
    }
    ensure!(stale.is_lost(), "stale handle should know its lease is lost");
    ensure!(stale.lost_signal().is_cancelled(), "lost signal should fire");

    match stale.close().await {
        Err(LockError::AlreadyReleased { .. }) => {}
        other => bail!("closing a lost lease returned {other:?}"),
    }
    let info = fresh_client.get(LOCK).await?;
    ensure!(
        info.and_then(|i| i.owner).as_deref() == Some(fresh.owner_token().as_str()),
        "the stale close must not disturb the new owner"
    );
    fresh.close().await?;
    info!("scenario: stale takeover passed");
    Ok(())
}
