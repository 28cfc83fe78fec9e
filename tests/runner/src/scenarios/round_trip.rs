use anyhow::{bail, ensure, Result};
use pglease_core::{AcquireOptions, LeaseSettings, LockError};
use tracing::info;

use crate::CliArgs;

const LOCK: &str = "round_trip";

pub async fn run(args: &CliArgs) -> Result<()> {
    info!("scenario: round trip");
    let client = args.client(LeaseSettings::default()).await?;

    let mut first = client
        .acquire(LOCK, AcquireOptions::new().data(b"first".to_vec()))
        .await?;
    let Some(info) = client.get(LOCK).await? else {
        bail!("row missing after acquire");
    };
    ensure!(info.is_held(), "row should be held after acquire");
    ensure!(
        info.owner.as_deref() == Some(first.owner_token().as_str()),
        "row owner should be the acquirer"
    );

    match client.acquire(LOCK, AcquireOptions::new().fail_fast()).await {
        Err(LockError::AlreadyHeld { .. }) => {}
        Ok(_) => bail!("second acquire succeeded while the lease was live"),
        Err(err) => return Err(err.into()),
    }

    first.close().await?;
    let info = client.get(LOCK).await?;
    ensure!(
        info.as_ref().is_some_and(|i| !i.is_held()),
        "row should be free after close"
    );
    ensure!(
        info.and_then(|i| i.data).as_deref() == Some(b"first".as_slice()),
        "release keeps the row's data"
    );

    let mut second = client.acquire(LOCK, AcquireOptions::new()).await?;
    second.close().await?;

    match client.release("never_acquired", "nobody", 1).await {
        Err(LockError::AlreadyReleased { .. }) => {}
        other => bail!("release of unknown lock returned {other:?}"),
    }
    info!("scenario: round trip passed");
    Ok(())
}
