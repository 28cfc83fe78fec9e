use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, ensure, Result};
use pglease_core::store::StatementKind;
use pglease_core::trace::{StatementEnd, StatementStart, StatementTracer};
use pglease_core::{AcquireOptions, LeaseSettings, LockError, ReleasePolicy, WaitPolicy};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::CliArgs;

const LOCK: &str = "cancelled_heartbeat";
const LEASE: Duration = Duration::from_secs(2);
const ROUNDS: usize = 5;

/// Cancels the heartbeat scope right after the first heartbeat is issued.
struct CancelFirstHeartbeat {
    scope: CancellationToken,
    started: AtomicUsize,
}

impl StatementTracer for CancelFirstHeartbeat {
    fn statement_start(&self, event: &StatementStart<'_>) {
        if event.kind == StatementKind::Heartbeat
            && self.started.fetch_add(1, Ordering::SeqCst) == 0
        {
            let scope = self.scope.clone();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                scope.cancel();
            });
        }
    }

    fn statement_end(&self, _event: &StatementEnd<'_>) {}
}

pub async fn run(args: &CliArgs) -> Result<()> {
    info!("scenario: cancelled heartbeat then close");
    for policy in [ReleasePolicy::Strict, ReleasePolicy::Resync] {
        let mut tally = [0usize; 2];
        for _ in 0..ROUNDS {
            if round(args, policy).await? {
                tally[0] += 1;
            } else {
                tally[1] += 1;
            }
        }
        info!(
            ?policy,
            released = tally[0],
            already_released = tally[1],
            "cancelled heartbeat outcomes"
        );
        if policy == ReleasePolicy::Resync {
            ensure!(
                tally[1] == 0,
                "resync close must release a lease it still owns"
            );
        }
    }
    info!("scenario: cancelled heartbeat passed");
    Ok(())
}

/// One acquire / cancelled beat / close cycle. Returns whether `close`
/// released the row.
async fn round(args: &CliArgs, policy: ReleasePolicy) -> Result<bool> {
    let scope = CancellationToken::new();
    let tracer = Arc::new(CancelFirstHeartbeat {
        scope: scope.clone(),
        started: AtomicUsize::new(0),
    });
    let settings = LeaseSettings::default()
        .with_lease_duration(LEASE)
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_release_policy(policy);
    let client = args.client(settings).await?.with_tracer(tracer);

    let mut handle = client
        .acquire(
            LOCK,
            AcquireOptions::new()
                .heartbeat_scope(scope.clone())
                .wait(WaitPolicy::poll(LEASE * 2)),
        )
        .await?;
    tokio::time::timeout(Duration::from_secs(2), scope.cancelled()).await?;

    let released = match handle.close().await {
        Ok(()) => true,
        Err(LockError::AlreadyReleased { .. }) => {
            warn!(?policy, "close reported already released");
            false
        }
        Err(err) => bail!("close failed with {err}"),
    };

    // Whatever close said, nobody else may own the row now.
    let owner = client.get(LOCK).await?.and_then(|info| info.owner);
    if released {
        ensure!(owner.is_none(), "released row still has owner {owner:?}");
    } else {
        ensure!(
            owner.is_none() || owner.as_deref() == Some(handle.owner_token().as_str()),
            "row moved to a foreign owner {owner:?}"
        );
    }
    Ok(released)
}
