//! Acquire / extend / release transitions of one lock row.
//!
//! Every transition is a single conditional write; the row's
//! `record_version` decides who moved first. Nothing here retries on a lost
//! guard except `acquire`, and only as far as its wait policy allows.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::options::{Backoff, WaitPolicy};
use crate::error::LockError;
use crate::metrics::LockMetrics;
use crate::store::{Gateway, LockRecord, LockStore, Statement};

enum Attempt {
    Acquired(LockRecord),
    /// Live foreign lease, or another acquirer won the conditional write.
    Held { owner: Option<String> },
}

/// A freshly minted lease.
pub(crate) struct Acquired {
    pub owner_token: String,
    pub record: LockRecord,
}

pub(crate) async fn acquire<S: LockStore>(
    gateway: &Gateway<S>,
    name: &str,
    ttl: Duration,
    wait: &WaitPolicy,
    data: Option<Vec<u8>>,
    metrics: &LockMetrics,
) -> Result<Acquired, LockError> {
    let owner_token = Uuid::new_v4().to_string();
    let (deadline, mut backoff) = match *wait {
        WaitPolicy::FailFast => (None, None),
        WaitPolicy::Poll {
            interval,
            max_interval,
            timeout,
        } => (
            Some(Instant::now() + timeout),
            Some(Backoff::new(interval, max_interval)),
        ),
    };

    loop {
        let owner = match try_acquire(gateway, name, &owner_token, ttl, data.clone()).await? {
            Attempt::Acquired(record) => {
                metrics.record_acquisition();
                return Ok(Acquired {
                    owner_token,
                    record,
                });
            }
            Attempt::Held { owner } => owner,
        };
        metrics.record_acquire_conflict();

        let (Some(deadline), Some(backoff)) = (deadline, backoff.as_mut()) else {
            return Err(LockError::AlreadyHeld {
                name: name.to_string(),
                owner,
            });
        };
        let now = Instant::now();
        if now >= deadline {
            return Err(LockError::AlreadyHeld {
                name: name.to_string(),
                owner,
            });
        }
        let pause = backoff.next_pause().min(deadline - now);
        debug!(
            lock = %name,
            holder = owner.as_deref().unwrap_or("unknown"),
            pause_ms = pause.as_millis() as u64,
            "lock is held, retrying"
        );
        tokio::time::sleep(pause).await;
    }
}

async fn try_acquire<S: LockStore>(
    gateway: &Gateway<S>,
    name: &str,
    owner_token: &str,
    ttl: Duration,
    data: Option<Vec<u8>>,
) -> Result<Attempt, LockError> {
    let statement = match read(gateway, name, None).await? {
        None => Statement::Insert {
            name: name.to_string(),
            owner: owner_token.to_string(),
            ttl,
            data,
        },
        Some(current) if current.is_claimable() => {
            if let Some(previous) = current.owner_token.as_deref() {
                debug!(lock = %name, previous_owner = %previous, "taking over expired lease");
            }
            Statement::Claim {
                name: name.to_string(),
                owner: owner_token.to_string(),
                expected_version: current.record_version,
                ttl,
                data,
            }
        }
        Some(current) => {
            return Ok(Attempt::Held {
                owner: current.owner_token,
            })
        }
    };

    match first(gateway.run(&statement).await?) {
        Some(record) => Ok(Attempt::Acquired(record)),
        None => Ok(Attempt::Held { owner: None }),
    }
}

/// Push the lease of `owner_token` forward. Returns the row as written.
pub(crate) async fn extend<S: LockStore>(
    gateway: &Gateway<S>,
    name: &str,
    owner_token: &str,
    version: i64,
    ttl: Duration,
    scope: Option<&CancellationToken>,
) -> Result<LockRecord, LockError> {
    let statement = Statement::Heartbeat {
        name: name.to_string(),
        owner: owner_token.to_string(),
        expected_version: version,
        ttl,
    };
    if let Some(record) = first(gateway.run_in_scope(&statement, scope).await?) {
        return Ok(record);
    }

    // The guard missed; look at the row only to say why.
    match read(gateway, name, scope).await? {
        Some(current) if current.owner_token.as_deref() == Some(owner_token) => {
            Err(LockError::VersionMismatch {
                name: name.to_string(),
                expected: version,
                actual: current.record_version,
            })
        }
        _ => Err(LockError::NotHeldByCaller {
            name: name.to_string(),
        }),
    }
}

/// Free the row if it is still at `version` under `owner_token`.
pub(crate) async fn release<S: LockStore>(
    gateway: &Gateway<S>,
    name: &str,
    owner_token: &str,
    version: i64,
) -> Result<LockRecord, LockError> {
    let statement = Statement::Release {
        name: name.to_string(),
        owner: owner_token.to_string(),
        expected_version: version,
    };
    first(gateway.run(&statement).await?).ok_or_else(|| LockError::AlreadyReleased {
        name: name.to_string(),
    })
}

pub(crate) async fn read<S: LockStore>(
    gateway: &Gateway<S>,
    name: &str,
    scope: Option<&CancellationToken>,
) -> Result<Option<LockRecord>, LockError> {
    let statement = Statement::Read {
        name: name.to_string(),
    };
    Ok(first(gateway.run_in_scope(&statement, scope).await?))
}

fn first(rows: Vec<LockRecord>) -> Option<LockRecord> {
    rows.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StatementKind};

    const TTL: Duration = Duration::from_secs(10);

    async fn gateway() -> Result<Gateway<MemoryStore>, LockError> {
        let gateway = Gateway::new(MemoryStore::new(), "locks");
        gateway.run(&Statement::CreateTable).await?;
        Ok(gateway)
    }

    #[tokio::test]
    async fn first_acquire_inserts_version_one() -> Result<(), LockError> {
        let gateway = gateway().await?;
        let metrics = LockMetrics::new();
        let acquired = acquire(&gateway, "a", TTL, &WaitPolicy::FailFast, None, &metrics).await?;
        assert_eq!(acquired.record.record_version, 1);
        assert_eq!(
            acquired.record.owner_token.as_deref(),
            Some(acquired.owner_token.as_str())
        );
        assert_eq!(gateway.store().executed(StatementKind::Insert), 1);
        assert_eq!(metrics.snapshot().acquisitions, 1);
        Ok(())
    }

    #[tokio::test]
    async fn live_lease_fails_fast_with_holder() -> Result<(), LockError> {
        let gateway = gateway().await?;
        let metrics = LockMetrics::new();
        let first = acquire(&gateway, "a", TTL, &WaitPolicy::FailFast, None, &metrics).await?;

        let err = acquire(&gateway, "a", TTL, &WaitPolicy::FailFast, None, &metrics)
            .await
            .err();
        match err {
            Some(LockError::AlreadyHeld { owner, .. }) => {
                assert_eq!(owner, Some(first.owner_token))
            }
            other => panic!("expected AlreadyHeld, got {other:?}"),
        }
        assert_eq!(metrics.snapshot().acquire_conflicts, 1);
        Ok(())
    }

    #[tokio::test]
    async fn expired_lease_is_claimed_with_next_version() -> Result<(), LockError> {
        let gateway = gateway().await?;
        let metrics = LockMetrics::new();
        let first = acquire(&gateway, "a", TTL, &WaitPolicy::FailFast, None, &metrics).await?;
        gateway.store().expire("locks", "a");

        let second = acquire(&gateway, "a", TTL, &WaitPolicy::FailFast, None, &metrics).await?;
        assert_ne!(first.owner_token, second.owner_token);
        assert_eq!(second.record.record_version, 2);

        // The old owner has been fenced off.
        let err = extend(&gateway, "a", &first.owner_token, 1, TTL, None)
            .await
            .err();
        assert!(matches!(err, Some(LockError::NotHeldByCaller { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn extend_then_release_with_returned_version() -> Result<(), LockError> {
        let gateway = gateway().await?;
        let metrics = LockMetrics::new();
        let lease = acquire(&gateway, "a", TTL, &WaitPolicy::FailFast, None, &metrics).await?;

        let extended = extend(&gateway, "a", &lease.owner_token, 1, TTL, None).await?;
        assert_eq!(extended.record_version, 2);

        let released = release(&gateway, "a", &lease.owner_token, 2).await?;
        assert_eq!(released.owner_token, None);
        assert_eq!(released.record_version, 3);
        Ok(())
    }

    #[tokio::test]
    async fn stale_version_is_a_mismatch_not_a_loss() -> Result<(), LockError> {
        let gateway = gateway().await?;
        let metrics = LockMetrics::new();
        let lease = acquire(&gateway, "a", TTL, &WaitPolicy::FailFast, None, &metrics).await?;
        extend(&gateway, "a", &lease.owner_token, 1, TTL, None).await?;

        match extend(&gateway, "a", &lease.owner_token, 1, TTL, None).await {
            Err(LockError::VersionMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, 1);
                assert_eq!(actual, 2);
            }
            other => panic!("expected VersionMismatch, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn release_of_unknown_name_is_already_released() -> Result<(), LockError> {
        let gateway = gateway().await?;
        let err = release(&gateway, "never", "nobody", 1).await.err();
        assert!(matches!(err, Some(LockError::AlreadyReleased { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn poll_policy_gives_up_at_the_deadline() -> Result<(), LockError> {
        let gateway = gateway().await?;
        let metrics = LockMetrics::new();
        acquire(&gateway, "a", TTL, &WaitPolicy::FailFast, None, &metrics).await?;

        let policy = WaitPolicy::Poll {
            interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(20),
            timeout: Duration::from_millis(80),
        };
        let started = std::time::Instant::now();
        let err = acquire(&gateway, "a", TTL, &policy, None, &metrics).await.err();
        assert!(matches!(err, Some(LockError::AlreadyHeld { .. })));
        assert!(started.elapsed() >= Duration::from_millis(80));
        assert!(metrics.snapshot().acquire_conflicts >= 2);
        Ok(())
    }

    #[tokio::test]
    async fn poll_policy_wins_once_the_lease_expires() -> Result<(), LockError> {
        let gateway = gateway().await?;
        let metrics = LockMetrics::new();
        acquire(
            &gateway,
            "a",
            Duration::from_millis(100),
            &WaitPolicy::FailFast,
            None,
            &metrics,
        )
        .await?;

        let acquired = acquire(
            &gateway,
            "a",
            TTL,
            &WaitPolicy::poll(Duration::from_secs(2)),
            None,
            &metrics,
        )
        .await?;
        assert_eq!(acquired.record.record_version, 2);
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_scope_abandons_the_heartbeat() -> Result<(), LockError> {
        let gateway = gateway().await?;
        let metrics = LockMetrics::new();
        let lease = acquire(&gateway, "a", TTL, &WaitPolicy::FailFast, None, &metrics).await?;

        let scope = CancellationToken::new();
        scope.cancel();
        let err = extend(&gateway, "a", &lease.owner_token, 1, TTL, Some(&scope))
            .await
            .err();
        assert!(matches!(err, Some(LockError::Cancelled { .. })));
        Ok(())
    }
}
