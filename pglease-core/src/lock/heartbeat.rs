//! Background lease renewal.
//!
//! One task per held lock. It only ever sees the handle through a `Weak`
//! reference, so a forgotten handle is not kept alive by its own heartbeat.
//! Statements run inside the heartbeat scope, which can be cancelled from
//! outside without involving the close path.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handle::LeaseState;
use super::lease;
use crate::error::LockError;
use crate::metrics::LockMetrics;
use crate::store::{Gateway, LockStore};

/// Result of a heartbeat attempt that did not fail.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Beat {
    Extended(i64),
    /// The handle is gone, closing, closed or has lost its lease.
    Inactive,
}

/// Everything one heartbeat needs, shared by the scheduler and manual beats.
pub(crate) struct BeatContext<S> {
    pub gateway: Arc<Gateway<S>>,
    pub lease: Weak<Mutex<LeaseState>>,
    pub lost: CancellationToken,
    pub ttl: Duration,
    pub metrics: LockMetrics,
}

struct Snapshot {
    name: String,
    owner_token: String,
    version: i64,
    needs_resync: bool,
}

impl<S: LockStore> BeatContext<S> {
    fn with_state<T>(&self, f: impl FnOnce(&mut LeaseState) -> T) -> Option<T> {
        let lease = self.lease.upgrade()?;
        let mut state = lease.lock().unwrap_or_else(PoisonError::into_inner);
        Some(f(&mut state))
    }

    fn snapshot(&self) -> Option<Snapshot> {
        self.with_state(|state| {
            if state.closing || state.closed || state.lost {
                return None;
            }
            Some(Snapshot {
                name: state.name.clone(),
                owner_token: state.owner_token.clone(),
                version: state.version,
                needs_resync: state.needs_resync,
            })
        })
        .flatten()
    }

    fn mark_lost(&self, name: &str, reason: &LockError) {
        self.with_state(|state| state.lost = true);
        self.lost.cancel();
        self.metrics.record_lease_lost();
        warn!(lock = %name, error = %reason, "lease lost");
    }

    fn mark_ambiguous(&self) {
        self.with_state(|state| state.needs_resync = true);
    }

    /// One renewal: resynchronize if the previous beat was ambiguous, then
    /// extend.
    pub(crate) async fn beat_once(
        &self,
        scope: Option<&CancellationToken>,
    ) -> Result<Beat, LockError> {
        let Some(snapshot) = self.snapshot() else {
            return Ok(Beat::Inactive);
        };
        let name = snapshot.name.as_str();
        let owner_token = snapshot.owner_token.as_str();
        let mut version = snapshot.version;

        if snapshot.needs_resync {
            match lease::read(&self.gateway, name, scope).await? {
                Some(current) if current.owner_token.as_deref() == Some(owner_token) => {
                    version = current.record_version;
                    self.with_state(|state| {
                        if !state.closed {
                            state.version = version;
                            state.needs_resync = false;
                        }
                    });
                    self.metrics.record_resync();
                    info!(
                        lock = %name,
                        version,
                        "resynchronized lease version after ambiguous heartbeat"
                    );
                }
                _ => {
                    let err = LockError::NotHeldByCaller {
                        name: name.to_string(),
                    };
                    self.mark_lost(name, &err);
                    return Err(err);
                }
            }
        }

        match lease::extend(&self.gateway, name, owner_token, version, self.ttl, scope).await {
            Ok(record) => {
                let applied = self.with_state(|state| {
                    if state.closed {
                        false
                    } else {
                        state.version = record.record_version;
                        true
                    }
                });
                if applied == Some(true) {
                    self.metrics.record_heartbeat_ok();
                    debug!(lock = %name, version = record.record_version, "lease extended");
                    Ok(Beat::Extended(record.record_version))
                } else {
                    self.metrics.record_heartbeat_late();
                    warn!(
                        lock = %name,
                        version = record.record_version,
                        "heartbeat succeeded after the handle was closed; not applied"
                    );
                    Ok(Beat::Inactive)
                }
            }
            Err(err @ LockError::NotHeldByCaller { .. }) => {
                self.mark_lost(name, &err);
                Err(err)
            }
            Err(err @ LockError::VersionMismatch { .. }) => {
                self.mark_ambiguous();
                self.metrics.record_heartbeat_rejected();
                warn!(
                    lock = %name,
                    error = %err,
                    "heartbeat used a stale version; will resynchronize"
                );
                Err(err)
            }
            Err(err) if err.is_ambiguous() => {
                self.mark_ambiguous();
                self.metrics.record_heartbeat_ambiguous();
                warn!(lock = %name, error = %err, "heartbeat outcome unknown; will resynchronize");
                Err(err)
            }
            Err(err) => Err(err),
        }
    }
}

/// Owner of the scheduler task.
pub(crate) struct Heartbeat {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl Heartbeat {
    pub(crate) fn spawn<S: LockStore>(
        context: BeatContext<S>,
        interval: Duration,
        scope: CancellationToken,
    ) -> Self {
        let stop = CancellationToken::new();
        let task = tokio::spawn(run(context, interval, scope, stop.clone()));
        Self { stop, task }
    }

    /// Stop ticking. An in-flight beat gets `grace` to finish; after that it is
    /// abandoned. Once this returns, the task issues no further statements.
    pub(crate) async fn stop(self, grace: Duration) {
        self.stop.cancel();
        let mut task = self.task;
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "heartbeat still in flight at close; abandoning it"
            );
            task.abort();
            let _ = task.await;
        }
    }

    /// Non-blocking variant for drop paths.
    pub(crate) fn abort(self) {
        self.stop.cancel();
        self.task.abort();
    }
}

async fn run<S: LockStore>(
    context: BeatContext<S>,
    interval: Duration,
    scope: CancellationToken,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = scope.cancelled() => {
                debug!("heartbeat scope cancelled; scheduler stopping");
                break;
            }
            _ = ticker.tick() => {}
        }

        match context.beat_once(Some(&scope)).await {
            Ok(Beat::Extended(_)) => {}
            Ok(Beat::Inactive) => break,
            Err(err) if err.is_lost() => break,
            // Recorded by beat_once; the next tick resynchronizes.
            Err(_) => {}
        }
    }
}
