use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::heartbeat::{Beat, BeatContext, Heartbeat};
use super::lease;
use super::ReleasePolicy;
use crate::error::LockError;
use crate::metrics::LockMetrics;
use crate::store::{Gateway, LockStore};

/// Mutable per-handle state, shared with the heartbeat task.
#[derive(Debug)]
pub(crate) struct LeaseState {
    pub name: String,
    pub owner_token: String,
    /// Last record version this process observed for its own lease.
    pub version: i64,
    pub data: Option<Vec<u8>>,
    /// `close` has started; no new heartbeat may begin.
    pub closing: bool,
    /// No heartbeat outcome may be applied any more.
    pub closed: bool,
    pub lost: bool,
    /// The release has a definite answer; `close` will not try again.
    pub settled: bool,
    /// A heartbeat ended without a known outcome.
    pub needs_resync: bool,
}

impl LeaseState {
    pub(crate) fn new(
        name: String,
        owner_token: String,
        version: i64,
        data: Option<Vec<u8>>,
    ) -> Self {
        Self {
            name,
            owner_token,
            version,
            data,
            closing: false,
            closed: false,
            lost: false,
            settled: false,
            needs_resync: false,
        }
    }
}

/// A held lease. Keeps itself alive with a background heartbeat until
/// [`close`](LockHandle::close) is called or the handle is dropped.
///
/// Dropping a handle that was never closed stops the heartbeat and releases
/// the lock in the background on a best-effort basis.
pub struct LockHandle<S: LockStore> {
    state: Arc<Mutex<LeaseState>>,
    beat: BeatContext<S>,
    heartbeat: Option<Heartbeat>,
    release_policy: ReleasePolicy,
    close_timeout: Duration,
}

impl<S: LockStore> std::fmt::Debug for LockHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("LockHandle")
            .field("name", &state.name)
            .field("owner_token", &state.owner_token)
            .field("record_version", &state.version)
            .field("closed", &state.closed)
            .field("lost", &state.lost)
            .finish()
    }
}

pub(crate) struct HandleParts<S> {
    pub gateway: Arc<Gateway<S>>,
    pub state: LeaseState,
    pub ttl: Duration,
    pub interval: Duration,
    pub scope: CancellationToken,
    pub release_policy: ReleasePolicy,
    pub close_timeout: Duration,
    pub metrics: LockMetrics,
}

impl<S: LockStore> LockHandle<S> {
    pub(crate) fn start(parts: HandleParts<S>) -> Self {
        let state = Arc::new(Mutex::new(parts.state));
        let lost = CancellationToken::new();
        let context = || BeatContext {
            gateway: parts.gateway.clone(),
            lease: Arc::downgrade(&state),
            lost: lost.clone(),
            ttl: parts.ttl,
            metrics: parts.metrics.clone(),
        };
        let heartbeat = Heartbeat::spawn(context(), parts.interval, parts.scope.clone());
        let beat = context();
        Self {
            state,
            beat,
            heartbeat: Some(heartbeat),
            release_policy: parts.release_policy,
            close_timeout: parts.close_timeout,
        }
    }

    fn state(&self) -> MutexGuard<'_, LeaseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> String {
        self.state().name.clone()
    }

    pub fn owner_token(&self) -> String {
        self.state().owner_token.clone()
    }

    /// Last record version observed by this process.
    pub fn record_version(&self) -> i64 {
        self.state().version
    }

    pub fn data(&self) -> Option<Vec<u8>> {
        self.state().data.clone()
    }

    /// `close` reached a definite outcome. Stays false after a close that
    /// failed with the release still open.
    pub fn is_released(&self) -> bool {
        self.state().settled
    }

    /// The lease was taken over by someone else after it expired.
    pub fn is_lost(&self) -> bool {
        self.state().lost
    }

    /// Fires once the lease is lost or the handle is closed. Work guarded by
    /// the lock should stop when it does.
    pub fn lost_signal(&self) -> CancellationToken {
        self.beat.lost.clone()
    }

    /// Extend the lease now, outside the heartbeat schedule. Uses the same
    /// bookkeeping as the scheduler, including resync after an ambiguous beat.
    pub async fn heartbeat(&self) -> Result<i64, LockError> {
        match self.beat.beat_once(None).await? {
            Beat::Extended(version) => Ok(version),
            Beat::Inactive => {
                let state = self.state();
                if state.lost {
                    Err(LockError::NotHeldByCaller {
                        name: state.name.clone(),
                    })
                } else {
                    Err(LockError::AlreadyReleased {
                        name: state.name.clone(),
                    })
                }
            }
        }
    }

    /// Stop the heartbeat and release the lock.
    ///
    /// Under [`ReleasePolicy::Strict`] the release is guarded by the last
    /// version this process saw. If a heartbeat was abandoned after it had
    /// already landed, that version is stale and the result is
    /// [`LockError::AlreadyReleased`] even though the row is still ours until
    /// it expires. [`ReleasePolicy::Resync`] reads the row first and releases
    /// whatever version it holds, as long as the owner token still matches.
    ///
    /// Once the release has a definite outcome, further calls return
    /// `AlreadyReleased` without touching the store. After a storage error or
    /// cancellation the release is still open and the next call retries it.
    pub async fn close(&mut self) -> Result<(), LockError> {
        {
            let mut state = self.state();
            if state.settled {
                return Err(LockError::AlreadyReleased {
                    name: state.name.clone(),
                });
            }
            state.closing = true;
        }

        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop(self.close_timeout).await;
        }

        let (name, owner_token, mut version, lost) = {
            let mut state = self.state();
            state.closed = true;
            (
                state.name.clone(),
                state.owner_token.clone(),
                state.version,
                state.lost,
            )
        };
        self.beat.lost.cancel();

        if lost {
            self.settle();
            self.beat.metrics.record_release_stale();
            warn!(lock = %name, "closing a lease that was already lost");
            return Err(LockError::AlreadyReleased { name });
        }

        if self.release_policy == ReleasePolicy::Resync {
            match lease::read(&self.beat.gateway, &name, None).await? {
                Some(current) if current.owner_token.as_deref() == Some(owner_token.as_str()) => {
                    if current.record_version != version {
                        debug!(
                            lock = %name,
                            local = version,
                            server = current.record_version,
                            "releasing with the server's record version"
                        );
                        self.beat.metrics.record_resync();
                    }
                    version = current.record_version;
                }
                _ => {
                    self.settle();
                    self.beat.metrics.record_release_stale();
                    warn!(lock = %name, "lease no longer owned at close");
                    return Err(LockError::AlreadyReleased { name });
                }
            }
        }

        match lease::release(&self.beat.gateway, &name, &owner_token, version).await {
            Ok(_) => {
                self.settle();
                self.beat.metrics.record_release_ok();
                info!(lock = %name, version, "lock released");
                Ok(())
            }
            Err(err @ LockError::AlreadyReleased { .. }) => {
                self.settle();
                self.beat.metrics.record_release_stale();
                warn!(lock = %name, version, "release found the lease already gone or moved on");
                Err(err)
            }
            Err(err) => {
                warn!(
                    lock = %name,
                    version,
                    error = %err,
                    "release outcome unknown; close may be retried"
                );
                Err(err)
            }
        }
    }

    fn settle(&self) {
        self.state().settled = true;
    }
}

impl<S: LockStore> Drop for LockHandle<S> {
    fn drop(&mut self) {
        let released = {
            let mut state = self.state();
            if state.settled {
                None
            } else {
                state.closing = true;
                state.closed = true;
                state.settled = true;
                (!state.lost).then(|| {
                    (
                        state.name.clone(),
                        state.owner_token.clone(),
                        state.version,
                    )
                })
            }
        };
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        self.beat.lost.cancel();

        let Some((name, owner_token, version)) = released else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(lock = %name, "lock handle dropped outside a runtime; lease will expire");
            return;
        };
        let gateway = self.beat.gateway.clone();
        let metrics = self.beat.metrics.clone();
        runtime.spawn(async move {
            match lease::release(&gateway, &name, &owner_token, version).await {
                Ok(_) => {
                    metrics.record_release_ok();
                    info!(lock = %name, "released lock dropped without close");
                }
                Err(err @ LockError::AlreadyReleased { .. }) => {
                    metrics.record_release_stale();
                    warn!(lock = %name, error = %err, "dropped lock was already released");
                }
                Err(err) => {
                    warn!(
                        lock = %name,
                        error = %err,
                        "background release of dropped lock failed; lease will expire"
                    );
                }
            }
        });
    }
}
