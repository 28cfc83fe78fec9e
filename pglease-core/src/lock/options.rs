use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// What `acquire` does when the lock is held by a live lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    /// Give up after one attempt.
    FailFast,
    /// Retry with exponential backoff until `timeout` has elapsed.
    Poll {
        interval: Duration,
        max_interval: Duration,
        timeout: Duration,
    },
}

impl WaitPolicy {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
    pub const DEFAULT_POLL_MAX_INTERVAL: Duration = Duration::from_secs(2);

    /// Poll with the default backoff for up to `timeout`.
    pub fn poll(timeout: Duration) -> Self {
        WaitPolicy::Poll {
            interval: Self::DEFAULT_POLL_INTERVAL,
            max_interval: Self::DEFAULT_POLL_MAX_INTERVAL,
            timeout,
        }
    }
}

/// How `LockHandle::close` picks the record version it releases with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleasePolicy {
    /// Release with the last version this process observed. A heartbeat that
    /// landed on the server without its reply being seen makes the release
    /// fail with `AlreadyReleased`.
    #[default]
    Strict,
    /// Re-read the row first and release with the server's version as long as
    /// the owner token is still ours.
    Resync,
}

impl std::str::FromStr for ReleasePolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "strict" => Ok(ReleasePolicy::Strict),
            "resync" => Ok(ReleasePolicy::Resync),
            other => Err(format!("unknown release policy {other:?} (expected strict|resync)")),
        }
    }
}

/// Per-call knobs for `LockClient::acquire`.
#[derive(Debug, Clone, Default)]
pub struct AcquireOptions {
    pub(crate) wait: Option<WaitPolicy>,
    pub(crate) data: Option<Vec<u8>>,
    pub(crate) lease_duration: Option<Duration>,
    pub(crate) heartbeat_scope: Option<CancellationToken>,
}

impl AcquireOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the client's configured wait policy.
    pub fn wait(mut self, policy: WaitPolicy) -> Self {
        self.wait = Some(policy);
        self
    }

    pub fn fail_fast(self) -> Self {
        self.wait(WaitPolicy::FailFast)
    }

    /// Payload stored in the row on acquisition. Without one, the row keeps
    /// whatever data it already had.
    pub fn data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn lease_duration(mut self, ttl: Duration) -> Self {
        self.lease_duration = Some(ttl);
        self
    }

    /// Cancellation scope for the heartbeat's statements. Cancelling it
    /// abandons an in-flight heartbeat and stops the scheduler; it never
    /// touches the close path.
    pub fn heartbeat_scope(mut self, scope: CancellationToken) -> Self {
        self.heartbeat_scope = Some(scope);
        self
    }
}

/// Exponential backoff with up to 20 % jitter.
pub(crate) struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Self {
            next: initial,
            max: max.max(initial),
        }
    }

    pub(crate) fn next_pause(&mut self) -> Duration {
        let base = self.next;
        self.next = (self.next * 2).min(self.max);
        let jitter = rand::rng().random_range(0.0..=0.2);
        base + base.mul_f64(jitter)
    }
}
