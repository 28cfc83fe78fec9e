pub mod config;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod store;
pub mod trace;

pub use config::LeaseConfig;
pub use error::{LockError, StoreError};
pub use lock::{
    AcquireOptions, LeaseSettings, LockClient, LockHandle, LockInfo, ReleasePolicy, WaitPolicy,
};
pub use metrics::{LockMetrics, MetricsSnapshot};
pub use store::{LockStore, MemoryStore, PgConnectConfig, PostgresStore};
