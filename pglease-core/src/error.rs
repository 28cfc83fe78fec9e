use thiserror::Error;

/// Failures raised by a [`LockStore`](crate::store::LockStore) while running a statement.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    #[error("failed to connect to postgres: {0}")]
    Connect(String),
    #[error("table {0:?} does not exist")]
    MissingTable(String),
    #[error("failed to decode lock row: {0}")]
    Decode(String),
    #[error("injected fault: {0}")]
    Injected(String),
}

impl StoreError {
    /// True when the failure means "the table is already there", which
    /// `CREATE TABLE IF NOT EXISTS` can still report when two creators race.
    pub fn is_already_exists(&self) -> bool {
        use tokio_postgres::error::SqlState;

        match self {
            StoreError::Postgres(err) => matches!(
                err.code(),
                Some(code) if *code == SqlState::DUPLICATE_TABLE
                    || *code == SqlState::DUPLICATE_OBJECT
                    || *code == SqlState::UNIQUE_VIOLATION
            ),
            _ => false,
        }
    }
}

/// Outcome taxonomy of the lock protocol.
///
/// `Cancelled` and `Storage` are ambiguous: the statement may or may not have
/// landed on the server. Everything else is a definite answer from the row.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock table setup failed: {0}")]
    Schema(#[source] StoreError),
    #[error("lock {name:?} is already held{}", held_by(.owner))]
    AlreadyHeld { name: String, owner: Option<String> },
    #[error("lock {name:?} is not held by the caller")]
    NotHeldByCaller { name: String },
    #[error("lock {name:?} is at record version {actual}, expected {expected}")]
    VersionMismatch {
        name: String,
        expected: i64,
        actual: i64,
    },
    #[error("lock {name:?} was already released")]
    AlreadyReleased { name: String },
    #[error("statement on lock {name:?} was cancelled before its outcome was observed")]
    Cancelled { name: String },
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("invalid lock configuration: {0}")]
    InvalidConfig(String),
}

fn held_by(owner: &Option<String>) -> String {
    owner
        .as_deref()
        .map(|owner| format!(" by {owner}"))
        .unwrap_or_default()
}

impl LockError {
    /// The server-side effect of the failed call is unknown.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, LockError::Cancelled { .. } | LockError::Storage(_))
    }

    /// The caller definitely no longer owns the lease it was working with.
    pub fn is_lost(&self) -> bool {
        matches!(
            self,
            LockError::NotHeldByCaller { .. } | LockError::AlreadyReleased { .. }
        )
    }
}
