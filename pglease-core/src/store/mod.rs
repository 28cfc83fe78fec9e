//! Storage gateway for the lock table.
//!
//! Every interaction with the lock table is one [`Statement`]: a closed set of
//! single-row, parameterized operations. A [`LockStore`] runs them and hands
//! back the affected rows. Mutations always return the row they wrote, so "no
//! rows" means the conditional guard did not match.
//!
//! [`Gateway`] wraps a store with the statement tracer and with cancellation:
//! a statement raced against a [`CancellationToken`] is abandoned when the
//! token fires, which leaves its server-side effect unknown.

use std::fmt::Write as _;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::{LockError, StoreError};
use crate::trace::{LogTracer, StatementEnd, StatementOutcome, StatementStart, StatementTracer};

mod memory;
mod postgres;

pub use memory::{FaultMode, MemoryStore};
pub use postgres::{PgConnectConfig, PgSslMode, PostgresStore};

/// Row of the lock table as observed by one statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub name: String,
    pub owner_token: Option<String>,
    pub record_version: i64,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub data: Option<Vec<u8>>,
    /// Evaluated by the store against its own clock when the row was read.
    pub expired: bool,
}

impl LockRecord {
    /// Free, or held by a lease that has run out.
    pub fn is_claimable(&self) -> bool {
        self.owner_token.is_none() || self.expired
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    CreateTable,
    DropTable,
    Read,
    ReadAll,
    Insert,
    Claim,
    Heartbeat,
    Release,
}

impl StatementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatementKind::CreateTable => "create_table",
            StatementKind::DropTable => "drop_table",
            StatementKind::Read => "read",
            StatementKind::ReadAll => "read_all",
            StatementKind::Insert => "insert",
            StatementKind::Claim => "claim",
            StatementKind::Heartbeat => "heartbeat",
            StatementKind::Release => "release",
        }
    }
}

impl std::fmt::Display for StatementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One operation against the lock table.
#[derive(Debug, Clone)]
pub enum Statement {
    CreateTable,
    DropTable,
    Read {
        name: String,
    },
    ReadAll,
    /// First acquisition of a name that has no row yet.
    Insert {
        name: String,
        owner: String,
        ttl: Duration,
        data: Option<Vec<u8>>,
    },
    /// Take over a free or expired row last seen at `expected_version`.
    Claim {
        name: String,
        owner: String,
        expected_version: i64,
        ttl: Duration,
        data: Option<Vec<u8>>,
    },
    Heartbeat {
        name: String,
        owner: String,
        expected_version: i64,
        ttl: Duration,
    },
    Release {
        name: String,
        owner: String,
        expected_version: i64,
    },
}

const COLUMNS: &str = "name, owner_token, record_version, lease_expires_at, data, \
     (lease_expires_at IS NULL OR lease_expires_at <= now()) AS expired";

impl Statement {
    pub fn kind(&self) -> StatementKind {
        match self {
            Statement::CreateTable => StatementKind::CreateTable,
            Statement::DropTable => StatementKind::DropTable,
            Statement::Read { .. } => StatementKind::Read,
            Statement::ReadAll => StatementKind::ReadAll,
            Statement::Insert { .. } => StatementKind::Insert,
            Statement::Claim { .. } => StatementKind::Claim,
            Statement::Heartbeat { .. } => StatementKind::Heartbeat,
            Statement::Release { .. } => StatementKind::Release,
        }
    }

    /// Lock name the statement targets, if it targets a single one.
    pub fn lock_name(&self) -> Option<&str> {
        match self {
            Statement::Read { name }
            | Statement::Insert { name, .. }
            | Statement::Claim { name, .. }
            | Statement::Heartbeat { name, .. }
            | Statement::Release { name, .. } => Some(name),
            Statement::CreateTable | Statement::DropTable | Statement::ReadAll => None,
        }
    }

    /// PostgreSQL text of the statement against `table`. Parameters are
    /// positional and match [`Statement::params`].
    pub fn sql(&self, table_name: &str) -> String {
        let table = quote_ident(table_name);
        match self {
            Statement::CreateTable => {
                let index = quote_ident(&format!("{table_name}_lease_expires_at_idx"));
                format!(
                    "CREATE TABLE IF NOT EXISTS {table} (\
                         name TEXT PRIMARY KEY,\
                         owner_token TEXT,\
                         record_version BIGINT NOT NULL,\
                         lease_expires_at TIMESTAMPTZ,\
                         data BYTEA\
                     ); \
                     CREATE INDEX IF NOT EXISTS {index} ON {table} (lease_expires_at)"
                )
            }
            Statement::DropTable => format!("DROP TABLE IF EXISTS {table}"),
            Statement::Read { .. } => format!("SELECT {COLUMNS} FROM {table} WHERE name = $1"),
            Statement::ReadAll => format!("SELECT {COLUMNS} FROM {table} ORDER BY name"),
            Statement::Insert { .. } => format!(
                "INSERT INTO {table} (name, owner_token, record_version, lease_expires_at, data) \
                 VALUES ($1, $2, 1, now() + $3::bigint * interval '1 millisecond', $4) \
                 ON CONFLICT (name) DO NOTHING \
                 RETURNING {COLUMNS}"
            ),
            Statement::Claim { .. } => format!(
                "UPDATE {table} SET owner_token = $2, record_version = record_version + 1, \
                 lease_expires_at = now() + $4::bigint * interval '1 millisecond', \
                 data = COALESCE($5, data) \
                 WHERE name = $1 AND record_version = $3 \
                 RETURNING {COLUMNS}"
            ),
            Statement::Heartbeat { .. } => format!(
                "UPDATE {table} SET record_version = record_version + 1, \
                 lease_expires_at = now() + $4::bigint * interval '1 millisecond' \
                 WHERE name = $1 AND owner_token = $2 AND record_version = $3 \
                 RETURNING {COLUMNS}"
            ),
            Statement::Release { .. } => format!(
                "UPDATE {table} SET owner_token = NULL, lease_expires_at = NULL, \
                 record_version = record_version + 1 \
                 WHERE name = $1 AND owner_token = $2 AND record_version = $3 \
                 RETURNING {COLUMNS}"
            ),
        }
    }

    /// Parameters rendered for tracing. Payloads are summarized, not dumped.
    pub fn params(&self) -> Vec<String> {
        match self {
            Statement::CreateTable | Statement::DropTable | Statement::ReadAll => Vec::new(),
            Statement::Read { name } => vec![name.clone()],
            Statement::Insert {
                name,
                owner,
                ttl,
                data,
            } => vec![
                name.clone(),
                owner.clone(),
                ttl_millis(*ttl).to_string(),
                render_payload(data.as_deref()),
            ],
            Statement::Claim {
                name,
                owner,
                expected_version,
                ttl,
                data,
            } => vec![
                name.clone(),
                owner.clone(),
                expected_version.to_string(),
                ttl_millis(*ttl).to_string(),
                render_payload(data.as_deref()),
            ],
            Statement::Heartbeat {
                name,
                owner,
                expected_version,
                ttl,
            } => vec![
                name.clone(),
                owner.clone(),
                expected_version.to_string(),
                ttl_millis(*ttl).to_string(),
            ],
            Statement::Release {
                name,
                owner,
                expected_version,
            } => vec![name.clone(), owner.clone(), expected_version.to_string()],
        }
    }
}

pub(crate) fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

fn render_payload(data: Option<&[u8]>) -> String {
    match data {
        Some(bytes) => format!("<{} bytes>", bytes.len()),
        None => "NULL".to_string(),
    }
}

fn quote_ident(ident: &str) -> String {
    let mut quoted = String::with_capacity(ident.len() + 2);
    quoted.push('"');
    for ch in ident.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Executes lock-table statements. Implementations must be safe to share
/// between the caller and every heartbeat task.
pub trait LockStore: Send + Sync + 'static {
    /// Run `statement` against `table` and return the rows it read or wrote.
    fn execute(
        &self,
        table: &str,
        statement: &Statement,
    ) -> impl Future<Output = Result<Vec<LockRecord>, StoreError>> + Send;
}

/// Store plus table name plus tracer: the only path statements take.
pub struct Gateway<S> {
    store: S,
    table: String,
    tracer: Arc<dyn StatementTracer>,
}

impl<S: LockStore> Gateway<S> {
    pub fn new(store: S, table: impl Into<String>) -> Self {
        Self {
            store,
            table: table.into(),
            tracer: Arc::new(LogTracer),
        }
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn StatementTracer>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run a statement to completion.
    pub async fn run(&self, statement: &Statement) -> Result<Vec<LockRecord>, LockError> {
        self.run_in_scope(statement, None).await
    }

    /// Run a statement, abandoning it if `scope` is cancelled first. An
    /// abandoned statement reports [`LockError::Cancelled`]; whatever it did
    /// on the server stays done.
    pub async fn run_in_scope(
        &self,
        statement: &Statement,
        scope: Option<&CancellationToken>,
    ) -> Result<Vec<LockRecord>, LockError> {
        let kind = statement.kind();
        let sql = statement.sql(&self.table);
        let params = statement.params();
        self.tracer.statement_start(&StatementStart {
            kind,
            sql: &sql,
            params: &params,
        });

        let started = Instant::now();
        let result = match scope {
            Some(scope) => {
                tokio::select! {
                    biased;
                    _ = scope.cancelled() => None,
                    res = self.store.execute(&self.table, statement) => Some(res),
                }
            }
            None => Some(self.store.execute(&self.table, statement).await),
        };
        let elapsed = started.elapsed();

        match result {
            Some(Ok(rows)) => {
                self.tracer.statement_end(&StatementEnd {
                    kind,
                    sql: &sql,
                    outcome: StatementOutcome::Rows(rows.len()),
                    elapsed,
                });
                Ok(rows)
            }
            Some(Err(err)) => {
                self.tracer.statement_end(&StatementEnd {
                    kind,
                    sql: &sql,
                    outcome: StatementOutcome::Failed(&err),
                    elapsed,
                });
                Err(LockError::Storage(err))
            }
            None => {
                self.tracer.statement_end(&StatementEnd {
                    kind,
                    sql: &sql,
                    outcome: StatementOutcome::Cancelled,
                    elapsed,
                });
                Err(LockError::Cancelled {
                    name: statement.lock_name().unwrap_or_default().to_string(),
                })
            }
        }
    }
}

/// Debug helper used by tracers that print statements on one line.
pub fn describe(sql: &str, params: &[String]) -> String {
    let mut line = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    if !params.is_empty() {
        let _ = write!(line, " [{}]", params.join(", "));
    }
    line
}
