use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{LockRecord, LockStore, Statement, StatementKind};
use crate::error::StoreError;

/// How an injected fault disturbs the next matching statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultMode {
    /// Apply the statement, then hold the response back. Models a reply
    /// stuck on a slow network after the server already committed.
    DelayResponse(Duration),
    /// Fail without touching the table.
    FailBeforeApply,
    /// Apply the statement, then report a transport error.
    FailAfterApply,
}

#[derive(Debug)]
struct Fault {
    kind: StatementKind,
    mode: FaultMode,
    remaining: Option<usize>,
}

#[derive(Debug, Clone)]
struct StoredRow {
    owner_token: Option<String>,
    record_version: i64,
    lease_expires_at: Option<DateTime<Utc>>,
    data: Option<Vec<u8>>,
}

#[derive(Default)]
struct MemoryInner {
    tables: HashMap<String, BTreeMap<String, StoredRow>>,
    faults: Vec<Fault>,
    executed: HashMap<StatementKind, usize>,
}

/// In-process lock table with the same conditional-write semantics as the
/// PostgreSQL statements, plus fault injection for exercising races.
///
/// Clones share the same table.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Disturb the next statement of `kind`.
    pub fn inject(&self, kind: StatementKind, mode: FaultMode) {
        self.state().faults.push(Fault {
            kind,
            mode,
            remaining: Some(1),
        });
    }

    /// Disturb every statement of `kind` until [`MemoryStore::clear_faults`].
    pub fn inject_persistent(&self, kind: StatementKind, mode: FaultMode) {
        self.state().faults.push(Fault {
            kind,
            mode,
            remaining: None,
        });
    }

    pub fn clear_faults(&self) {
        self.state().faults.clear();
    }

    /// Number of statements of `kind` that reached the table or a fault.
    pub fn executed(&self, kind: StatementKind) -> usize {
        self.state().executed.get(&kind).copied().unwrap_or(0)
    }

    pub fn row(&self, table: &str, name: &str) -> Option<LockRecord> {
        let now = Utc::now();
        self.state()
            .tables
            .get(table)
            .and_then(|rows| rows.get(name))
            .map(|row| to_record(name, row, now))
    }

    /// Push a lease into the past without touching its version, as if its
    /// holder had stopped heartbeating long ago.
    pub fn expire(&self, table: &str, name: &str) -> bool {
        let mut state = self.state();
        match state.tables.get_mut(table).and_then(|rows| rows.get_mut(name)) {
            Some(row) if row.owner_token.is_some() => {
                row.lease_expires_at = Some(Utc::now() - chrono::Duration::milliseconds(1));
                true
            }
            _ => false,
        }
    }

    fn take_fault(&self, kind: StatementKind) -> Option<FaultMode> {
        let mut state = self.state();
        *state.executed.entry(kind).or_insert(0) += 1;
        let idx = state.faults.iter().position(|fault| fault.kind == kind)?;
        let mode = state.faults[idx].mode;
        let exhausted = match state.faults[idx].remaining.as_mut() {
            Some(remaining) => {
                *remaining -= 1;
                *remaining == 0
            }
            None => false,
        };
        if exhausted {
            state.faults.remove(idx);
        }
        Some(mode)
    }

    fn apply(&self, table: &str, statement: &Statement) -> Result<Vec<LockRecord>, StoreError> {
        let now = Utc::now();
        let mut state = self.state();

        match statement {
            Statement::CreateTable => {
                state.tables.entry(table.to_string()).or_default();
                return Ok(Vec::new());
            }
            Statement::DropTable => {
                state.tables.remove(table);
                return Ok(Vec::new());
            }
            _ => {}
        }

        let rows = state
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))?;

        let written = match statement {
            Statement::CreateTable | Statement::DropTable => None,
            Statement::Read { name } => {
                return Ok(rows
                    .get(name)
                    .map(|row| vec![to_record(name, row, now)])
                    .unwrap_or_default())
            }
            Statement::ReadAll => {
                return Ok(rows
                    .iter()
                    .map(|(name, row)| to_record(name, row, now))
                    .collect())
            }
            Statement::Insert {
                name,
                owner,
                ttl,
                data,
            } => {
                if rows.contains_key(name) {
                    None
                } else {
                    rows.insert(
                        name.clone(),
                        StoredRow {
                            owner_token: Some(owner.clone()),
                            record_version: 1,
                            lease_expires_at: Some(expiry(now, *ttl)),
                            data: data.clone(),
                        },
                    );
                    Some(name)
                }
            }
            Statement::Claim {
                name,
                owner,
                expected_version,
                ttl,
                data,
            } => match rows.get_mut(name) {
                Some(row) if row.record_version == *expected_version => {
                    row.owner_token = Some(owner.clone());
                    row.record_version += 1;
                    row.lease_expires_at = Some(expiry(now, *ttl));
                    if data.is_some() {
                        row.data = data.clone();
                    }
                    Some(name)
                }
                _ => None,
            },
            Statement::Heartbeat {
                name,
                owner,
                expected_version,
                ttl,
            } => match rows.get_mut(name) {
                Some(row) if guard_matches(row, owner, *expected_version) => {
                    row.record_version += 1;
                    row.lease_expires_at = Some(expiry(now, *ttl));
                    Some(name)
                }
                _ => None,
            },
            Statement::Release {
                name,
                owner,
                expected_version,
            } => match rows.get_mut(name) {
                Some(row) if guard_matches(row, owner, *expected_version) => {
                    row.owner_token = None;
                    row.lease_expires_at = None;
                    row.record_version += 1;
                    Some(name)
                }
                _ => None,
            },
        };

        Ok(written
            .and_then(|name| rows.get(name).map(|row| to_record(name, row, now)))
            .into_iter()
            .collect())
    }
}

fn guard_matches(row: &StoredRow, owner: &str, expected_version: i64) -> bool {
    row.owner_token.as_deref() == Some(owner) && row.record_version == expected_version
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + chrono::Duration::milliseconds(super::ttl_millis(ttl))
}

fn to_record(name: &str, row: &StoredRow, now: DateTime<Utc>) -> LockRecord {
    LockRecord {
        name: name.to_string(),
        owner_token: row.owner_token.clone(),
        record_version: row.record_version,
        lease_expires_at: row.lease_expires_at,
        data: row.data.clone(),
        expired: row.lease_expires_at.map_or(true, |at| at <= now),
    }
}

impl LockStore for MemoryStore {
    fn execute(
        &self,
        table: &str,
        statement: &Statement,
    ) -> impl Future<Output = Result<Vec<LockRecord>, StoreError>> + Send {
        async move {
            let kind = statement.kind();
            let fault = self.take_fault(kind);
            if fault == Some(FaultMode::FailBeforeApply) {
                return Err(StoreError::Injected(format!(
                    "{kind} failed before reaching the table"
                )));
            }

            let result = self.apply(table, statement);
            match fault {
                Some(FaultMode::FailAfterApply) if result.is_ok() => Err(StoreError::Injected(
                    format!("{kind} applied but the response was lost"),
                )),
                Some(FaultMode::DelayResponse(delay)) => {
                    tokio::time::sleep(delay).await;
                    result
                }
                _ => result,
            }
        }
    }
}
