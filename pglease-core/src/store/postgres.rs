use std::future::Future;
use std::sync::Arc;

use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use tokio_postgres::types::ToSql;
use tokio_postgres::tls::MakeTlsConnect;
use tokio_postgres::{Client, NoTls, Row, Socket};
use tracing::{debug, warn};

use super::{ttl_millis, LockRecord, LockStore, Statement};
use crate::error::StoreError;

/// PostgreSQL connection parameters.
#[derive(Clone)]
pub struct PgConnectConfig {
    connection_string: String,
    ssl_mode: PgSslMode,
}

impl std::fmt::Debug for PgConnectConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnectConfig")
            .field("connection_string", &redact_password(&self.connection_string))
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PgSslMode {
    Disable,
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl PgSslMode {
    fn from_env() -> Self {
        let value = std::env::var("PGSSLMODE").unwrap_or_else(|_| "disable".to_string());
        Self::parse(value.as_str())
    }

    fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "prefer" => Self::Prefer,
            "require" => Self::Require,
            "verify-ca" => Self::VerifyCa,
            "verify-full" => Self::VerifyFull,
            _ => Self::Disable,
        }
    }
}

impl PgConnectConfig {
    /// Build from the libpq environment variables (`PGHOST`, `PGPORT`,
    /// `PGUSER`, `PGPASSWORD`, `PGDATABASE`, `PGSSLMODE`).
    pub fn from_env() -> Self {
        let host = std::env::var("PGHOST").unwrap_or_else(|_| "localhost".to_string());
        let port = std::env::var("PGPORT").unwrap_or_else(|_| "5432".to_string());
        let user = std::env::var("PGUSER").unwrap_or_else(|_| "postgres".to_string());
        let dbname = std::env::var("PGDATABASE").unwrap_or_else(|_| "postgres".to_string());
        let password = std::env::var("PGPASSWORD").ok();

        let mut config = format!("host={host} port={port} user={user} dbname={dbname}");
        if let Some(pwd) = password {
            config.push_str(&format!(" password={pwd}"));
        }

        Self {
            connection_string: config,
            ssl_mode: PgSslMode::from_env(),
        }
    }

    /// Use an explicit connection string or `postgres://` URL. TLS mode still
    /// comes from `PGSSLMODE`.
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            connection_string: url.into(),
            ssl_mode: PgSslMode::from_env(),
        }
    }

    /// `database_url` when set, otherwise the libpq environment.
    pub fn resolve(database_url: Option<&str>) -> Self {
        match database_url {
            Some(url) if !url.trim().is_empty() => Self::from_url(url.trim()),
            _ => Self::from_env(),
        }
    }

    pub fn with_ssl_mode(mut self, ssl_mode: PgSslMode) -> Self {
        self.ssl_mode = ssl_mode;
        self
    }

    pub fn ssl_mode(&self) -> PgSslMode {
        self.ssl_mode
    }
}

fn redact_password(connection_string: &str) -> String {
    if let Some((scheme, rest)) = connection_string.split_once("://") {
        if let Some((credentials, host)) = rest.split_once('@') {
            if let Some((user, _)) = credentials.split_once(':') {
                return format!("{scheme}://{user}:***@{host}");
            }
        }
        return connection_string.to_string();
    }
    connection_string
        .split_whitespace()
        .map(|pair| {
            if pair.starts_with("password=") {
                "password=***"
            } else {
                pair
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// How `connect_client` reaches the server for a given `PGSSLMODE`.
enum TlsPlan {
    Plain,
    /// TLS first, plaintext if the handshake fails.
    Opportunistic(MakeTlsConnector),
    Required(MakeTlsConnector),
}

impl std::fmt::Debug for TlsPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TlsPlan::Plain => "Plain",
            TlsPlan::Opportunistic(_) => "Opportunistic(..)",
            TlsPlan::Required(_) => "Required(..)",
        })
    }
}

impl TlsPlan {
    fn for_mode(mode: PgSslMode) -> Result<Self, StoreError> {
        // (verify certificate chain, verify hostname)
        let plan = match mode {
            PgSslMode::Disable => return Ok(TlsPlan::Plain),
            PgSslMode::Prefer => TlsPlan::Opportunistic(tls_connector(mode, false, false)?),
            PgSslMode::Require => TlsPlan::Required(tls_connector(mode, false, false)?),
            PgSslMode::VerifyCa => TlsPlan::Required(tls_connector(mode, true, false)?),
            PgSslMode::VerifyFull => TlsPlan::Required(tls_connector(mode, true, true)?),
        };
        Ok(plan)
    }
}

fn tls_connector(
    mode: PgSslMode,
    verify_certs: bool,
    verify_hostname: bool,
) -> Result<MakeTlsConnector, StoreError> {
    let connector = TlsConnector::builder()
        .danger_accept_invalid_certs(!verify_certs)
        .danger_accept_invalid_hostnames(!verify_hostname)
        .build()
        .map_err(|e| StoreError::Connect(format!("TLS setup for {mode:?} failed: {e}")))?;
    Ok(MakeTlsConnector::new(connector))
}

/// Opens one connection and drives it on a background task.
async fn open<T>(connection_string: &str, tls: T) -> Result<Client, StoreError>
where
    T: MakeTlsConnect<Socket>,
    T::Stream: Send + 'static,
{
    let (client, connection) = tokio_postgres::connect(connection_string, tls).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!(error = %e, "PostgreSQL connection error");
        }
    });
    Ok(client)
}

async fn connect_client(config: &PgConnectConfig) -> Result<Client, StoreError> {
    let target = config.connection_string.as_str();
    let plan = TlsPlan::for_mode(config.ssl_mode)?;
    debug!(ssl_mode = ?config.ssl_mode, ?plan, "connecting to PostgreSQL");
    match plan {
        TlsPlan::Plain => open(target, NoTls).await,
        TlsPlan::Opportunistic(connector) => match open(target, connector).await {
            Ok(client) => Ok(client),
            Err(err) => {
                warn!(
                    error = %err,
                    "TLS handshake failed with PGSSLMODE=prefer, retrying in plaintext"
                );
                open(target, NoTls).await
            }
        },
        TlsPlan::Required(connector) => open(target, connector).await,
    }
}

/// Lock store backed by one pipelined tokio-postgres connection.
///
/// The connection is shared by every lock of the owning client. Dropping an
/// in-flight statement future abandons the wait for its reply; a request that
/// was already written to the socket still executes on the server, and later
/// statements queue behind it on the same connection.
#[derive(Clone)]
pub struct PostgresStore {
    client: Arc<Client>,
}

impl PostgresStore {
    pub async fn connect(config: &PgConnectConfig) -> Result<Self, StoreError> {
        let client = connect_client(config).await?;
        Ok(Self::from_client(client))
    }

    pub fn from_client(client: Client) -> Self {
        Self {
            client: Arc::new(client),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn run(&self, table: &str, statement: &Statement) -> Result<Vec<LockRecord>, StoreError> {
        let sql = statement.sql(table);
        let rows = match statement {
            Statement::CreateTable | Statement::DropTable => {
                self.client.batch_execute(&sql).await?;
                return Ok(Vec::new());
            }
            Statement::ReadAll => self.client.query(&sql, &[]).await?,
            Statement::Read { name } => self.client.query(&sql, &[name]).await?,
            Statement::Insert {
                name,
                owner,
                ttl,
                data,
            } => {
                let ttl_ms = ttl_millis(*ttl);
                let params: [&(dyn ToSql + Sync); 4] = [name, owner, &ttl_ms, data];
                self.client.query(&sql, &params).await?
            }
            Statement::Claim {
                name,
                owner,
                expected_version,
                ttl,
                data,
            } => {
                let ttl_ms = ttl_millis(*ttl);
                let params: [&(dyn ToSql + Sync); 5] =
                    [name, owner, expected_version, &ttl_ms, data];
                self.client.query(&sql, &params).await?
            }
            Statement::Heartbeat {
                name,
                owner,
                expected_version,
                ttl,
            } => {
                let ttl_ms = ttl_millis(*ttl);
                let params: [&(dyn ToSql + Sync); 4] = [name, owner, expected_version, &ttl_ms];
                self.client.query(&sql, &params).await?
            }
            Statement::Release {
                name,
                owner,
                expected_version,
            } => {
                let params: [&(dyn ToSql + Sync); 3] = [name, owner, expected_version];
                self.client.query(&sql, &params).await?
            }
        };
        rows.iter().map(decode_row).collect()
    }
}

fn decode_row(row: &Row) -> Result<LockRecord, StoreError> {
    let decode = |e: tokio_postgres::Error| StoreError::Decode(e.to_string());
    Ok(LockRecord {
        name: row.try_get("name").map_err(decode)?,
        owner_token: row.try_get("owner_token").map_err(decode)?,
        record_version: row.try_get("record_version").map_err(decode)?,
        lease_expires_at: row.try_get("lease_expires_at").map_err(decode)?,
        data: row.try_get("data").map_err(decode)?,
        expired: row.try_get("expired").map_err(decode)?,
    })
}

impl LockStore for PostgresStore {
    fn execute(
        &self,
        table: &str,
        statement: &Statement,
    ) -> impl Future<Output = Result<Vec<LockRecord>, StoreError>> + Send {
        self.run(table, statement)
    }
}
