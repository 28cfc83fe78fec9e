use std::env;
use std::process;
use std::sync::Once;

use anyhow::{bail, Context, Result};
use pglease_core::{LeaseSettings, LockClient, PgConnectConfig, PostgresStore};
use tracing::info;

mod scenarios;

pub struct CliArgs {
    table: String,
    iterations: usize,
    workers: usize,
}

impl CliArgs {
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Fresh client on its own connection, bound to the runner's table.
    pub async fn client(&self, settings: LeaseSettings) -> Result<LockClient<PostgresStore>> {
        let store = PostgresStore::connect(&PgConnectConfig::from_env())
            .await
            .context("failed to connect to postgres (check PGHOST/PGUSER/PGDATABASE)")?;
        let client = LockClient::new(store, settings.with_table(self.table.clone()))?;
        client.create_table().await?;
        Ok(client)
    }
}

fn parse_args<I: IntoIterator<Item = String>>(args_iter: I) -> Result<CliArgs> {
    let mut args = args_iter.into_iter();
    let mut table = String::from("pglease_runner_locks");
    let mut iterations = 1000;
    let mut workers = 4;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--table" | "-t" => {
                table = args.next().context("expected value after --table")?;
            }
            "--iterations" | "-n" => {
                let raw = args.next().context("expected value after --iterations")?;
                iterations = raw
                    .parse()
                    .with_context(|| format!("invalid --iterations {raw:?}"))?;
            }
            "--workers" | "-w" => {
                let raw = args.next().context("expected value after --workers")?;
                workers = raw
                    .parse()
                    .with_context(|| format!("invalid --workers {raw:?}"))?;
            }
            "--help" | "-h" => {
                bail!("usage: pglease-runner [--table NAME] [--iterations N] [--workers N]");
            }
            other => bail!("unknown argument: {other}"),
        }
    }
    if workers == 0 {
        bail!("--workers must be at least 1");
    }

    Ok(CliArgs {
        table,
        iterations,
        workers,
    })
}

#[tokio::main]
async fn main() {
    init_logging();

    if let Err(err) = run_entrypoint().await {
        eprintln!("runner failed: {err:?}");
        process::exit(1);
    }

    info!("Runner completed successfully");
}

async fn run_entrypoint() -> Result<()> {
    let raw_args: Vec<String> = env::args().skip(1).collect();
    let args = parse_args(raw_args)?;

    info!(
        table = %args.table,
        iterations = args.iterations,
        workers = args.workers,
        "running lock scenarios"
    );
    let client = args.client(LeaseSettings::default()).await?;
    client.drop_table().await?;
    client.create_table().await?;

    scenarios::run_all(&args).await?;
    client.drop_table().await?;
    Ok(())
}

fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_target(false)
            .compact()
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Result<CliArgs> {
        parse_args(raw.iter().map(|s| s.to_string()))
    }

    #[test]
    fn defaults_apply_without_flags() -> Result<()> {
        let parsed = args(&[])?;
        assert_eq!(parsed.table(), "pglease_runner_locks");
        assert_eq!(parsed.iterations(), 1000);
        assert_eq!(parsed.workers(), 4);
        Ok(())
    }

    #[test]
    fn flags_override_defaults() -> Result<()> {
        let parsed = args(&["--table", "t1", "-n", "50", "--workers", "2"])?;
        assert_eq!(parsed.table(), "t1");
        assert_eq!(parsed.iterations(), 50);
        assert_eq!(parsed.workers(), 2);
        Ok(())
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(args(&["--iterations", "many"]).is_err());
        assert!(args(&["--workers", "0"]).is_err());
        assert!(args(&["--bogus"]).is_err());
    }
}
