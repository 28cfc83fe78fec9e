use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use pglease_core::{AcquireOptions, LeaseSettings, LockError};
use rand::Rng;
use tracing::info;

use crate::CliArgs;

const LOCK: &str = "double_holder";

#[derive(Default)]
struct Tally {
    holders: AtomicUsize,
    overlaps: AtomicUsize,
    acquired: AtomicUsize,
    contended: AtomicUsize,
}

pub async fn run(args: &CliArgs) -> Result<()> {
    info!(
        iterations = args.iterations(),
        workers = args.workers(),
        "scenario: no double holder"
    );
    let tally = Arc::new(Tally::default());
    let per_worker = args.iterations().div_ceil(args.workers());

    let mut workers = Vec::with_capacity(args.workers());
    for _ in 0..args.workers() {
        let client = args.client(LeaseSettings::default()).await?;
        let tally = tally.clone();
        workers.push(tokio::spawn(async move {
            for _ in 0..per_worker {
                match client.acquire(LOCK, AcquireOptions::new().fail_fast()).await {
                    Ok(mut handle) => {
                        if tally.holders.fetch_add(1, Ordering::SeqCst) != 0 {
                            tally.overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        tally.acquired.fetch_add(1, Ordering::SeqCst);
                        let hold = rand::rng().random_range(0..2_000);
                        tokio::time::sleep(Duration::from_micros(hold)).await;
                        tally.holders.fetch_sub(1, Ordering::SeqCst);
                        handle.close().await?;
                    }
                    Err(LockError::AlreadyHeld { .. }) => {
                        tally.contended.fetch_add(1, Ordering::SeqCst);
                        let pause = rand::rng().random_range(0..1_000);
                        tokio::time::sleep(Duration::from_micros(pause)).await;
                    }
                    Err(err) => return Err(err),
                }
            }
            Ok::<_, LockError>(())
        }));
    }
    for worker in workers {
        worker.await.context("worker panicked")??;
    }

    let acquired = tally.acquired.load(Ordering::SeqCst);
    let contended = tally.contended.load(Ordering::SeqCst);
    info!(acquired, contended, "stress finished");
    ensure!(
        tally.overlaps.load(Ordering::SeqCst) == 0,
        "two workers held the lock at once"
    );
    ensure!(acquired > 0, "no worker ever acquired the lock");

    let client = args.client(LeaseSettings::default()).await?;
    ensure!(
        client.get(LOCK).await?.is_some_and(|info| !info.is_held()),
        "lock should be free after the stress run"
    );
    info!("scenario: no double holder passed");
    Ok(())
}
