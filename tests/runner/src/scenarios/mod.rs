use crate::CliArgs;
use anyhow::Result;

pub mod cancelled_heartbeat;
pub mod double_holder;
pub mod round_trip;
pub mod stale_takeover;

pub async fn run_all(args: &CliArgs) -> Result<()> {
    round_trip::run(args).await?;
    stale_takeover::run(args).await?;
    cancelled_heartbeat::run(args).await?;
    double_holder::run(args).await?;
    Ok(())
}
