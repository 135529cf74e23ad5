//! `chartwrap verify` command.

use std::path::PathBuf;

use chartwrap_core::WrapConfig;
use chartwrap_engine::{verify_lock, Chart};
use clap::Args;

use super::Session;

#[derive(Args)]
pub struct VerifyArgs {
    /// Chart directory or Chart.yaml
    pub chart_path: PathBuf,

    /// Lock file to check instead of <chart>/Images.lock
    #[arg(long)]
    pub lock_file: Option<PathBuf>,
}

pub async fn execute(
    args: VerifyArgs,
    config: WrapConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let chart = Chart::load(&args.chart_path)?;
    let lock_path = args.lock_file.unwrap_or_else(|| chart.lock_file());

    let session = Session::new(config)?;
    let result = verify_lock(
        &chart,
        &lock_path,
        session.workflow.registry.as_ref(),
        &session.workflow.config.lock,
    )
    .await;
    session.finish().await;

    result?;
    println!("Images.lock for {} is valid", chart.name());
    Ok(())
}
