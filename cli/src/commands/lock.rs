//! `chartwrap lock` command.

use std::path::PathBuf;

use chartwrap_core::WrapConfig;
use chartwrap_engine::{create_lock_file, Chart};
use clap::Args;

use super::Session;

#[derive(Args)]
pub struct LockArgs {
    /// Chart directory or Chart.yaml
    pub chart_path: PathBuf,

    /// Platforms to lock (e.g., "linux/amd64,linux/arm64"); all when omitted
    #[arg(long, value_delimiter = ',')]
    pub platforms: Vec<String>,

    /// Write the lock here instead of <chart>/Images.lock
    #[arg(long)]
    pub output_file: Option<PathBuf>,
}

pub async fn execute(
    args: LockArgs,
    mut config: WrapConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    if !args.platforms.is_empty() {
        config.lock.platforms = args.platforms;
    }
    let chart = Chart::load(&args.chart_path)?;
    let lock_path = args.output_file.unwrap_or_else(|| chart.lock_file());

    let session = Session::new(config)?;
    let result = create_lock_file(
        &chart,
        session.workflow.registry.as_ref(),
        &session.workflow.config.lock,
        &lock_path,
    )
    .await;
    session.finish().await;

    let lock = result?;
    println!(
        "Images.lock for {} {} written to {} ({} image(s), {} artifact(s))",
        lock.chart.name,
        lock.chart.version,
        lock_path.display(),
        lock.images.len(),
        lock.artifact_count()
    );
    Ok(())
}
