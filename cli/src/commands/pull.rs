//! `chartwrap pull` command.

use std::path::PathBuf;

use chartwrap_core::{ImagesLock, WrapConfig};
use chartwrap_engine::{bundle, Chart};
use clap::Args;

use super::Session;

#[derive(Args)]
pub struct PullArgs {
    /// Chart directory or Chart.yaml
    pub chart_path: PathBuf,

    /// Also pack the chart and its images into this bundle
    #[arg(long)]
    pub output_file: Option<PathBuf>,
}

pub async fn execute(args: PullArgs, config: WrapConfig) -> Result<(), Box<dyn std::error::Error>> {
    let chart = Chart::load(&args.chart_path)?;
    let lock = ImagesLock::from_file(&chart.lock_file())?;
    let images_dir = chart.images_dir();

    let session = Session::new(config)?;
    let result = session
        .workflow
        .transfer_engine()
        .pull_images(&lock, &images_dir)
        .await;
    session.finish().await;

    let summary = result?;
    println!(
        "Pulled {} artifact(s) into {} ({} already cached)",
        summary.total,
        images_dir.display(),
        summary.cached
    );

    if let Some(output) = args.output_file {
        bundle::pack(chart.root_dir(), &output)?;
        println!("Bundle written to {}", output.display());
    }
    Ok(())
}
