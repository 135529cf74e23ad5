//! `chartwrap push` command.

use std::path::PathBuf;

use chartwrap_core::{ImagesLock, WrapConfig};
use chartwrap_engine::{relocate_lock, Chart};
use clap::Args;

use super::Session;

#[derive(Args)]
pub struct PushArgs {
    /// Chart directory or Chart.yaml
    pub chart_path: PathBuf,

    /// Push under this registry prefix (e.g., "registry.local:5000/mirror")
    /// instead of the locked references
    #[arg(long)]
    pub registry: Option<String>,
}

pub async fn execute(args: PushArgs, config: WrapConfig) -> Result<(), Box<dyn std::error::Error>> {
    let chart = Chart::load(&args.chart_path)?;
    let mut lock = ImagesLock::from_file(&chart.lock_file())?;
    if let Some(ref prefix) = args.registry {
        lock = relocate_lock(&lock, prefix)?;
    }

    let session = Session::new(config)?;
    let result = session
        .workflow
        .transfer_engine()
        .push_images(&lock, &chart.images_dir())
        .await;
    session.finish().await;

    let summary = result?;
    println!("Pushed {} image(s)", summary.transferred);
    for image in &lock.images {
        println!("  {}", image.image);
    }
    Ok(())
}
