//! `chartwrap unwrap` command.

use std::path::PathBuf;

use chartwrap_core::WrapConfig;
use chartwrap_engine::{unwrap_chart, UnwrapOptions};
use clap::Args;

use super::Session;

#[derive(Args)]
pub struct UnwrapArgs {
    /// Bundle produced by `chartwrap wrap`
    pub bundle: PathBuf,

    /// Directory to unpack into
    #[arg(long, default_value = ".")]
    pub dest: PathBuf,

    /// Registry prefix to relocate the images to before pushing
    #[arg(long)]
    pub registry: Option<String>,

    /// Verify Images.lock before pushing
    #[arg(long)]
    pub verify: bool,
}

pub async fn execute(
    args: UnwrapArgs,
    config: WrapConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let options = UnwrapOptions {
        registry: args.registry,
        verify: args.verify,
    };

    let session = Session::new(config)?;
    let result = unwrap_chart(&args.bundle, &args.dest, &options, &session.workflow).await;
    session.finish().await;

    let chart_root = result?;
    println!("Helm chart unwrapped into {}", chart_root.display());
    Ok(())
}
