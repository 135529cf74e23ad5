//! `chartwrap wrap` command.

use std::path::PathBuf;

use chartwrap_core::WrapConfig;
use chartwrap_engine::{wrap_chart, WrapOptions};
use clap::Args;

use super::Session;

#[derive(Args)]
pub struct WrapArgs {
    /// Chart directory, Chart.yaml, chart bundle or oci:// reference
    pub input: PathBuf,

    /// Bundle to write (default: <name>-<version>.wrap.tgz next to the input)
    #[arg(long)]
    pub output_file: Option<PathBuf>,

    /// Chart version to fetch when the input is an oci:// reference
    #[arg(long)]
    pub version: Option<String>,

    /// Platforms to lock when Images.lock has to be generated
    #[arg(long, value_delimiter = ',')]
    pub platforms: Vec<String>,
}

pub async fn execute(
    args: WrapArgs,
    mut config: WrapConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    if !args.platforms.is_empty() {
        config.lock.platforms = args.platforms;
    }

    let options = WrapOptions {
        output: args.output_file,
        version: args.version,
    };

    let session = Session::new(config)?;
    let result = wrap_chart(&args.input, &options, &session.workflow).await;
    session.finish().await;

    let output = result?;
    println!("Helm chart wrapped into {}", output.display());
    Ok(())
}
