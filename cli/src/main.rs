//! chartwrap CLI entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use chartwrap_cli::commands::{dispatch, exit_code, load_config, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_config(&cli.global) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    // An explicit --log-level wins over RUST_LOG, which wins over the config file.
    let filter = match cli.global.log_level {
        Some(level) => EnvFilter::new(level.as_filter()),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter())),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = dispatch(cli, config).await {
        eprintln!("Error: {e}");
        std::process::exit(exit_code(e.as_ref()));
    }
}
