//! Writes the full mirrored dataset to stdout.
//!
//! Expects the dataset in the default data directory or in the directory
//! given as the first argument, stored with the default compression.

use std::path::PathBuf;

use clap::Parser;
use hibp_mirror::{Config, Hibp, DEFAULT_DATA_DIR};
use tokio::io::AsyncWriteExt;

#[derive(Parser, Debug)]
#[command(name = "hibp-export")]
#[command(about = "Export the mirrored Have I Been Pwned dataset to stdout")]
struct Args {
    /// Data directory holding the mirrored dataset
    #[arg(default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Err(err) = run(args).await {
        eprintln!("Failed to export HIBP data: {err}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mirror = Hibp::new(Config { data_dir: args.data_dir, ..Config::default() })?;

    let mut stdout = tokio::io::BufWriter::new(tokio::io::stdout());
    mirror.export(&mut stdout).await?;
    stdout.flush().await?;

    Ok(())
}
