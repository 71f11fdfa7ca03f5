//! Mirrors the full HIBP range dataset into a local data directory.
//!
//! Progress is tracked in `<dataDir>/state` so an interrupted run resumes
//! where it left off; the state file is removed after a clean sync.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use hibp_mirror::{
    Config, Hibp, Progress, ProgressFn, SyncConfig, DEFAULT_DATA_DIR, DEFAULT_STATE_FILE_NAME,
    TOTAL_RANGES,
};
use indicatif::{ProgressBar, ProgressStyle};

#[derive(Parser, Debug)]
#[command(name = "hibp-sync")]
#[command(about = "Sync the Have I Been Pwned range dataset to local storage")]
struct Args {
    /// Data directory for the mirrored dataset
    #[arg(default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    /// Disable the progress bar
    #[arg(long)]
    no_progress: bool,
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
        eprintln!("Failed to sync HIBP data: {err}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    tokio::fs::create_dir_all(&args.data_dir).await?;

    let state_path = args.data_dir.join(DEFAULT_STATE_FILE_NAME);

    let progress_bar = if args.no_progress {
        None
    } else {
        let bar = ProgressBar::new(u64::from(TOTAL_RANGES));
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}")
                .expect("Invalid progress bar template")
                .progress_chars("#>-"),
        );
        Some(bar)
    };

    let progress: Option<ProgressFn> = progress_bar.map(|bar| {
        let progress_fn: ProgressFn = Arc::new(move |progress: Progress| {
            bar.set_position(progress.processed);
            if progress.remaining == 0 {
                bar.finish_with_message("done");
            }
            Ok(())
        });
        progress_fn
    });

    let mirror = Hibp::new(Config { data_dir: args.data_dir.clone(), ..Config::default() })?;

    mirror
        .sync(SyncConfig {
            state_file: Some(state_path.clone()),
            progress,
            ..SyncConfig::default()
        })
        .await?;

    // A clean run needs no resumption point.
    tokio::fs::remove_file(&state_path).await?;

    Ok(())
}
