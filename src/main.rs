//! # Pixpress - Batch Image Compression CLI
//!
//! Decodes a batch of images, optionally resizes or rotates them, and encodes
//! every image into each requested format on a pool of worker threads.
//!
//! ## Features
//!
//! - **Worker Pool**: Every codec call runs on one of N dedicated worker contexts
//! - **Auto Quality**: `--jpeg auto` bisects quality toward a perceptual distance target
//! - **Preprocessing**: Resize and rotate before encoding
//! - **Configurable**: Pool size, timeouts and optimizer budget via environment variables
//!
//! ## Usage
//!
//! ```bash
//! # Encode every PNG in a directory to JPEG at quality 80
//! pixpress compress photos/ --jpeg '{"quality":80}' --output-dir out
//!
//! # Let the optimizer pick the JPEG quality
//! pixpress compress photo.png --jpeg auto --optimizer-butteraugli-target 1.4
//!
//! # List available codecs and preprocessors
//! pixpress codecs
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pixpress::codec::Registry;
use pixpress::commands::{
    codecs::CodecsCommand,
    compress::{CompressCommand, CompressOptions},
};

/// Pixpress - A batch image compressor
#[derive(Parser)]
#[command(
    name = "pixpress",
    about = "A batch image compressor with a worker pool",
    long_about = "Decodes images, applies optional preprocessing, and encodes them into every requested format, optionally tuning quality toward a perceptual distance target.",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available commands
#[derive(Subcommand)]
enum Commands {
    /// Compress files, directories or glob patterns
    Compress {
        /// Input files, directories or glob patterns
        #[arg(required = true)]
        inputs: Vec<String>,
        /// Suffix appended to each output file stem
        #[arg(long, default_value = "")]
        suffix: String,
        /// Directory the outputs are written to
        #[arg(long, short = 'o', default_value = ".")]
        output_dir: PathBuf,
        /// Number of worker contexts (defaults to PIXPRESS_WORKERS or the CPU count)
        #[arg(long, short = 'w')]
        workers: Option<usize>,
        /// Maximum number of optimizer rounds in auto mode
        #[arg(long)]
        max_optimizer_rounds: Option<u32>,
        /// Target perceptual distance for auto mode
        #[arg(long)]
        optimizer_butteraugli_target: Option<f64>,
        /// Abandon a worker whose job takes longer than this many seconds
        #[arg(long)]
        job_timeout_secs: Option<u64>,
        /// Print results as JSON instead of a summary
        #[arg(long)]
        json: bool,
        /// Encode to JPEG: `auto` or a JSON options object
        #[arg(long, num_args = 0..=1, default_missing_value = "{}")]
        jpeg: Option<String>,
        /// Encode to PNG: a JSON options object
        #[arg(long, num_args = 0..=1, default_missing_value = "{}")]
        png: Option<String>,
        /// Resize before encoding: a JSON options object
        #[arg(long)]
        resize: Option<String>,
        /// Rotate before encoding: a JSON options object
        #[arg(long)]
        rotate: Option<String>,
    },
    /// List available codecs and preprocessors
    Codecs,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pixpress=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Compress {
            inputs,
            suffix,
            output_dir,
            workers,
            max_optimizer_rounds,
            optimizer_butteraugli_target,
            job_timeout_secs,
            json,
            jpeg,
            png,
            resize,
            rotate,
        } => {
            let settings: BTreeMap<String, String> = [
                ("jpeg", jpeg),
                ("png", png),
                ("resize", resize),
                ("rotate", rotate),
            ]
            .into_iter()
            .filter_map(|(name, value)| value.map(|v| (name.to_string(), v)))
            .collect();

            info!(
                "Starting compress command for {:?}, output: {:?}, settings: {:?}",
                inputs, output_dir, settings
            );
            CompressCommand::new(CompressOptions {
                inputs,
                suffix,
                output_dir,
                workers,
                max_optimizer_rounds,
                optimizer_target: optimizer_butteraugli_target,
                job_timeout_secs,
                settings,
                json,
            })
            .execute()
            .await
        }
        Commands::Codecs => {
            CodecsCommand::new(Registry::builtin()).execute();
            Ok(())
        }
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
