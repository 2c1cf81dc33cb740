//! Cadence CLI - Headless driver for the playback core
//!
//! Features:
//! - Protocol resolution of URLs and catalogs
//! - Manifest inspection
//! - Load policy decision tables
//! - Headless playback sessions with event tracing

use anyhow::Context;
use cadence_core::EngineConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

/// Cadence CLI - Adaptive playback toolkit
#[derive(Parser)]
#[command(name = "cadence")]
#[command(version)]
#[command(about = "Adaptive playback core driver", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Engine configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output format (text, json, table)
    #[arg(short, long, global = true, default_value = "text")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve the protocol of a stream
    Resolve {
        /// Manifest or media URL
        url: String,

        /// Fallback HLS playlist URL
        #[arg(long)]
        playlist: Option<String>,

        /// Protocol hint (dash, hls, ss, progressive)
        #[arg(long)]
        hint: Option<String>,

        /// Sniff the first bytes when the URL is not conclusive
        #[arg(long)]
        sniff: bool,
    },

    /// Parse a manifest and list its representations
    Inspect {
        /// URL or path to manifest
        manifest: String,

        /// Base URL for relative URIs of a local file
        #[arg(long)]
        base_url: Option<String>,

        /// Manifest protocol; detected when omitted
        #[arg(long)]
        protocol: Option<String>,
    },

    /// Show load policy decisions for a failure
    Policy {
        /// HTTP status of the failure
        #[arg(long, conflicts_with_all = ["io", "parse"])]
        status: Option<u16>,

        /// Transport-level failure
        #[arg(long)]
        io: bool,

        /// Malformed manifest failure
        #[arg(long)]
        parse: bool,

        /// Server message carried by the failure
        #[arg(short, long, default_value = "")]
        message: String,

        /// Number of consecutive attempts to evaluate
        #[arg(short, long, default_value = "12")]
        attempts: u32,

        /// Adapter whose policy is evaluated
        #[arg(short, long, default_value = "dash")]
        protocol: String,
    },

    /// Open a stream in a headless session and trace its events
    Play {
        /// Manifest or media URL
        url: String,

        /// Fallback HLS playlist URL
        #[arg(long)]
        playlist: Option<String>,

        /// Seconds to keep the session running
        #[arg(short, long, default_value = "10")]
        seconds: u64,

        /// Playback speed
        #[arg(long, default_value = "1.0")]
        speed: f32,

        /// Start paused
        #[arg(long)]
        paused: bool,
    },
}

fn init_tracing(verbose: bool, json: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);
    cadence_core::init();

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Resolve { url, playlist, hint, sniff } => {
            commands::resolve(&config, &url, playlist.as_deref(), hint.as_deref(), sniff, &cli.format).await?;
        }
        Commands::Inspect { manifest, base_url, protocol } => {
            commands::inspect(&config, &manifest, base_url.as_deref(), protocol.as_deref(), &cli.format).await?;
        }
        Commands::Policy { status, io, parse, message, attempts, protocol } => {
            let failure = commands::failure_from_args(status, io, parse, &message)?;
            commands::policy(&config, failure, attempts, &protocol, &cli.format)?;
        }
        Commands::Play { url, playlist, seconds, speed, paused } => {
            commands::play(config, &url, playlist.as_deref(), seconds, speed, paused, &cli.format).await?;
        }
    }

    Ok(())
}
