//! livecast CLI
//!
//! Stream and record from the command line.
//!
//! # Usage
//!
//! ```bash
//! # Show available encoders
//! livecast info
//!
//! # Stream a test pattern to an RTMP server
//! livecast cast --url rtmp://live.example.com/app/key --preset 720p30
//!
//! # Record ten seconds to a file
//! livecast cast --record out.mp4 --duration 10
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use livecast_core::LivecastError;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// livecast - stream and record over RTMP, RTSP and SRT
#[derive(Parser)]
#[command(name = "livecast")]
#[command(version)]
#[command(about = "Stream and record over RTMP, RTSP and SRT", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream and/or record a test pattern
    Cast(commands::CastArgs),

    /// Manage the configuration file
    Config(commands::ConfigArgs),

    /// Show available encoders, protocols and presets
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("livecast_core={}", level).parse()?)
                .add_directive(format!("livecast_cli={}", level).parse()?),
        )
        .with_target(false)
        .init();

    let result = match cli.command {
        Commands::Cast(args) => commands::cast(args).await,
        Commands::Config(args) => commands::config(args).await,
        Commands::Info => commands::info().await,
    };

    if let Err(e) = &result {
        if let Some(hint) = e.downcast_ref::<LivecastError>().and_then(|e| e.user_hint()) {
            eprintln!("Hint: {}", hint);
        }
    }
    result
}
