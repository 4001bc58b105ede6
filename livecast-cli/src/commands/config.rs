//! Config command - manage configuration files

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use livecast_core::config::{sample_config, ConfigFile};

/// Arguments for the config command
#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show the path to the config file
    Path,

    /// Show the effective settings
    Show,

    /// Validate the config file without streaming
    Check,

    /// Generate a default config file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Print a sample configuration to stdout
    Sample,
}

/// Run config subcommand
pub async fn config(args: ConfigArgs) -> Result<()> {
    let path = ConfigFile::default_path();

    match args.command {
        ConfigCommand::Path => {
            let state = if path.exists() { "exists" } else { "not created yet" };
            println!("{} ({})", path.display(), state);
        }
        ConfigCommand::Show => {
            if !path.exists() {
                println!("No config file at {}, showing defaults.", path.display());
                println!("Create one with: livecast config init\n");
            }
            let file = ConfigFile::load_from(path)?;
            print_effective(&file)?;
        }
        ConfigCommand::Check => {
            let file = ConfigFile::load_from(path.clone())?;
            file.video_config()?.validate_strict()?;
            if let Some(audio) = file.audio_config()? {
                audio.validate_strict()?;
            }
            file.session_config()?;
            println!("{}: OK", path.display());
        }
        ConfigCommand::Init { force } => {
            if path.exists() && !force {
                println!("Config file already exists: {}", path.display());
                println!("Use --force to overwrite it.");
                return Ok(());
            }

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).context("Failed to create config directory")?;
            }
            std::fs::write(&path, sample_config()).context("Failed to write config file")?;
            println!("Created {}", path.display());
        }
        ConfigCommand::Sample => {
            print!("{}", sample_config());
        }
    }

    Ok(())
}

fn print_effective(file: &ConfigFile) -> Result<()> {
    let video = file.video_config()?;
    let (width, height) = video.encoded_size();
    println!("Video:");
    println!("  Codec:      {} ({:?})", video.codec, video.preference);
    println!("  Resolution: {}x{} @ {} fps", width, height, video.fps);
    println!("  Bitrate:    {} kbps", video.bitrate / 1000);
    println!("  GOP:        {} frames", video.gop_length());

    println!("Audio:");
    match file.audio_config()? {
        Some(audio) => {
            println!("  Codec:       {:?}", audio.codec);
            println!("  Sample rate: {} Hz, {} ch", audio.sample_rate, audio.channels());
            println!("  Bitrate:     {} kbps", audio.bitrate / 1000);
        }
        None => println!("  disabled"),
    }

    let session = file.session_config()?;
    println!("Stream:");
    println!("  Transport:   {:?}", session.transport_mode);
    match session.retries {
        Some(n) => println!("  Retries:     {} every {:?}", n, file.retry_delay()),
        None => println!("  Retries:     unlimited every {:?}", file.retry_delay()),
    }
    println!("  Send cache:  {} samples", session.send_cache_size);
    if let Some(backup) = &file.stream.backup_url {
        println!("  Backup URL:  {}", livecast_core::stream::safe_url(backup));
    }

    println!("Record:");
    let directory = match file.record.directory.as_str() {
        "" => ".",
        dir => dir,
    };
    println!("  Directory:   {}", directory);
    println!("  Container:   {}", file.record.container);
    Ok(())
}
