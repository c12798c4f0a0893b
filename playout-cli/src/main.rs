//! Playout helper CLI
//!
//! Drives broadcast output cards from rendered RGBA frames. Every mode prints
//! JSON on stdout; diagnostics go to stderr.
//!
//! # Usage
//!
//! ```bash
//! # List devices
//! playout-helper --list
//!
//! # Follow hotplug events
//! playout-helper --watch
//!
//! # Modes an output supports at 1080p25
//! playout-helper --list-modes --device <id> --output-port <id>-sdi --width 1920 --height 1080 --fps 25
//!
//! # Play frames from stdin
//! producer | playout-helper --playback --device <id> --output-port <id>-sdi \
//!     --width 1920 --height 1080 --fps 25 --pixel-format-priority 10bit_yuv,8bit_yuv
//! ```

mod commands;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use playout_core::{ConfigFile, DeviceCatalog, PlayoutError, hardware};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Playout helper - scheduled SDI/HDMI output of rendered frames
#[derive(Parser)]
#[command(name = "playout-helper")]
#[command(version)]
#[command(about = "Scheduled SDI/HDMI playout of rendered RGBA frames", long_about = None)]
#[command(group(
    ArgGroup::new("mode")
        .required(true)
        .args(["list", "watch", "list_modes", "playback"])
))]
struct Cli {
    /// Print the devices as a JSON array
    #[arg(long)]
    list: bool,

    /// Print a device snapshot, then one line per hotplug event
    #[arg(long)]
    watch: bool,

    /// Print the display modes of an output as a JSON array
    #[arg(long)]
    list_modes: bool,

    /// Play frames from stdin or a shared-memory bus
    #[arg(long)]
    playback: bool,

    /// Enable verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Config file (default: ~/.config/playout/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    output: commands::OutputArgs,

    #[command(flatten)]
    playback_args: commands::PlaybackArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version go to stdout and are not failures
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("playout_core={}", level).parse()?)
                .add_directive(format!("playout_helper={}", level).parse()?),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let result = run(cli).await;
    if let Err(e) = &result
        && let Some(hint) = e.downcast_ref::<PlayoutError>().and_then(PlayoutError::user_hint)
    {
        eprintln!("hint: {}", hint);
    }
    result
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => ConfigFile::load_from(path.clone())
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => ConfigFile::load()?,
    };
    let catalog = DeviceCatalog::new(hardware::open_driver(&config));

    if cli.list {
        commands::list(&catalog)
    } else if cli.watch {
        commands::watch(&catalog).await
    } else if cli.list_modes {
        commands::list_modes(&catalog, &cli.output)
    } else {
        commands::playback(catalog, &cli.output, &cli.playback_args, &config).await
    }
}
