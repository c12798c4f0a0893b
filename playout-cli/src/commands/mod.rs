//! CLI command implementations

mod list;
mod modes;
mod playback;
mod watch;

pub use list::list;
pub use modes::list_modes;
pub use playback::{PlaybackArgs, playback};
pub use watch::watch;

use anyhow::{Context, Result};
use clap::Args;
use std::io::Write;
use tokio::signal::{self, unix::SignalKind};

/// Device and output selection shared by `--list-modes` and `--playback`
#[derive(Args)]
pub struct OutputArgs {
    /// Stable device id from `--list`
    #[arg(long)]
    device: Option<String>,

    /// Output port: <device>-sdi, <device>-hdmi or <device>-sdi-a
    #[arg(long)]
    output_port: Option<String>,

    /// Frame width in pixels
    #[arg(long, default_value_t = 0)]
    width: u32,

    /// Frame height in pixels
    #[arg(long, default_value_t = 0)]
    height: u32,

    /// Frame rate, e.g. 25 or 29.97
    #[arg(long, default_value_t = 0.0)]
    fps: f64,

    /// Only list modes usable with keying enabled
    #[arg(long)]
    keying: bool,
}

/// Write one line to stdout and flush it so consumers see it immediately
pub(crate) fn emit_line(line: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", line).context("Failed to write to stdout")?;
    stdout.flush().context("Failed to flush stdout")?;
    Ok(())
}

/// Wait for SIGINT or SIGTERM and return the signal name
pub(crate) async fn shutdown_signal() -> Result<&'static str> {
    let mut terminate = signal::unix::signal(SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    tokio::select! {
        result = signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            Ok("SIGINT")
        }
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}
