//! Playback command - run one scheduled output session

use anyhow::{Context, Result};
use clap::Args;
use playout_core::{
    CancellationToken, Colorspace, ConfigFile, DeviceCatalog, PixelFormat, PlaybackConfig,
    PlaybackSession, Range,
    config::DefaultSettings,
    formats::parse_priority_list,
    session::open_ingest,
};
use tracing::{error, info, warn};

use super::{OutputArgs, emit_line, shutdown_signal};

/// Printed once the output is enabled and frames are accepted
const READY_LINE: &str = r#"{"type":"ready"}"#;

/// Arguments only `--playback` uses
#[derive(Args)]
pub struct PlaybackArgs {
    /// Fill port of a fill/key pair (<device>-sdi-a)
    #[arg(long)]
    fill_port: Option<String>,

    /// Key port of a fill/key pair (<device>-sdi-b)
    #[arg(long)]
    key_port: Option<String>,

    /// Single pixel format (8bit_yuv, 10bit_yuv, 8bit_argb, 8bit_bgra)
    #[arg(long, conflicts_with = "pixel_format_priority")]
    pixel_format: Option<String>,

    /// Comma-separated pixel formats to try in order
    #[arg(long)]
    pixel_format_priority: Option<String>,

    /// RGB sample range (full, legal)
    #[arg(long)]
    range: Option<String>,

    /// Colorspace (auto, rec601, rec709, rec2020)
    #[arg(long)]
    colorspace: Option<String>,

    /// Read frames from this shared-memory bus instead of stdin
    #[arg(long)]
    framebus_name: Option<String>,
}

/// Run a playback session until the producer stops or a signal arrives
pub async fn playback(
    catalog: DeviceCatalog,
    output: &OutputArgs,
    args: &PlaybackArgs,
    file: &ConfigFile,
) -> Result<()> {
    let config = build_config(output, args, &file.defaults)?;
    let cancel = CancellationToken::new();

    let signal_cancel = cancel.clone();
    let signals = tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(name) => {
                info!("Received {}, stopping playback", name);
                signal_cancel.cancel();
            }
            Err(e) => warn!("Signal handling unavailable: {:#}", e),
        }
    });

    let session_cancel = cancel.clone();
    let result = tokio::task::spawn_blocking(move || run_session(&catalog, &config, &session_cancel))
        .await
        .context("Playback task failed")?;

    signals.abort();
    result
}

fn run_session(catalog: &DeviceCatalog, config: &PlaybackConfig, cancel: &CancellationToken) -> Result<()> {
    config.validate()?;
    let ingest = open_ingest(config, cancel)?;
    let session = PlaybackSession::open(catalog, config)?;

    emit_line(READY_LINE)?;
    info!(
        "Playback ready on {} ({}, {} via {})",
        session.device_id(),
        session.mode().name.as_deref().unwrap_or("unknown"),
        session.mode().pixel_format,
        ingest.label()
    );

    let exit = session.run(ingest, cancel);
    let stats = session.shutdown();
    info!("Final playback stats: {}", stats);

    match exit {
        Ok(exit) => info!("Playback finished: {}", exit),
        Err(e) => error!("Frame ingest failed: {}", e),
    }
    Ok(())
}

/// Merge command-line flags over the config-file defaults
fn build_config(output: &OutputArgs, args: &PlaybackArgs, defaults: &DefaultSettings) -> Result<PlaybackConfig> {
    let mut config = PlaybackConfig::new(
        output.device.clone().unwrap_or_default(),
        output.width,
        output.height,
        output.fps,
    );
    config.output_port = output.output_port.clone();
    config.fill_port = args.fill_port.clone();
    config.key_port = args.key_port.clone();

    let priority = if let Some(format) = &args.pixel_format {
        vec![format.parse::<PixelFormat>()?]
    } else if let Some(list) = &args.pixel_format_priority {
        parse_priority_list(list)?
    } else {
        defaults.pixel_formats()?
    };

    let range = match &args.range {
        Some(value) => value.parse::<Range>()?,
        None => defaults.range,
    };

    let colorspace = match &args.colorspace {
        Some(value) => Colorspace::parse_override(value)?,
        None => defaults.colorspace_override()?,
    };

    config = config
        .with_pixel_format_priority(priority)
        .with_range(range)
        .with_colorspace(colorspace);
    if let Some(name) = &args.framebus_name {
        config = config.with_framebus(name.clone());
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        output: OutputArgs,
        #[command(flatten)]
        playback: PlaybackArgs,
    }

    fn parse(args: &[&str]) -> TestCli {
        TestCli::try_parse_from(std::iter::once("playout-helper").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_flags_override_defaults() {
        let cli = parse(&[
            "--device", "decklink-1000", "--output-port", "decklink-1000-sdi",
            "--width", "1920", "--height", "1080", "--fps", "25",
            "--pixel-format", "yuv10", "--range", "full",
        ]);
        let defaults = DefaultSettings {
            pixel_format_priority: Some("8bit_bgra".to_string()),
            colorspace: "rec709".to_string(),
            ..DefaultSettings::default()
        };
        let config = build_config(&cli.output, &cli.playback, &defaults).unwrap();
        assert_eq!(config.pixel_format_priority, vec![PixelFormat::Yuv10]);
        assert_eq!(config.range, Range::Full);
        assert_eq!(config.colorspace, Some(Colorspace::Rec709));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults_fill_missing_flags() {
        let cli = parse(&["--device", "d", "--fill-port", "d-sdi-a", "--key-port", "d-sdi-b"]);
        let defaults = DefaultSettings {
            pixel_format_priority: Some("10bit_yuv,8bit_yuv".to_string()),
            ..DefaultSettings::default()
        };
        let config = build_config(&cli.output, &cli.playback, &defaults).unwrap();
        assert_eq!(config.pixel_format_priority, vec![PixelFormat::Yuv10, PixelFormat::Yuv8]);
        assert_eq!(config.range, Range::Legal);
        assert_eq!(config.colorspace, None);
        assert!(config.output_target().unwrap().is_keying());
    }

    #[test]
    fn test_bad_labels_are_errors() {
        let defaults = DefaultSettings::default();
        let cli = parse(&["--pixel-format-priority", "8bit_yuv,rgb565"]);
        assert!(build_config(&cli.output, &cli.playback, &defaults).is_err());
        let cli = parse(&["--range", "studio"]);
        assert!(build_config(&cli.output, &cli.playback, &defaults).is_err());
        let cli = parse(&["--colorspace", "p3"]);
        assert!(build_config(&cli.output, &cli.playback, &defaults).is_err());
    }

    #[test]
    fn test_single_format_conflicts_with_priority() {
        let result = TestCli::try_parse_from([
            "playout-helper", "--pixel-format", "yuv8", "--pixel-format-priority", "yuv10",
        ]);
        assert!(result.is_err());
    }
}
