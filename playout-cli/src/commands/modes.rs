//! List display modes command

use anyhow::{Context, Result};
use playout_core::{DeviceCatalog, ModeListConfig, modes};

use super::{OutputArgs, emit_line};

/// Print the modes an output supports as one JSON array
pub fn list_modes(catalog: &DeviceCatalog, args: &OutputArgs) -> Result<()> {
    let config = ModeListConfig::new(
        args.device.clone().unwrap_or_default(),
        args.output_port.clone().unwrap_or_default(),
    )
    .with_size(args.width, args.height)
    .with_fps(args.fps)
    .with_keying(args.keying);

    let modes = modes::list_modes(catalog, &config)?;
    let json = serde_json::to_string(&modes).context("Failed to serialize mode list")?;
    emit_line(&json)
}
