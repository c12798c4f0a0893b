//! List devices command

use anyhow::{Context, Result};
use playout_core::DeviceCatalog;
use tracing::info;

use super::emit_line;

/// Print every device as one JSON array
pub fn list(catalog: &DeviceCatalog) -> Result<()> {
    let devices = catalog.enumerate();
    info!("Found {} devices via {}", devices.len(), catalog.driver().name());

    let json = serde_json::to_string(&devices).context("Failed to serialize device list")?;
    emit_line(&json)
}
