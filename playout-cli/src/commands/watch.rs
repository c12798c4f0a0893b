//! Watch hotplug events command

use anyhow::Result;
use playout_core::{DeviceCatalog, DeviceWatch};
use tracing::info;

use super::{emit_line, shutdown_signal};

/// Print a snapshot, then one JSON line per hotplug event until a signal
pub async fn watch(catalog: &DeviceCatalog) -> Result<()> {
    let (mut watch, snapshot, mut events) = DeviceWatch::install(catalog)?;
    emit_line(&snapshot.to_json_line()?)?;
    info!("Watching for device changes");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => emit_line(&event.to_json_line()?)?,
                None => break,
            },
            signal = &mut shutdown => {
                info!("Received {}, stopping watch", signal?);
                break;
            }
        }
    }

    watch.uninstall();
    Ok(())
}
