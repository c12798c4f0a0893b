//! Hotplug notification watcher
//!
//! The watcher is the only component that keeps hardware device handles
//! across calls: every arrival is retained in an ownership table keyed by
//! identity until the matching removal, so the removal event can carry the
//! last known descriptor. Events are handed to async consumers over an
//! unbounded channel because notifications arrive on the provider's thread.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::catalog::{self, DeviceCatalog};
use crate::error::{PlayoutError, Result};
use crate::hardware::{Device, DeviceIdentity, DeviceNotificationSink, Driver};
use crate::types::DeviceDescriptor;

/// One line of `--watch` output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WatchEvent {
    /// Snapshot printed once after install
    Devices {
        /// Every device present
        devices: Vec<DeviceDescriptor>,
    },
    /// A device arrived
    DeviceAdded {
        /// The new device
        devices: Vec<DeviceDescriptor>,
    },
    /// A device went away
    DeviceRemoved {
        /// Last known descriptor of the device
        devices: Vec<DeviceDescriptor>,
    },
}

impl WatchEvent {
    /// Serialize as one JSON line without the trailing newline
    pub fn to_json_line(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| PlayoutError::config(format!("Failed to serialize watch event: {}", e)))
    }
}

struct Retained {
    // Held only to keep the device reference alive until removal
    _device: Box<dyn Device>,
    descriptor: DeviceDescriptor,
}

/// Notification sink that owns every announced device until it is removed
pub struct NotificationWatcher {
    devices: Mutex<HashMap<DeviceIdentity, Retained>>,
    events: mpsc::UnboundedSender<WatchEvent>,
}

impl NotificationWatcher {
    /// Create a watcher and the receiving end of its event channel
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<WatchEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let watcher = Arc::new(Self {
            devices: Mutex::new(HashMap::new()),
            events,
        });
        (watcher, rx)
    }

    /// Devices currently retained
    pub fn retained(&self) -> usize {
        self.devices.lock().len()
    }

    /// Descriptors of the retained devices
    pub fn descriptors(&self) -> Vec<DeviceDescriptor> {
        self.devices.lock().values().map(|r| r.descriptor.clone()).collect()
    }

    /// Release every retained device
    pub fn release_all(&self) {
        let released: Vec<_> = self.devices.lock().drain().collect();
        debug!("Released {} retained devices", released.len());
    }

    fn emit(&self, event: WatchEvent) {
        if self.events.send(event).is_err() {
            debug!("Watch event dropped, receiver closed");
        }
    }
}

impl DeviceNotificationSink for NotificationWatcher {
    fn device_arrived(&self, device: Box<dyn Device>) {
        let descriptor = catalog::describe(device.as_ref());
        info!("Device added: {}", descriptor);
        let identity = device.identity();
        let replaced = self.devices.lock().insert(
            identity,
            Retained {
                _device: device,
                descriptor: descriptor.clone(),
            },
        );
        if replaced.is_some() {
            warn!("Device {:?} announced twice", identity);
        }
        self.emit(WatchEvent::DeviceAdded {
            devices: vec![descriptor],
        });
    }

    fn device_removed(&self, identity: DeviceIdentity) {
        let Some(retained) = self.devices.lock().remove(&identity) else {
            warn!("Removal of unknown device {:?} ignored", identity);
            return;
        };
        info!("Device removed: {}", retained.descriptor);
        self.emit(WatchEvent::DeviceRemoved {
            devices: vec![retained.descriptor],
        });
    }
}

/// Installed hotplug notifications; uninstalls on drop
pub struct DeviceWatch {
    driver: Arc<dyn Driver>,
    watcher: Arc<NotificationWatcher>,
    installed: bool,
}

impl DeviceWatch {
    /// Install notifications on the catalog's provider
    ///
    /// Returns the initial snapshot event and the channel carrying every
    /// later event.
    pub fn install(catalog: &DeviceCatalog) -> Result<(Self, WatchEvent, mpsc::UnboundedReceiver<WatchEvent>)> {
        let driver = catalog.driver().clone();
        let (watcher, rx) = NotificationWatcher::new();
        driver
            .install_device_notifications(watcher.clone())
            .map_err(|e| PlayoutError::hardware("InstallDeviceNotifications", e))?;

        let snapshot = WatchEvent::Devices {
            devices: catalog.enumerate(),
        };
        Ok((
            Self {
                driver,
                watcher,
                installed: true,
            },
            snapshot,
            rx,
        ))
    }

    /// The watcher behind this installation
    pub fn watcher(&self) -> &Arc<NotificationWatcher> {
        &self.watcher
    }

    /// Stop notifications and release every retained device
    pub fn uninstall(&mut self) {
        if !self.installed {
            return;
        }
        if let Err(e) = self.driver.uninstall_device_notifications() {
            warn!("UninstallDeviceNotifications failed: {}", e);
        }
        self.watcher.release_all();
        self.installed = false;
    }
}

impl Drop for DeviceWatch {
    fn drop(&mut self) {
        self.uninstall();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{VirtualDeviceSpec, VirtualDriver};

    #[test]
    fn test_event_json_shape() {
        let event = WatchEvent::DeviceAdded {
            devices: vec![DeviceDescriptor {
                id: "decklink-x".to_string(),
                ..DeviceDescriptor::default()
            }],
        };
        let line = event.to_json_line().unwrap();
        assert!(line.starts_with(r#"{"type":"device_added","devices":[{"id":"decklink-x""#));

        let snapshot = WatchEvent::Devices { devices: Vec::new() };
        assert_eq!(snapshot.to_json_line().unwrap(), r#"{"type":"devices","devices":[]}"#);
    }

    #[test]
    fn test_unknown_removal_emits_nothing() {
        let (watcher, mut rx) = NotificationWatcher::new();
        watcher.device_removed(DeviceIdentity(42));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_uninstall_releases_devices() {
        let driver = VirtualDriver::new();
        driver.add_device(VirtualDeviceSpec::default());
        let catalog = DeviceCatalog::new(Arc::new(driver.clone()));
        let (mut watch, _snapshot, _rx) = DeviceWatch::install(&catalog).unwrap();
        assert_eq!(watch.watcher().retained(), 1);
        watch.uninstall();
        assert_eq!(watch.watcher().retained(), 0);
        assert!(!driver.has_notification_sink());
    }
}
