//! Device discovery and stable identifiers
//!
//! Every device is identified by a string that survives re-enumeration and,
//! where the hardware allows it, reboots. The same derivation is used for
//! listing and for lookup, so an id printed by `--list` always resolves.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{PlayoutError, Result};
use crate::hardware::{
    Device, Driver, FlagAttribute, IntAttribute, ProfileAttributes, StringAttribute, busy_flags,
    connection_mask, io_support,
};
use crate::types::{Connection, DeviceDescriptor};

/// Prefix of every stable id
pub const ID_PREFIX: &str = "decklink";

/// Replace every byte outside `[A-Za-z0-9_-]` with `_`
pub fn normalize_id_component(input: &str) -> String {
    input
        .bytes()
        .map(|b| {
            if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
                b as char
            } else {
                '_'
            }
        })
        .collect()
}

/// Derive the stable id of a device
///
/// First available wins: persistent id, device handle, topological id with
/// sub-device index, then the normalized display name.
pub fn stable_id(attributes: Option<&dyn ProfileAttributes>, display_name: &str) -> String {
    if let Some(attributes) = attributes {
        if let Ok(persistent) = attributes.int(IntAttribute::PersistentId)
            && persistent != 0
        {
            return format!("{}-pid-{:x}", ID_PREFIX, persistent);
        }

        if let Ok(handle) = attributes.string(StringAttribute::DeviceHandle)
            && !handle.is_empty()
        {
            return format!("{}-handle-{}", ID_PREFIX, normalize_id_component(&handle));
        }

        if let (Ok(topological), Ok(sub_device)) = (
            attributes.int(IntAttribute::TopologicalId),
            attributes.int(IntAttribute::SubDeviceIndex),
        ) {
            return format!("{}-topo-{:x}-sub-{}", ID_PREFIX, topological, sub_device);
        }
    }
    format!("{}-{}", ID_PREFIX, normalize_id_component(display_name))
}

fn display_name(device: &dyn Device) -> String {
    device.display_name().unwrap_or_default()
}

/// Stable id of a device handle
pub fn device_id(device: &dyn Device) -> String {
    stable_id(device.attributes().ok(), &display_name(device))
}

fn output_connections(attributes: &dyn ProfileAttributes) -> Vec<Connection> {
    let Ok(mask) = attributes.int(IntAttribute::VideoOutputConnections) else {
        return Vec::new();
    };
    let mut connections = Vec::new();
    if mask & (connection_mask::SDI | connection_mask::OPTICAL_SDI) != 0 {
        connections.push(Connection::Sdi);
    }
    if mask & connection_mask::HDMI != 0 {
        connections.push(Connection::Hdmi);
    }
    connections
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// Build the descriptor of one device
///
/// Each capability query that fails leaves its field at the safe default.
pub fn describe(device: &dyn Device) -> DeviceDescriptor {
    let display_name = display_name(device);
    let busy = device
        .busy_flags()
        .map(|flags| flags & busy_flags::PLAYBACK_BUSY != 0)
        .unwrap_or(false);

    let Ok(attributes) = device.attributes() else {
        debug!("{}: no attribute interface", display_name);
        return DeviceDescriptor {
            id: stable_id(None, &display_name),
            display_name,
            busy,
            ..DeviceDescriptor::default()
        };
    };

    DeviceDescriptor {
        id: stable_id(Some(attributes), &display_name),
        vendor: non_empty(attributes.string(StringAttribute::VendorName).ok()),
        model: non_empty(attributes.string(StringAttribute::ModelName).ok()),
        output_connections: output_connections(attributes),
        busy,
        supports_playback: attributes
            .int(IntAttribute::VideoIoSupport)
            .map(|io| io & io_support::PLAYBACK != 0)
            .unwrap_or(false),
        supports_external_keying: attributes
            .flag(FlagAttribute::SupportsExternalKeying)
            .unwrap_or(false),
        supports_internal_keying: attributes
            .flag(FlagAttribute::SupportsInternalKeying)
            .unwrap_or(false),
        display_name,
    }
}

/// Whether the device can route output to `connection`
///
/// `Unspecified` is always accepted; optical SDI counts as SDI.
pub fn supports_output_connection(device: &dyn Device, connection: Connection) -> bool {
    if connection == Connection::Unspecified {
        return true;
    }
    let Ok(attributes) = device.attributes() else {
        return false;
    };
    let Ok(mask) = attributes.int(IntAttribute::VideoOutputConnections) else {
        return false;
    };
    match connection {
        Connection::Sdi => mask & (connection_mask::SDI | connection_mask::OPTICAL_SDI) != 0,
        Connection::Hdmi => mask & connection_mask::HDMI != 0,
        Connection::Unspecified => true,
    }
}

/// Route the device's video output to `connection`
pub fn configure_output_connection(device: &dyn Device, connection: Connection) -> Result<()> {
    if connection == Connection::Unspecified {
        return Ok(());
    }
    device
        .set_output_connection(connection)
        .map_err(|e| PlayoutError::hardware("SetOutputConnection", e))
}

/// Enumerates the devices of one provider
#[derive(Clone)]
pub struct DeviceCatalog {
    driver: Arc<dyn Driver>,
}

impl DeviceCatalog {
    /// Catalog over `driver`
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self { driver }
    }

    /// The provider behind this catalog
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Describe every device once
    ///
    /// A provider that cannot iterate yields an empty list.
    pub fn enumerate(&self) -> Vec<DeviceDescriptor> {
        match self.driver.devices() {
            Ok(devices) => devices.iter().map(|d| describe(d.as_ref())).collect(),
            Err(e) => {
                warn!("{} device iterator could not be created: {}", self.driver.name(), e);
                Vec::new()
            }
        }
    }

    /// Re-enumerate and return the device whose stable id is `id`
    ///
    /// Every other handle is released before returning.
    pub fn find_by_id(&self, id: &str) -> Result<Box<dyn Device>> {
        let devices = self
            .driver
            .devices()
            .map_err(|e| PlayoutError::hardware("CreateIterator", e))?;
        devices
            .into_iter()
            .find(|device| device_id(device.as_ref()) == id)
            .ok_or_else(|| PlayoutError::DeviceNotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{HwError, HwResult};
    use std::collections::HashMap;

    #[derive(Default)]
    struct Attrs {
        ints: HashMap<IntAttribute, i64>,
        strings: HashMap<StringAttribute, String>,
    }

    impl ProfileAttributes for Attrs {
        fn int(&self, id: IntAttribute) -> HwResult<i64> {
            self.ints.get(&id).copied().ok_or(HwError::NotAvailable)
        }
        fn flag(&self, _id: FlagAttribute) -> HwResult<bool> {
            Err(HwError::NotAvailable)
        }
        fn string(&self, id: StringAttribute) -> HwResult<String> {
            self.strings.get(&id).cloned().ok_or(HwError::NotAvailable)
        }
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_id_component("DeckLink Duo 2 (1)"), "DeckLink_Duo_2__1_");
        assert_eq!(normalize_id_component("a-b_c9"), "a-b_c9");
        assert_eq!(normalize_id_component("é"), "__");
    }

    #[test]
    fn test_id_precedence() {
        let mut attrs = Attrs::default();
        attrs.ints.insert(IntAttribute::TopologicalId, 0x1f00);
        attrs.ints.insert(IntAttribute::SubDeviceIndex, 2);
        assert_eq!(stable_id(Some(&attrs), "Card"), "decklink-topo-1f00-sub-2");

        attrs
            .strings
            .insert(StringAttribute::DeviceHandle, "pci:0000:03/1".to_string());
        assert_eq!(stable_id(Some(&attrs), "Card"), "decklink-handle-pci_0000_03_1");

        attrs.ints.insert(IntAttribute::PersistentId, 0xabc);
        assert_eq!(stable_id(Some(&attrs), "Card"), "decklink-pid-abc");
    }

    #[test]
    fn test_zero_persistent_id_and_empty_handle_skipped() {
        let mut attrs = Attrs::default();
        attrs.ints.insert(IntAttribute::PersistentId, 0);
        attrs.strings.insert(StringAttribute::DeviceHandle, String::new());
        assert_eq!(stable_id(Some(&attrs), "Duo 2"), "decklink-Duo_2");
    }

    #[test]
    fn test_topology_needs_both_parts() {
        let mut attrs = Attrs::default();
        attrs.ints.insert(IntAttribute::TopologicalId, 5);
        assert_eq!(stable_id(Some(&attrs), "x"), "decklink-x");
        assert_eq!(stable_id(None, "x"), "decklink-x");
    }
}
