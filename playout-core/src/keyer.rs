//! External keyer control for fill/key outputs

use tracing::{debug, info, warn};

use crate::catalog;
use crate::error::{PlayoutError, Result};
use crate::hardware::{Device, FlagAttribute, HwError, Keyer};

/// Key level applied after enabling
pub const KEY_LEVEL_MAX: u8 = 255;

/// Owns the keyer handle of one playback session
pub struct KeyerController {
    keyer: Box<dyn Keyer>,
    enabled: bool,
}

impl std::fmt::Debug for KeyerController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyerController")
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// Whether the device reports external keying support
pub fn supports_external_keying(device: &dyn Device) -> bool {
    device
        .attributes()
        .ok()
        .and_then(|attributes| attributes.flag(FlagAttribute::SupportsExternalKeying).ok())
        .unwrap_or(false)
}

impl KeyerController {
    /// Acquire the keyer of a device that can key externally
    ///
    /// Nothing is enabled yet; the handle is released again on failure.
    pub fn acquire(device: &dyn Device) -> Result<Self> {
        let keyer = device.keyer().map_err(|e| match e {
            HwError::NoInterface => PlayoutError::KeyingUnsupported(catalog::device_id(device)),
            other => PlayoutError::hardware("QueryInterface(Keyer)", other),
        })?;

        if !supports_external_keying(device) {
            return Err(PlayoutError::KeyingUnsupported(catalog::device_id(device)));
        }
        debug!("Keyer acquired");
        Ok(Self { keyer, enabled: false })
    }

    /// Wrap an already acquired keyer
    pub fn from_keyer(keyer: Box<dyn Keyer>) -> Self {
        Self { keyer, enabled: false }
    }

    /// Enable external keying at full level
    ///
    /// Enable failing is fatal; the level failing is only logged.
    pub fn enable(&mut self) -> Result<()> {
        self.keyer
            .enable(true)
            .map_err(|e| PlayoutError::hardware("KeyerEnable", e))?;
        self.enabled = true;

        if let Err(e) = self.keyer.set_level(KEY_LEVEL_MAX) {
            warn!("Keyer SetLevel failed: {}", e);
        }
        info!("External keyer enabled");
        Ok(())
    }

    /// Disable keying if it was enabled
    pub fn disable(&mut self) {
        if !self.enabled {
            return;
        }
        if let Err(e) = self.keyer.disable() {
            warn!("Keyer disable failed: {}", e);
        }
        self.enabled = false;
    }

    /// Whether keying is currently on
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{Driver, HwCall, VirtualDeviceSpec, VirtualDriver};

    #[test]
    fn test_enable_sets_full_level() {
        let driver = VirtualDriver::new();
        let probe = driver.add_device(VirtualDeviceSpec::default());
        let device = driver.devices().unwrap().remove(0);

        let mut keyer = KeyerController::acquire(device.as_ref()).unwrap();
        keyer.enable().unwrap();
        let state = probe.keyer_state();
        assert!(state.enabled && state.external);
        assert_eq!(state.level, KEY_LEVEL_MAX);

        keyer.disable();
        assert!(!probe.keyer_state().enabled);
        assert!(probe.calls().contains(&HwCall::KeyerDisable));
    }

    #[test]
    fn test_level_failure_is_not_fatal() {
        let driver = VirtualDriver::new();
        let spec = VirtualDeviceSpec {
            keyer_level_fails: true,
            ..VirtualDeviceSpec::default()
        };
        driver.add_device(spec);
        let device = driver.devices().unwrap().remove(0);
        let mut keyer = KeyerController::acquire(device.as_ref()).unwrap();
        assert!(keyer.enable().is_ok());
        assert!(keyer.is_enabled());
    }

    #[test]
    fn test_requires_external_keying() {
        let driver = VirtualDriver::new();
        let probe = driver.add_device(VirtualDeviceSpec::default().with_external_keying(false));
        let device = driver.devices().unwrap().remove(0);
        let err = KeyerController::acquire(device.as_ref()).unwrap_err();
        assert!(matches!(err, PlayoutError::KeyingUnsupported(_)));
        assert!(!probe.keyer_state().enabled);
    }
}
