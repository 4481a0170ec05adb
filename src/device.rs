//! Target device resolution.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::ConvertError;
use crate::volume::VolumeManager;

/// Path to a block device expected to carry a LUKS header.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Device(PathBuf);

impl Device {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Final path component, used to key backup files.
    pub fn basename(&self) -> String {
        self.0
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.0.to_string_lossy().replace('/', "_"))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl From<&str> for Device {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<PathBuf> for Device {
    fn from(path: PathBuf) -> Self {
        Self(path)
    }
}

/// Builds the ordered list of devices for this session.
///
/// Explicit devices are used verbatim. Without them the host is enumerated for
/// LUKS signatures; an empty result is a precondition failure.
pub fn resolve(
    explicit: Vec<Device>,
    volumes: &dyn VolumeManager,
) -> Result<Vec<Device>, ConvertError> {
    if !explicit.is_empty() {
        debug!("Using {} explicitly supplied device(s)", explicit.len());
        return Ok(explicit);
    }

    let discovered = volumes.enumerate_encrypted_devices()?;
    if discovered.is_empty() {
        return Err(ConvertError::NoDevicesFound);
    }

    for device in &discovered {
        info!("Discovered LUKS device {device}");
    }
    Ok(discovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::fake::{Call, FakeVolumes};

    #[test]
    fn explicit_devices_are_used_verbatim() {
        let volumes = FakeVolumes::new().with_enumerated(&["/dev/sdz"]);
        let explicit = vec![Device::from("/dev/mapper/b"), Device::from("/dev/mapper/a")];

        let devices = resolve(explicit.clone(), &volumes).unwrap();

        assert_eq!(devices, explicit);
        assert!(volumes.calls().is_empty());
    }

    #[test]
    fn enumeration_keeps_discovery_order() {
        let volumes = FakeVolumes::new().with_enumerated(&["/dev/sdb2", "/dev/sda3"]);

        let devices = resolve(Vec::new(), &volumes).unwrap();

        assert_eq!(
            devices,
            vec![Device::from("/dev/sdb2"), Device::from("/dev/sda3")]
        );
        assert_eq!(volumes.calls(), vec![Call::Enumerate]);
    }

    #[test]
    fn empty_enumeration_is_a_precondition_failure() {
        let volumes = FakeVolumes::new();

        let err = resolve(Vec::new(), &volumes).unwrap_err();

        assert!(matches!(err, ConvertError::NoDevicesFound));
        assert!(err.is_precondition());
        assert!(!volumes.mutated());
    }

    #[test]
    fn basename_uses_last_component() {
        assert_eq!(Device::from("/dev/mapper/a").basename(), "a");
        assert_eq!(Device::from("/dev/nvme0n1p3").basename(), "nvme0n1p3");
    }
}
