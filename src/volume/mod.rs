//! Host volume-management capabilities.
//!
//! Everything that touches a real header goes through [`VolumeManager`], so the
//! conversion logic can run against the system tools or a recording fake.

mod command;
mod system;

#[cfg(test)]
pub(crate) mod fake;

use std::path::Path;

use crate::convert::Passphrase;
use crate::device::Device;
use crate::error::VolumeError;
use crate::kdf::KdfTarget;

pub use system::{DEFAULT_TIMEOUT, SystemVolumeManager};

pub trait VolumeManager {
    /// Block devices carrying a LUKS signature, in discovery order.
    fn enumerate_encrypted_devices(&self) -> Result<Vec<Device>, VolumeError>;

    /// Structured (JSON) header metadata for `device`.
    fn dump_header(&self, device: &Device) -> Result<String, VolumeError>;

    fn open_mapping(
        &self,
        device: &Device,
        passphrase: &Passphrase,
        name: &str,
    ) -> Result<(), VolumeError>;

    /// Idempotent: closing a mapping that is not active succeeds.
    fn close_mapping(&self, name: &str) -> Result<(), VolumeError>;

    fn backup_header(
        &self,
        device: &Device,
        mapping: &str,
        destination: &Path,
    ) -> Result<(), VolumeError>;

    fn convert_keyslot(
        &self,
        device: &Device,
        slot: u8,
        target: &KdfTarget,
        passphrase: &Passphrase,
    ) -> Result<(), VolumeError>;

    /// Undo a conversion of `slot`, restoring from the backup taken before it.
    fn revert_keyslot_conversion(
        &self,
        device: &Device,
        slot: u8,
        backup: &Path,
    ) -> Result<(), VolumeError>;

    /// Human-readable partition listing, for display only.
    fn list_partitions(&self, device: &Device) -> Result<String, VolumeError>;
}
