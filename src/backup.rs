//! Header backups taken before any keyslot mutation.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::device::Device;
use crate::error::ConvertError;
use crate::mapping::OpenMapping;
use crate::volume::VolumeManager;

const BACKUP_SUFFIX: &str = "_header_backup.bin";

/// A header backup written and flushed to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderBackup {
    path: PathBuf,
}

impl HeaderBackup {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Writes header backups into one existing directory.
///
/// A backup left over from an earlier run is moved aside to the first free
/// `<name>.N` before the new one is taken, so no backup is ever overwritten.
#[derive(Debug, Clone)]
pub struct BackupManager {
    dir: PathBuf,
}

impl BackupManager {
    /// # Errors
    ///
    /// Returns [`ConvertError::MissingBackupDir`] if `dir` is not an existing directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, ConvertError> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(ConvertError::MissingBackupDir(dir));
        }
        Ok(Self { dir })
    }

    /// `<dir>/<device-basename>_header_backup.bin`
    pub fn path_for(&self, device: &Device) -> PathBuf {
        self.dir.join(format!("{}{BACKUP_SUFFIX}", device.basename()))
    }

    /// Backs up the header of the device behind `mapping`.
    ///
    /// The mapping must be open: the backup is taken while the device is
    /// unlocked with the passphrase the conversion will use.
    pub fn create(
        &self,
        volumes: &dyn VolumeManager,
        mapping: &OpenMapping<'_>,
    ) -> Result<HeaderBackup, ConvertError> {
        let device = mapping.device();
        let failed = |reason: String| ConvertError::BackupFailed {
            device: device.clone(),
            reason,
        };

        let path = self.path_for(device);
        if path.exists() {
            let rotated = self.rotate(&path).map_err(|e| {
                failed(format!("could not preserve existing backup {}: {e}", path.display()))
            })?;
            warn!(
                "Existing backup {} preserved as {}",
                path.display(),
                rotated.display()
            );
        }

        volumes
            .backup_header(device, mapping.name(), &path)
            .map_err(|e| failed(e.to_string()))?;

        let size = fs::metadata(&path)
            .map_err(|e| failed(format!("backup file {} missing: {e}", path.display())))?
            .len();
        if size == 0 {
            return Err(failed(format!("backup file {} is empty", path.display())));
        }

        sync_file_and_dir(&path).map_err(|e| failed(format!("fsync failed: {e}")))?;

        info!("Header of {device} backed up to {}", path.display());
        Ok(HeaderBackup { path })
    }

    fn rotate(&self, path: &Path) -> std::io::Result<PathBuf> {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let rotated = (1u32..)
            .map(|n| path.with_file_name(format!("{file_name}.{n}")))
            .find(|candidate| !candidate.exists())
            .unwrap_or_else(|| path.with_file_name(format!("{file_name}.old")));

        fs::rename(path, &rotated)?;
        Ok(rotated)
    }
}

fn sync_file_and_dir(path: &Path) -> std::io::Result<()> {
    File::open(path)?.sync_all()?;
    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}
