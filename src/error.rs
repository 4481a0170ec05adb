use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::device::Device;

/// Failure reported by one of the host volume-management commands.
#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("{0}")]
    Command(String),

    #[error("{program} timed out after {seconds}s")]
    Timeout { program: String, seconds: u64 },

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("required command `{0}` not found in PATH")]
    MissingCommand(String),

    #[error("backup directory {} does not exist", .0.display())]
    MissingBackupDir(PathBuf),

    #[error("no LUKS devices found")]
    NoDevicesFound,

    #[error("invalid conversion target: {0}")]
    InvalidTarget(String),

    #[error("failed to inspect {device}: {reason}")]
    InspectionFailed { device: Device, reason: String },

    #[error("header backup for {device} failed: {reason}")]
    BackupFailed { device: Device, reason: String },

    #[error("passphrase for {0} cannot be empty")]
    EmptyPassphrase(Device),

    #[error("passphrases for {0} do not match")]
    PassphraseMismatch(Device),

    #[error("conversion of {device} failed: {reason}")]
    DeviceFailed { device: Device, reason: String },

    #[error(
        "revert of {device} failed; manual intervention required, restore the header from {}",
        .backup.display()
    )]
    RevertFailed { device: Device, backup: PathBuf },

    #[error("entropy source unavailable: {0}")]
    Entropy(String),

    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ConvertError {
    /// Returns `true` for errors raised before any device was touched.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            ConvertError::MissingCommand(_)
                | ConvertError::MissingBackupDir(_)
                | ConvertError::NoDevicesFound
        )
    }
}
