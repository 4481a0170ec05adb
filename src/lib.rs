//! Converts the key-derivation parameters of a LUKS2 keyslot to FIPS-compliant
//! values, taking a header backup first and reverting when the converted
//! keyslot no longer opens.

pub mod backup;
pub mod convert;
pub mod device;
pub mod error;
pub mod inspect;
pub mod kdf;
pub mod logging;
pub mod mapping;
pub mod session;
pub mod volume;

pub use crate::backup::{BackupManager, HeaderBackup};
pub use crate::convert::{ConversionRequest, Converter, Outcome, Passphrase, SessionResult, Stage};
pub use crate::device::Device;
pub use crate::error::{ConvertError, VolumeError};
pub use crate::inspect::KeyslotDescriptor;
pub use crate::kdf::KdfTarget;
pub use crate::mapping::{MappingNames, MappingRegistry};
pub use crate::session::{Prompter, Session, SessionOptions, SessionSummary};
pub use crate::volume::{SystemVolumeManager, VolumeManager};

use anyhow::Context;
use directories::ProjectDirs;
use std::path::PathBuf;

/// Default log file location under the platform state directory.
pub fn default_log_file() -> anyhow::Result<PathBuf> {
    let project_dirs = ProjectDirs::from("", "", "luks-fips-convert")
        .context("could not determine platform directories")?;

    let dir = project_dirs
        .state_dir()
        .unwrap_or_else(|| project_dirs.data_local_dir());

    Ok(dir.join("luks-fips-convert.log"))
}
