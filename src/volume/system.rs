//! `VolumeManager` backed by the host `cryptsetup`, `blkid` and `lsblk`.

use std::path::Path;
use std::time::Duration;

use tracing::debug;

use super::VolumeManager;
use super::command::{HostCommand, Output};
use crate::convert::Passphrase;
use crate::device::Device;
use crate::error::{ConvertError, VolumeError};
use crate::kdf::KdfTarget;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// `blkid` exits with 2 when no device matched the token.
const BLKID_NOTHING_FOUND: i32 = 2;

#[derive(Debug, Clone)]
pub struct SystemVolumeManager {
    cryptsetup: HostCommand,
    blkid: HostCommand,
    lsblk: HostCommand,
}

impl SystemVolumeManager {
    /// Resolves every required tool on `PATH`.
    pub fn locate(timeout: Duration) -> Result<Self, ConvertError> {
        let find = |name: &str| {
            which::which(name)
                .map(|path| HostCommand::new(path, timeout))
                .map_err(|_| ConvertError::MissingCommand(name.to_string()))
        };

        let manager = Self {
            cryptsetup: find("cryptsetup")?,
            blkid: find("blkid")?,
            lsblk: find("lsblk")?,
        };
        debug!(
            "Using {}, {}, {}",
            manager.cryptsetup.binary().display(),
            manager.blkid.binary().display(),
            manager.lsblk.binary().display()
        );
        Ok(manager)
    }

    fn run_cryptsetup(
        &self,
        args: &[&str],
        input: Option<&[u8]>,
        describe: impl FnOnce(&str) -> String,
    ) -> Result<Output, VolumeError> {
        checked(self.cryptsetup.run(args, input)?, describe)
    }

    /// Header writes are not bounded by the timeout: killing cryptsetup halfway
    /// through would leave the header in an unknown state.
    fn mutate_header(
        &self,
        args: &[&str],
        input: Option<&[u8]>,
        describe: impl FnOnce(&str) -> String,
    ) -> Result<Output, VolumeError> {
        checked(self.cryptsetup.run_to_completion(args, input)?, describe)
    }
}

fn checked(out: Output, describe: impl FnOnce(&str) -> String) -> Result<Output, VolumeError> {
    if out.success() {
        return Ok(out);
    }
    Err(VolumeError::Command(format!(
        "{} (exit code {})",
        describe(&out.diagnostic()),
        out.status
    )))
}

impl VolumeManager for SystemVolumeManager {
    fn enumerate_encrypted_devices(&self) -> Result<Vec<Device>, VolumeError> {
        let out = self.blkid.run(&["-t", "TYPE=crypto_LUKS", "-o", "device"], None)?;
        if out.status == BLKID_NOTHING_FOUND {
            return Ok(Vec::new());
        }
        if !out.success() {
            return Err(VolumeError::Command(format!(
                "blkid device discovery failed: {} (exit code {})",
                out.diagnostic(),
                out.status
            )));
        }
        Ok(parse_device_list(&out.stdout))
    }

    fn dump_header(&self, device: &Device) -> Result<String, VolumeError> {
        let path = device.path().to_string_lossy();
        let out = self.run_cryptsetup(
            &["luksDump", "--dump-json-metadata", &*path],
            None,
            |diagnostic| classify_failure("dump the header of", device, diagnostic),
        )?;
        Ok(out.stdout)
    }

    fn open_mapping(
        &self,
        device: &Device,
        passphrase: &Passphrase,
        name: &str,
    ) -> Result<(), VolumeError> {
        let path = device.path().to_string_lossy();
        self.run_cryptsetup(
            &[
                "open",
                "--type",
                "luks2",
                "--batch-mode",
                "--key-file",
                "-",
                &*path,
                name,
            ],
            Some(passphrase.as_bytes()),
            |diagnostic| classify_failure(&format!("open mapping `{name}` for"), device, diagnostic),
        )?;
        Ok(())
    }

    fn close_mapping(&self, name: &str) -> Result<(), VolumeError> {
        let out = self.cryptsetup.run(&["close", name], None)?;
        if out.success() {
            return Ok(());
        }

        let diagnostic = out.diagnostic();
        let lower = diagnostic.to_ascii_lowercase();
        if lower.contains("does not exist")
            || lower.contains("doesn't exist")
            || lower.contains("not active")
        {
            return Ok(());
        }

        Err(VolumeError::Command(format!(
            "cryptsetup failed to close mapping `{name}`: {diagnostic} (exit code {})",
            out.status
        )))
    }

    fn backup_header(
        &self,
        device: &Device,
        mapping: &str,
        destination: &Path,
    ) -> Result<(), VolumeError> {
        debug!("Backing up header of {device} while mapping `{mapping}` is active");
        let path = device.path().to_string_lossy();
        let destination = destination.to_string_lossy();
        self.run_cryptsetup(
            &[
                "luksHeaderBackup",
                "--batch-mode",
                &*path,
                "--header-backup-file",
                &*destination,
            ],
            None,
            |diagnostic| classify_failure("back up the header of", device, diagnostic),
        )?;
        Ok(())
    }

    fn convert_keyslot(
        &self,
        device: &Device,
        slot: u8,
        target: &KdfTarget,
        passphrase: &Passphrase,
    ) -> Result<(), VolumeError> {
        let path = device.path().to_string_lossy();
        let slot = slot.to_string();
        let iterations = target.iterations().to_string();
        self.mutate_header(
            &[
                "luksConvertKey",
                "--batch-mode",
                "--key-file",
                "-",
                "--key-slot",
                slot.as_str(),
                "--pbkdf",
                target.pbkdf(),
                "--hash",
                target.hash(),
                "--pbkdf-force-iterations",
                iterations.as_str(),
                &*path,
            ],
            Some(passphrase.as_bytes()),
            |diagnostic| classify_failure(&format!("convert keyslot {slot} of"), device, diagnostic),
        )?;
        Ok(())
    }

    fn revert_keyslot_conversion(
        &self,
        device: &Device,
        slot: u8,
        backup: &Path,
    ) -> Result<(), VolumeError> {
        debug!(
            "Reverting keyslot {slot} of {device} from {}",
            backup.display()
        );
        let path = device.path().to_string_lossy();
        let backup = backup.to_string_lossy();
        self.mutate_header(
            &[
                "luksHeaderRestore",
                "--batch-mode",
                &*path,
                "--header-backup-file",
                &*backup,
            ],
            None,
            |diagnostic| classify_failure("restore the header of", device, diagnostic),
        )?;
        Ok(())
    }

    fn list_partitions(&self, device: &Device) -> Result<String, VolumeError> {
        let path = device.path().to_string_lossy();
        let out = self
            .lsblk
            .run(&["-o", "NAME,SIZE,TYPE,FSTYPE,MOUNTPOINT", &*path], None)?;
        if !out.success() {
            return Err(VolumeError::Command(format!(
                "lsblk failed for {device}: {}",
                out.diagnostic()
            )));
        }
        Ok(out.stdout)
    }
}

fn parse_device_list(stdout: &str) -> Vec<Device> {
    let mut devices: Vec<Device> = Vec::new();
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let device = Device::from(line);
        if !devices.contains(&device) {
            devices.push(device);
        }
    }
    devices
}

/// Turns cryptsetup's stderr into a message that says what to check next.
fn classify_failure(action: &str, device: &Device, diagnostic: &str) -> String {
    let lower = diagnostic.to_ascii_lowercase();

    if lower.contains("no key available")
        || lower.contains("wrong key")
        || lower.contains("passphrase is incorrect")
        || lower.contains("invalid passphrase")
    {
        return format!(
            "cryptsetup could not {action} {device}: {diagnostic}. The passphrase does not unlock any keyslot"
        );
    }

    if lower.contains("permission denied")
        || lower.contains("operation not permitted")
        || lower.contains("not permitted")
    {
        return format!(
            "cryptsetup could not {action} {device}: {diagnostic}. This requires root privileges"
        );
    }

    if lower.contains("no such file")
        || lower.contains("does not exist")
        || lower.contains("cannot open device")
    {
        return format!(
            "cryptsetup could not {action} {device}: {diagnostic}. Confirm the device path is correct and present"
        );
    }

    if lower.contains("not a valid luks device") || lower.contains("is not a luks device") {
        return format!("cryptsetup could not {action} {device}: {diagnostic}. Not a LUKS device");
    }

    format!("cryptsetup failed to {action} {device}: {diagnostic}")
}
