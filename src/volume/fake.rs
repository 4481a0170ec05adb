//! Recording `VolumeManager` used by unit tests.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use super::VolumeManager;
use crate::convert::Passphrase;
use crate::device::Device;
use crate::error::VolumeError;
use crate::kdf::KdfTarget;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Enumerate,
    Dump(Device),
    Open { device: Device, name: String },
    Close(String),
    Backup { device: Device, mapping: String },
    Convert { device: Device, slot: u8 },
    Revert { device: Device, slot: u8, backup: PathBuf },
    ListPartitions(Device),
}

#[derive(Default)]
pub(crate) struct FakeVolumes {
    enumerated: Vec<Device>,
    dumps: HashMap<Device, String>,
    calls: RefCell<Vec<Call>>,
    open_mappings: RefCell<HashSet<String>>,
    fail_open: bool,
    fail_backup: bool,
    fail_convert: bool,
    fail_verify: bool,
    fail_revert: bool,
    converted: Cell<bool>,
}

impl FakeVolumes {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_enumerated(mut self, devices: &[&str]) -> Self {
        self.enumerated = devices.iter().map(|d| Device::from(*d)).collect();
        self
    }

    pub(crate) fn with_dump(mut self, device: &str, dump: &str) -> Self {
        self.dumps.insert(Device::from(device), dump.to_string());
        self
    }

    pub(crate) fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub(crate) fn failing_backup(mut self) -> Self {
        self.fail_backup = true;
        self
    }

    pub(crate) fn failing_convert(mut self) -> Self {
        self.fail_convert = true;
        self
    }

    /// Opens succeed until a conversion has happened.
    pub(crate) fn failing_verify(mut self) -> Self {
        self.fail_verify = true;
        self
    }

    pub(crate) fn failing_revert(mut self) -> Self {
        self.fail_revert = true;
        self
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub(crate) fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls.borrow().iter().filter(|c| matches(c)).count()
    }

    /// Whether any header-mutating call was issued.
    pub(crate) fn mutated(&self) -> bool {
        self.count(|c| matches!(c, Call::Convert { .. } | Call::Revert { .. })) > 0
    }

    pub(crate) fn open_mappings(&self) -> Vec<String> {
        self.open_mappings.borrow().iter().cloned().collect()
    }

    fn record(&self, call: Call) {
        self.calls.borrow_mut().push(call);
    }
}

impl VolumeManager for FakeVolumes {
    fn enumerate_encrypted_devices(&self) -> Result<Vec<Device>, VolumeError> {
        self.record(Call::Enumerate);
        Ok(self.enumerated.clone())
    }

    fn dump_header(&self, device: &Device) -> Result<String, VolumeError> {
        self.record(Call::Dump(device.clone()));
        self.dumps.get(device).cloned().ok_or_else(|| {
            VolumeError::Command(format!("Device {device} is not a valid LUKS device."))
        })
    }

    fn open_mapping(
        &self,
        device: &Device,
        _passphrase: &Passphrase,
        name: &str,
    ) -> Result<(), VolumeError> {
        self.record(Call::Open {
            device: device.clone(),
            name: name.to_string(),
        });
        if self.fail_open || (self.fail_verify && self.converted.get()) {
            return Err(VolumeError::Command(
                "No key available with this passphrase.".into(),
            ));
        }
        self.open_mappings.borrow_mut().insert(name.to_string());
        Ok(())
    }

    fn close_mapping(&self, name: &str) -> Result<(), VolumeError> {
        self.record(Call::Close(name.to_string()));
        self.open_mappings.borrow_mut().remove(name);
        Ok(())
    }

    fn backup_header(
        &self,
        device: &Device,
        mapping: &str,
        destination: &Path,
    ) -> Result<(), VolumeError> {
        self.record(Call::Backup {
            device: device.clone(),
            mapping: mapping.to_string(),
        });
        if self.fail_backup {
            return Err(VolumeError::Command("disk full".into()));
        }
        fs::write(destination, format!("LUKS header of {device}"))?;
        Ok(())
    }

    fn convert_keyslot(
        &self,
        device: &Device,
        slot: u8,
        _target: &KdfTarget,
        _passphrase: &Passphrase,
    ) -> Result<(), VolumeError> {
        self.record(Call::Convert {
            device: device.clone(),
            slot,
        });
        if self.fail_convert {
            return Err(VolumeError::Command("keyslot conversion failed".into()));
        }
        self.converted.set(true);
        Ok(())
    }

    fn revert_keyslot_conversion(
        &self,
        device: &Device,
        slot: u8,
        backup: &Path,
    ) -> Result<(), VolumeError> {
        self.record(Call::Revert {
            device: device.clone(),
            slot,
            backup: backup.to_path_buf(),
        });
        if self.fail_revert {
            return Err(VolumeError::Command("header restore failed".into()));
        }
        self.converted.set(false);
        Ok(())
    }

    fn list_partitions(&self, device: &Device) -> Result<String, VolumeError> {
        self.record(Call::ListPartitions(device.clone()));
        Ok(format!("NAME SIZE\n{} 10G\n", device.basename()))
    }
}

/// LUKS2 JSON metadata with the given `(slot, type, kdf)` keyslots.
pub(crate) fn luks2_dump(slots: &[(u8, &str, &str)]) -> String {
    let keyslots: Vec<String> = slots
        .iter()
        .map(|(slot, kind, kdf)| {
            let kdf = match *kdf {
                "pbkdf2" => {
                    r#"{"type":"pbkdf2","hash":"sha256","iterations":2000,"salt":"c2FsdA=="}"#
                }
                other => {
                    return format!(
                        r#""{slot}":{{"type":"{kind}","key_size":64,"af":{{"type":"luks1","stripes":4000,"hash":"sha512"}},"kdf":{{"type":"{other}","time":4,"memory":1048576,"cpus":4,"salt":"c2FsdA=="}}}}"#
                    );
                }
            };
            format!(
                r#""{slot}":{{"type":"{kind}","key_size":64,"af":{{"type":"luks1","stripes":4000,"hash":"sha512"}},"kdf":{kdf}}}"#
            )
        })
        .collect();
    format!(
        r#"{{"keyslots":{{{}}},"tokens":{{}},"segments":{{}},"digests":{{}},"config":{{"json_size":"12288","keyslots_size":"16744448"}}}}"#,
        keyslots.join(",")
    )
}
