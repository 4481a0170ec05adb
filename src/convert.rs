//! Per-device keyslot conversion.
//!
//! One run drives a device through
//! `Opened -> BackedUp -> Converting -> Verifying -> Converted`, or from
//! `Verifying` through `Reverting` to `Reverted`/`Failed`. The header is
//! mutated at most once per run, and never before a backup exists.

use std::fmt;

use tracing::{error, info, warn};
use zeroize::Zeroizing;

use crate::backup::{BackupManager, HeaderBackup};
use crate::device::Device;
use crate::error::ConvertError;
use crate::inspect::MAX_SLOT;
use crate::kdf::KdfTarget;
use crate::mapping::{MappingNames, MappingRegistry, OpenMapping};
use crate::volume::VolumeManager;

/// A confirmed, non-empty passphrase.
pub struct Passphrase(Zeroizing<String>);

impl Passphrase {
    pub fn confirmed(
        device: &Device,
        entered: Zeroizing<String>,
        confirmation: Zeroizing<String>,
    ) -> Result<Self, ConvertError> {
        if entered.is_empty() {
            return Err(ConvertError::EmptyPassphrase(device.clone()));
        }
        if entered != confirmation {
            return Err(ConvertError::PassphraseMismatch(device.clone()));
        }
        Ok(Self(entered))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

/// Everything one conversion run needs.
#[derive(Debug)]
pub struct ConversionRequest {
    device: Device,
    slot: u8,
    target: KdfTarget,
    passphrase: Passphrase,
    dry_run: bool,
}

impl ConversionRequest {
    pub fn new(
        device: Device,
        slot: u8,
        target: KdfTarget,
        passphrase: Passphrase,
        dry_run: bool,
    ) -> Result<Self, ConvertError> {
        if slot > MAX_SLOT {
            return Err(ConvertError::InvalidTarget(format!(
                "keyslot {slot} is out of range 0-{MAX_SLOT}"
            )));
        }
        target.validate()?;
        Ok(Self {
            device,
            slot,
            target,
            passphrase,
            dry_run,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn slot(&self) -> u8 {
        self.slot
    }

    pub fn target(&self) -> &KdfTarget {
        &self.target
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Opened,
    BackedUp,
    Converting,
    Verifying,
    Reverting,
    Converted,
    Reverted,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Opened => "Opened",
            Stage::BackedUp => "BackedUp",
            Stage::Converting => "Converting",
            Stage::Verifying => "Verifying",
            Stage::Reverting => "Reverting",
            Stage::Converted => "Converted",
            Stage::Reverted => "Reverted",
            Stage::Failed => "Failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Converted,
    Reverted,
    AbortedByUser,
    Failed,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Outcome::Converted => "Converted",
            Outcome::Reverted => "Reverted",
            Outcome::AbortedByUser => "Aborted by user",
            Outcome::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Result of processing one device.
#[derive(Debug, Clone)]
pub struct SessionResult {
    pub device: Device,
    pub outcome: Outcome,
    pub reason: String,
    pub stages: Vec<Stage>,
    pub backup: Option<HeaderBackup>,
    pub manual_intervention: bool,
}

impl SessionResult {
    pub fn aborted_by_user(device: Device) -> Self {
        Self {
            device,
            outcome: Outcome::AbortedByUser,
            reason: "not confirmed".to_string(),
            stages: Vec::new(),
            backup: None,
            manual_intervention: false,
        }
    }

    /// Converted and Aborted-by-user are the outcomes a session may end on successfully.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Converted | Outcome::AbortedByUser)
    }
}

/// Progress of a single run; every transition is logged as it happens.
struct Run {
    device: Device,
    stages: Vec<Stage>,
    backup: Option<HeaderBackup>,
}

impl Run {
    fn new(device: &Device) -> Self {
        Self {
            device: device.clone(),
            stages: Vec::new(),
            backup: None,
        }
    }

    fn enter(&mut self, stage: Stage, detail: impl fmt::Display) {
        info!("{}: {stage} - {detail}", self.device);
        self.stages.push(stage);
    }

    fn finish(mut self, outcome: Outcome, reason: impl Into<String>) -> SessionResult {
        let reason = reason.into();
        let terminal = match outcome {
            Outcome::Converted => Stage::Converted,
            Outcome::Reverted => Stage::Reverted,
            Outcome::AbortedByUser | Outcome::Failed => Stage::Failed,
        };
        if outcome == Outcome::Converted {
            self.enter(terminal, &reason);
        } else {
            error!("{}: {terminal} - {reason}", self.device);
            self.stages.push(terminal);
        }

        SessionResult {
            device: self.device,
            outcome,
            reason,
            stages: self.stages,
            backup: self.backup,
            manual_intervention: false,
        }
    }
}

/// Drives a single device's keyslot through the conversion stages.
pub struct Converter<'a> {
    volumes: &'a dyn VolumeManager,
    backups: &'a BackupManager,
    registry: &'a MappingRegistry,
    names: &'a mut MappingNames,
}

impl<'a> Converter<'a> {
    pub fn new(
        volumes: &'a dyn VolumeManager,
        backups: &'a BackupManager,
        registry: &'a MappingRegistry,
        names: &'a mut MappingNames,
    ) -> Self {
        Self {
            volumes,
            backups,
            registry,
            names,
        }
    }

    /// Runs every stage for one device.
    ///
    /// A conversion that reported an error is `Failed` even when the device
    /// still opens afterwards, since its keyslot parameters are then unknown.
    pub fn run(&mut self, request: &ConversionRequest) -> SessionResult {
        let device = request.device();
        let mut run = Run::new(device);

        let name = self.names.next_name();
        let mapping = match OpenMapping::open(
            self.volumes,
            self.registry,
            device,
            &request.passphrase,
            name,
        ) {
            Ok(mapping) => mapping,
            Err(e) => return run.finish(Outcome::Failed, format!("failed to open device: {e}")),
        };
        run.enter(Stage::Opened, format_args!("mapped as {}", mapping.name()));

        let backup = match self.backups.create(self.volumes, &mapping) {
            Ok(backup) => backup,
            Err(e) => {
                mapping.close();
                return run.finish(Outcome::Failed, format!("{e}; keyslot left untouched"));
            }
        };
        run.enter(
            Stage::BackedUp,
            format_args!("header saved to {}", backup.path().display()),
        );
        let backup_path = backup.path().to_path_buf();
        run.backup = Some(backup);

        let target = request.target();
        run.enter(
            Stage::Converting,
            format_args!(
                "keyslot {} to {}/{} with {} iterations",
                request.slot(),
                target.pbkdf(),
                target.hash(),
                target.iterations()
            ),
        );
        if request.dry_run() {
            mapping.close();
            info!("{device}: dry run, header not modified");
            return run.finish(Outcome::Converted, "dry run, no changes written");
        }

        let converted =
            self.volumes
                .convert_keyslot(device, request.slot(), target, &request.passphrase);
        mapping.close();
        if let Err(e) = &converted {
            warn!("{device}: keyslot conversion reported an error: {e}");
        }

        run.enter(Stage::Verifying, "reopening with the new passphrase");
        let name = self.names.next_name();
        let verify_error = match OpenMapping::open(
            self.volumes,
            self.registry,
            device,
            &request.passphrase,
            name,
        ) {
            Ok(mapping) => {
                mapping.close();
                return match converted {
                    Ok(()) => run.finish(Outcome::Converted, "keyslot converted and verified"),
                    Err(e) => run.finish(
                        Outcome::Failed,
                        format!("conversion failed but the device still opens: {e}"),
                    ),
                };
            }
            Err(e) => e,
        };

        run.enter(
            Stage::Reverting,
            format_args!("verification failed: {verify_error}"),
        );
        match self
            .volumes
            .revert_keyslot_conversion(device, request.slot(), &backup_path)
        {
            Ok(()) => run.finish(
                Outcome::Reverted,
                format!(
                    "conversion reverted from {}; the keyslot keeps its previous parameters",
                    backup_path.display()
                ),
            ),
            Err(e) => {
                error!(
                    "{device}: MANUAL INTERVENTION REQUIRED. Restore the header with `cryptsetup luksHeaderRestore {device} --header-backup-file {}`",
                    backup_path.display()
                );
                let mut result =
                    run.finish(Outcome::Failed, format!("revert failed: {e}"));
                result.manual_intervention = true;
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::fake::{Call, FakeVolumes};
    use tempfile::{TempDir, tempdir};

    fn passphrase(device: &Device) -> Passphrase {
        Passphrase::confirmed(
            device,
            Zeroizing::new("new secret".to_string()),
            Zeroizing::new("new secret".to_string()),
        )
        .unwrap()
    }

    fn request(dry_run: bool) -> ConversionRequest {
        let device = Device::from("/dev/mapper/a");
        let passphrase = passphrase(&device);
        ConversionRequest::new(device, 0, KdfTarget::default(), passphrase, dry_run).unwrap()
    }

    fn run(volumes: &FakeVolumes, request: &ConversionRequest) -> (SessionResult, TempDir) {
        let dir = tempdir().unwrap();
        let backups = BackupManager::new(dir.path()).unwrap();
        let registry = MappingRegistry::default();
        let mut names = MappingNames::seeded(1);
        let result = Converter::new(volumes, &backups, &registry, &mut names).run(request);
        assert!(registry.active().is_empty(), "mapping left registered");
        (result, dir)
    }

    #[test]
    fn empty_passphrase_is_rejected() {
        let device = Device::from("/dev/sda2");
        let err = Passphrase::confirmed(&device, Zeroizing::default(), Zeroizing::default())
            .unwrap_err();
        assert!(matches!(err, ConvertError::EmptyPassphrase(_)));
    }

    #[test]
    fn mismatched_passphrase_is_rejected() {
        let device = Device::from("/dev/sda2");
        let err = Passphrase::confirmed(
            &device,
            Zeroizing::new("a".into()),
            Zeroizing::new("b".into()),
        )
        .unwrap_err();
        assert!(matches!(err, ConvertError::PassphraseMismatch(d) if d == device));
    }

    #[test]
    fn passphrase_debug_is_redacted() {
        let device = Device::from("/dev/sda2");
        assert!(!format!("{:?}", passphrase(&device)).contains("secret"));
    }

    #[test]
    fn slot_out_of_range_is_rejected() {
        let device = Device::from("/dev/sda2");
        let passphrase = passphrase(&device);
        assert!(
            ConversionRequest::new(device, 8, KdfTarget::default(), passphrase, false).is_err()
        );
    }

    #[test]
    fn successful_conversion_walks_every_stage() {
        let volumes = FakeVolumes::new();
        let (result, dir) = run(&volumes, &request(false));

        assert_eq!(result.outcome, Outcome::Converted);
        assert_eq!(
            result.stages,
            vec![
                Stage::Opened,
                Stage::BackedUp,
                Stage::Converting,
                Stage::Verifying,
                Stage::Converted
            ]
        );
        assert!(dir.path().join("a_header_backup.bin").exists());
        assert!(volumes.open_mappings().is_empty());
        assert_eq!(volumes.count(|c| matches!(c, Call::Convert { .. })), 1);
        assert_eq!(volumes.count(|c| matches!(c, Call::Revert { .. })), 0);
    }

    #[test]
    fn backup_precedes_conversion_and_mapping_closes_before_verify() {
        let volumes = FakeVolumes::new();
        let (_, _dir) = run(&volumes, &request(false));

        let calls = volumes.calls();
        let backup = calls.iter().position(|c| matches!(c, Call::Backup { .. })).unwrap();
        let convert = calls.iter().position(|c| matches!(c, Call::Convert { .. })).unwrap();
        let first_close = calls.iter().position(|c| matches!(c, Call::Close(_))).unwrap();
        let opens: Vec<&String> = calls
            .iter()
            .filter_map(|c| match c {
                Call::Open { name, .. } => Some(name),
                _ => None,
            })
            .collect();

        assert!(backup < convert);
        assert!(convert < first_close);
        assert_eq!(opens.len(), 2);
        assert_ne!(opens[0], opens[1]);
    }

    #[test]
    fn dry_run_never_touches_the_header() {
        let volumes = FakeVolumes::new();
        let (result, _dir) = run(&volumes, &request(true));

        assert_eq!(result.outcome, Outcome::Converted);
        assert!(result.reason.contains("dry run"));
        assert!(!volumes.mutated());
        assert!(!result.stages.contains(&Stage::Verifying));
    }

    #[test]
    fn failed_open_leaves_device_untouched() {
        let volumes = FakeVolumes::new().failing_open();
        let (result, dir) = run(&volumes, &request(false));

        assert_eq!(result.outcome, Outcome::Failed);
        assert_eq!(result.stages, vec![Stage::Failed]);
        assert!(!volumes.mutated());
        assert_eq!(volumes.count(|c| matches!(c, Call::Backup { .. })), 0);
        assert!(!dir.path().join("a_header_backup.bin").exists());
    }

    #[test]
    fn failed_backup_never_converts() {
        let volumes = FakeVolumes::new().failing_backup();
        let (result, _dir) = run(&volumes, &request(false));

        assert_eq!(result.outcome, Outcome::Failed);
        assert_eq!(result.stages, vec![Stage::Opened, Stage::Failed]);
        assert!(!volumes.mutated());
        assert!(volumes.open_mappings().is_empty());
    }

    #[test]
    fn failed_verification_reverts_exactly_once() {
        let volumes = FakeVolumes::new().failing_verify();
        let (result, dir) = run(&volumes, &request(false));

        assert_eq!(result.outcome, Outcome::Reverted);
        assert!(!result.is_success());
        assert!(result.stages.contains(&Stage::Reverting));
        assert_eq!(
            volumes.calls().last(),
            Some(&Call::Revert {
                device: Device::from("/dev/mapper/a"),
                slot: 0,
                backup: dir.path().join("a_header_backup.bin"),
            })
        );
        assert_eq!(volumes.count(|c| matches!(c, Call::Revert { .. })), 1);
    }

    #[test]
    fn failed_revert_requires_manual_intervention() {
        let volumes = FakeVolumes::new().failing_verify().failing_revert();
        let (result, _dir) = run(&volumes, &request(false));

        assert_eq!(result.outcome, Outcome::Failed);
        assert!(result.manual_intervention);
        assert_eq!(result.stages.last(), Some(&Stage::Failed));
        assert!(result.backup.is_some());
    }

    #[test]
    fn conversion_error_still_goes_through_verification() {
        let volumes = FakeVolumes::new().failing_convert();
        let (result, _dir) = run(&volumes, &request(false));

        assert_eq!(result.outcome, Outcome::Failed);
        assert!(result.stages.contains(&Stage::Verifying));
        assert_eq!(volumes.count(|c| matches!(c, Call::Convert { .. })), 1);
        assert_eq!(volumes.count(|c| matches!(c, Call::Revert { .. })), 0);
    }
}
