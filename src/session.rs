//! Session orchestration across all target devices.

use tracing::{error, info, warn};
use zeroize::Zeroizing;

use crate::backup::BackupManager;
use crate::convert::{ConversionRequest, Converter, Outcome, Passphrase, SessionResult};
use crate::device::Device;
use crate::error::ConvertError;
use crate::inspect::{self, KeyslotDescriptor};
use crate::kdf::KdfTarget;
use crate::mapping::{MappingNames, MappingRegistry};
use crate::volume::VolumeManager;

/// Interactive input the session blocks on.
pub trait Prompter {
    /// Asks whether `device` should be converted. `partitions` is shown for context.
    fn confirm(&mut self, device: &Device, partitions: &str) -> Result<bool, ConvertError>;

    /// Reads the passphrase for `device` and its confirmation.
    fn passphrase(
        &mut self,
        device: &Device,
    ) -> Result<(Zeroizing<String>, Zeroizing<String>), ConvertError>;
}

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub target: KdfTarget,
    /// Explicit keyslot; auto-detected per device when `None`.
    pub slot: Option<u8>,
    pub auto_confirm: bool,
    pub dry_run: bool,
}

/// Per-device results, plus the error that stopped the session early, if any.
#[derive(Debug, Default)]
pub struct SessionSummary {
    pub results: Vec<SessionResult>,
    pub halted: Option<ConvertError>,
}

impl SessionSummary {
    pub fn is_success(&self) -> bool {
        self.halted.is_none() && self.results.iter().all(SessionResult::is_success)
    }

    fn halt(&mut self, err: ConvertError) {
        error!("Session aborted: {err}");
        self.halted = Some(err);
    }
}

pub struct Session<'a> {
    volumes: &'a dyn VolumeManager,
    prompter: &'a mut dyn Prompter,
    registry: MappingRegistry,
    names: MappingNames,
    options: SessionOptions,
}

impl<'a> Session<'a> {
    pub fn new(
        volumes: &'a dyn VolumeManager,
        prompter: &'a mut dyn Prompter,
        registry: MappingRegistry,
        names: MappingNames,
        options: SessionOptions,
    ) -> Self {
        Self {
            volumes,
            prompter,
            registry,
            names,
            options,
        }
    }

    /// Reports the current keyslot of every device without changing anything.
    ///
    /// Devices that cannot be inspected are logged and skipped.
    pub fn list(&self, devices: &[Device]) -> Vec<KeyslotDescriptor> {
        let mut found = Vec::new();
        for device in devices {
            match inspect::inspect(self.volumes, device) {
                Ok(descriptor) => {
                    info!("{descriptor}");
                    found.push(descriptor);
                }
                Err(e) => error!("Failed to get current keyslot for {device}: {e}"),
            }
        }
        found
    }

    /// Converts each device in order, stopping at the first fatal failure.
    pub fn convert_all(&mut self, devices: Vec<Device>, backups: &BackupManager) -> SessionSummary {
        let target = &self.options.target;
        info!(
            "Converting {} device(s) to {}/{} with {} iterations{}",
            devices.len(),
            target.pbkdf(),
            target.hash(),
            target.iterations(),
            if self.options.dry_run { " (dry run)" } else { "" }
        );
        if !target.is_fips_approved() {
            warn!(
                "{}/{} is not a FIPS-approved key derivation",
                target.pbkdf(),
                target.hash()
            );
        }

        let mut summary = SessionSummary::default();
        for device in devices {
            match self.convert_one(&device, backups) {
                Ok(result) => {
                    let outcome = result.outcome;
                    let manual = result.manual_intervention;
                    let backup = result.backup.as_ref().map(|b| b.path().to_path_buf());
                    let reason = result.reason.clone();
                    summary.results.push(result);

                    if outcome == Outcome::Failed {
                        let err = match (manual, backup) {
                            (true, Some(backup)) => ConvertError::RevertFailed { device, backup },
                            _ => ConvertError::DeviceFailed { device, reason },
                        };
                        summary.halt(err);
                        break;
                    }
                }
                Err(e) => {
                    summary.halt(e);
                    break;
                }
            }
        }

        for result in &summary.results {
            info!(
                "Summary: {}: {} ({})",
                result.device, result.outcome, result.reason
            );
        }
        summary
    }

    fn convert_one(
        &mut self,
        device: &Device,
        backups: &BackupManager,
    ) -> Result<SessionResult, ConvertError> {
        if !self.options.auto_confirm {
            let partitions = self
                .volumes
                .list_partitions(device)
                .unwrap_or_else(|e| format!("(partition listing unavailable: {e})"));
            if !self.prompter.confirm(device, &partitions)? {
                info!("Skipping {device}: not confirmed");
                return Ok(SessionResult::aborted_by_user(device.clone()));
            }
        }

        let slot = self.resolve_slot(device)?;

        let (entered, confirmation) = self.prompter.passphrase(device)?;
        let passphrase = Passphrase::confirmed(device, entered, confirmation)?;
        let request = ConversionRequest::new(
            device.clone(),
            slot,
            self.options.target.clone(),
            passphrase,
            self.options.dry_run,
        )?;

        let result =
            Converter::new(self.volumes, backups, &self.registry, &mut self.names).run(&request);

        if result.outcome == Outcome::Converted {
            match inspect::inspect_slot(self.volumes, device, slot) {
                Ok(current) => info!("Now: {current}"),
                Err(e) => warn!("Could not re-inspect keyslot {slot} of {device}: {e}"),
            }
        }
        Ok(result)
    }

    /// The explicit slot if one was given, else the first active keyslot.
    fn resolve_slot(&self, device: &Device) -> Result<u8, ConvertError> {
        match self.options.slot {
            Some(slot) => {
                match inspect::inspect_slot(self.volumes, device, slot) {
                    Ok(current) => info!("Current: {current}"),
                    Err(e) => warn!("Could not inspect {device}, using keyslot {slot}: {e}"),
                }
                Ok(slot)
            }
            None => {
                let current = inspect::inspect(self.volumes, device)?;
                info!("Current: {current}");
                Ok(current.slot)
            }
        }
    }
}
