//! Keyslot inspection from LUKS2 JSON metadata.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::device::Device;
use crate::error::ConvertError;
use crate::volume::VolumeManager;

/// Highest keyslot index this tool operates on.
pub const MAX_SLOT: u8 = 7;

/// Keyslot type of an active LUKS2 keyslot.
const ACTIVE_KEYSLOT_TYPE: &str = "luks2";

/// Snapshot of one keyslot's current key-derivation parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyslotDescriptor {
    pub device: Device,
    pub slot: u8,
    pub pbkdf: String,
    pub hash: String,
    pub iterations: u32,
}

impl fmt::Display for KeyslotDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Device: {}, Keyslot: {}, PBKDF: {}, Hash: {}, Iterations: {}",
            self.device, self.slot, self.pbkdf, self.hash, self.iterations
        )
    }
}

#[derive(Deserialize)]
struct Metadata {
    #[serde(default)]
    keyslots: BTreeMap<String, RawKeyslot>,
}

#[derive(Deserialize)]
struct RawKeyslot {
    #[serde(rename = "type")]
    kind: String,
    kdf: Option<RawKdf>,
    af: Option<RawAf>,
}

#[derive(Deserialize)]
struct RawKdf {
    #[serde(rename = "type")]
    kind: String,
    hash: Option<String>,
    iterations: Option<u32>,
    time: Option<u32>,
}

#[derive(Deserialize)]
struct RawAf {
    hash: Option<String>,
}

/// Queries the header of `device` and returns its first active keyslot.
pub fn inspect(
    volumes: &dyn VolumeManager,
    device: &Device,
) -> Result<KeyslotDescriptor, ConvertError> {
    parse_dump(device, &dump(volumes, device)?)
}

/// Queries the header of `device` and returns keyslot `slot`, which must be active.
pub fn inspect_slot(
    volumes: &dyn VolumeManager,
    device: &Device,
    slot: u8,
) -> Result<KeyslotDescriptor, ConvertError> {
    parse_slot(device, &dump(volumes, device)?, slot)
}

fn dump(volumes: &dyn VolumeManager, device: &Device) -> Result<String, ConvertError> {
    volumes
        .dump_header(device)
        .map_err(|e| ConvertError::InspectionFailed {
            device: device.clone(),
            reason: e.to_string(),
        })
}

/// Selects the first active keyslot, in slot order, from a JSON header dump.
///
/// Further active keyslots are ignored but reported with a warning.
pub fn parse_dump(device: &Device, dump: &str) -> Result<KeyslotDescriptor, ConvertError> {
    let mut active = active_keyslots(device, dump)?.into_iter();

    let Some((slot, keyslot)) = active.next() else {
        return Err(inspection_failed(device, "no active keyslot found".into()));
    };

    let others: Vec<String> = active.map(|(slot, _)| slot.to_string()).collect();
    if !others.is_empty() {
        warn!(
            "{device} has more than one active keyslot; using keyslot {slot}, also active: {}",
            others.join(", ")
        );
    }

    describe(device, slot, keyslot)
}

/// Selects keyslot `slot` from a JSON header dump.
pub fn parse_slot(
    device: &Device,
    dump: &str,
    slot: u8,
) -> Result<KeyslotDescriptor, ConvertError> {
    let keyslot = active_keyslots(device, dump)?
        .into_iter()
        .find_map(|(index, keyslot)| (index == slot).then_some(keyslot))
        .ok_or_else(|| inspection_failed(device, format!("keyslot {slot} is not active")))?;

    describe(device, slot, keyslot)
}

fn inspection_failed(device: &Device, reason: String) -> ConvertError {
    ConvertError::InspectionFailed {
        device: device.clone(),
        reason,
    }
}

/// Active keyslots within range, in slot order.
fn active_keyslots(device: &Device, dump: &str) -> Result<Vec<(u8, RawKeyslot)>, ConvertError> {
    let metadata: Metadata = serde_json::from_str(dump)
        .map_err(|e| inspection_failed(device, format!("unparseable header dump: {e}")))?;

    let mut slots: Vec<(u8, RawKeyslot)> = Vec::new();
    for (index, keyslot) in metadata.keyslots {
        match index.parse::<u8>() {
            Ok(slot) if slot <= MAX_SLOT => slots.push((slot, keyslot)),
            _ => debug!("Ignoring keyslot `{index}` on {device}"),
        }
    }
    slots.retain(|(_, keyslot)| keyslot.kind == ACTIVE_KEYSLOT_TYPE);
    slots.sort_by_key(|(slot, _)| *slot);
    Ok(slots)
}

fn describe(
    device: &Device,
    slot: u8,
    keyslot: RawKeyslot,
) -> Result<KeyslotDescriptor, ConvertError> {
    let kdf = keyslot
        .kdf
        .ok_or_else(|| inspection_failed(device, format!("keyslot {slot} has no kdf section")))?;
    let hash = kdf
        .hash
        .or_else(|| keyslot.af.and_then(|af| af.hash))
        .unwrap_or_else(|| "unknown".to_string());
    let iterations = kdf.iterations.or(kdf.time).unwrap_or(0);

    Ok(KeyslotDescriptor {
        device: device.clone(),
        slot,
        pbkdf: kdf.kind,
        hash,
        iterations,
    })
}
