//! Temporary device-mapper mappings.
//!
//! A mapping opened during a conversion is owned by an [`OpenMapping`] guard,
//! which closes it on every exit path. Live names are also kept in a
//! [`MappingRegistry`] so a signal handler can close them before the process
//! exits.

use std::sync::{Arc, Mutex, PoisonError};

use rand::distr::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, warn};

use crate::convert::Passphrase;
use crate::device::Device;
use crate::error::{ConvertError, VolumeError};
use crate::volume::VolumeManager;

/// Fixed tag every temporary mapping name starts with.
pub const MAPPING_PREFIX: &str = "fips_";
/// Number of random alphanumeric characters after the prefix.
pub const MAPPING_SUFFIX_LEN: usize = 12;

/// Source of temporary mapping names.
pub struct MappingNames {
    rng: StdRng,
}

impl MappingNames {
    /// Seeds from the operating system's entropy source.
    pub fn from_os_entropy() -> Result<Self, ConvertError> {
        let mut seed = [0u8; 32];
        getrandom::fill(&mut seed).map_err(|e| ConvertError::Entropy(e.to_string()))?;
        Ok(Self {
            rng: StdRng::from_seed(seed),
        })
    }

    /// Deterministic names, for tests.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn next_name(&mut self) -> String {
        let suffix: String = (0..MAPPING_SUFFIX_LEN)
            .map(|_| char::from(self.rng.sample(Alphanumeric)))
            .collect();
        format!("{MAPPING_PREFIX}{suffix}")
    }
}

/// Names of the mappings currently open, shared with the signal handler.
#[derive(Debug, Clone, Default)]
pub struct MappingRegistry {
    active: Arc<Mutex<Vec<String>>>,
}

impl MappingRegistry {
    pub fn register(&self, name: &str) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.iter().any(|n| n == name) {
            active.push(name.to_string());
        }
    }

    pub fn release(&self, name: &str) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|n| n != name);
    }

    pub fn active(&self) -> Vec<String> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Takes every registered name, leaving the registry empty.
    pub fn drain(&self) -> Vec<String> {
        std::mem::take(&mut *self.active.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Closes every registered mapping when the process receives SIGINT or SIGTERM,
/// then exits with status 130.
///
/// The process exits from the handler without unwinding, so an interrupted
/// passphrase prompt does not get to turn terminal echo back on; run `stty echo`
/// (or `reset`) afterwards if the shell stays silent.
pub fn install_interrupt_cleanup<V>(
    volumes: V,
    registry: MappingRegistry,
) -> Result<(), ctrlc::Error>
where
    V: VolumeManager + Send + 'static,
{
    ctrlc::set_handler(move || {
        close_registered(&volumes, &registry);
        std::process::exit(130);
    })
}

/// Closes and forgets every mapping in `registry`. Failures are logged.
pub fn close_registered(volumes: &dyn VolumeManager, registry: &MappingRegistry) {
    for name in registry.drain() {
        warn!("Interrupted; closing temporary mapping {name}");
        if let Err(e) = volumes.close_mapping(&name) {
            error!("Failed to close temporary mapping {name}: {e}");
        }
    }
}

/// A mapping that stays open until this guard is closed or dropped.
pub struct OpenMapping<'a> {
    volumes: &'a dyn VolumeManager,
    registry: &'a MappingRegistry,
    device: Device,
    name: String,
    released: bool,
}

impl<'a> OpenMapping<'a> {
    pub fn open(
        volumes: &'a dyn VolumeManager,
        registry: &'a MappingRegistry,
        device: &Device,
        passphrase: &Passphrase,
        name: String,
    ) -> Result<Self, VolumeError> {
        // registered first so an interrupt during `open` still closes it
        registry.register(&name);
        if let Err(e) = volumes.open_mapping(device, passphrase, &name) {
            registry.release(&name);
            return Err(e);
        }

        Ok(Self {
            volumes,
            registry,
            device: device.clone(),
            name,
            released: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        match self.volumes.close_mapping(&self.name) {
            Ok(()) => debug!("Closed temporary mapping {}", self.name),
            Err(e) => warn!("Failed to close temporary mapping {}: {e}", self.name),
        }
        self.registry.release(&self.name);
    }
}

impl Drop for OpenMapping<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
