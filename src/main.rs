use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::error;

mod auth;

use luks_fips_convert::mapping::install_interrupt_cleanup;
use luks_fips_convert::volume::DEFAULT_TIMEOUT;
use luks_fips_convert::{
    BackupManager, Device, KdfTarget, MappingNames, MappingRegistry, Session, SessionOptions,
    SystemVolumeManager, default_log_file, device, logging,
};

#[derive(Debug, clap::Args)]
struct KdfArgs {
    /// Target PBKDF algorithm (default: pbkdf2)
    #[arg(long)]
    pbkdf: Option<String>,

    /// Target hash algorithm (default: sha512)
    #[arg(long)]
    hash: Option<String>,

    /// Target PBKDF iteration count (default: 1000000)
    #[arg(long)]
    iterations: Option<u32>,
}

impl KdfArgs {
    fn to_target(&self) -> Result<KdfTarget> {
        let default = KdfTarget::default();

        Ok(KdfTarget::new(
            self.pbkdf.as_deref().unwrap_or(default.pbkdf()),
            self.hash.as_deref().unwrap_or(default.hash()),
            self.iterations.unwrap_or(default.iterations()),
        )?)
    }
}

#[derive(Debug, Parser)]
#[command(name = "luks-fips-convert")]
#[command(
    version,
    about = "Convert a LUKS2 keyslot's key derivation to FIPS-compliant parameters, with header backup, verification and rollback."
)]
struct Cli {
    #[command(flatten)]
    kdf: KdfArgs,

    /// Keyslot to convert (default: first active keyslot)
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=7))]
    slot: Option<u8>,

    /// Device to process; repeatable. Defaults to every LUKS device found
    #[arg(long = "device", short = 'd', value_name = "PATH")]
    devices: Vec<PathBuf>,

    /// Existing directory that receives header backups
    #[arg(
        long,
        value_name = "DIR",
        env = "LUKS_FIPS_BACKUP_DIR",
        default_value = "/var/backups/luks-fips-convert"
    )]
    backup_dir: PathBuf,

    /// Do not ask for confirmation before each device
    #[arg(long, short = 'y', default_value_t = false)]
    auto_confirm: bool,

    /// Only report the current keyslot parameters of each device
    #[arg(long, default_value_t = false)]
    list: bool,

    /// Go through every step without modifying any header
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Append log lines to this file
    #[arg(long, value_name = "PATH", env = "LUKS_FIPS_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Timeout in seconds for each cryptsetup/blkid/lsblk call
    #[arg(long, value_name = "SECS", env = "LUKS_FIPS_TIMEOUT", default_value_t = DEFAULT_TIMEOUT.as_secs())]
    timeout: u64,

    /// Log debug output
    #[arg(long, short, default_value_t = false)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_file = cli.log_file.clone().or_else(|| default_log_file().ok());
    if let Err(e) = logging::init(log_file.as_deref(), cli.verbose) {
        eprintln!("luks-fips-convert: failed to initialize logging: {e:#}");
    }

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<bool> {
    let target = cli.kdf.to_target()?;

    let volumes = SystemVolumeManager::locate(Duration::from_secs(cli.timeout))?;
    let registry = MappingRegistry::default();
    install_interrupt_cleanup(volumes.clone(), registry.clone())
        .context("failed to install the interrupt handler")?;

    let explicit = cli.devices.into_iter().map(Device::from).collect();
    let devices = device::resolve(explicit, &volumes)?;
    let backups = if cli.list {
        None
    } else {
        Some(BackupManager::new(cli.backup_dir)?)
    };

    let options = SessionOptions {
        target,
        slot: cli.slot,
        auto_confirm: cli.auto_confirm,
        dry_run: cli.dry_run,
    };
    let mut prompter = auth::TerminalPrompter::new();
    let mut session = Session::new(
        &volumes,
        &mut prompter,
        registry,
        MappingNames::from_os_entropy()?,
        options,
    );

    let Some(backups) = backups else {
        session.list(&devices);
        return Ok(true);
    };

    let summary = session.convert_all(devices, &backups);
    Ok(summary.is_success())
}
