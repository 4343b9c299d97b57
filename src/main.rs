use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;

use clap::Parser;
use derive_more::{Display, Error, From};

use incr_backup_lib::capture::{self, CaptureError, CaptureSession};
use incr_backup_lib::cli::{Action, Cli};
use incr_backup_lib::config::{BackupConfig, TargetConfig};
use incr_backup_lib::state::{StateError, StateStore};
use incr_backup_lib::store::{FsStore, StoreError};
use incr_backup_lib::transfer::{TransferEngine, TransferError, TransferResult, TransferTuning};

fn main() -> ExitCode {
    let cli = Cli::parse();
    let Action::Backup = cli.action.unwrap_or_default();

    // init logger
    let mut env_logger = env_logger::builder();
    if let Some(level) = cli.verbose {
        env_logger.filter_level(level);
    }
    env_logger.try_init().expect("env_logger should not fail");

    let config: BackupConfig = match std::fs::read_to_string(&cli.config) {
        Ok(config_str) => match toml::from_str(&config_str) {
            Err(e) => {
                log::error!("Reading the config file failed: {e}");
                return ExitCode::FAILURE;
            }
            Ok(cfg) => cfg,
        },
        Err(e) => {
            if std::fs::exists(&cli.config).is_ok_and(|b| !b) {
                log::debug!(
                    "Writing default config to {} because it doesn't exist yet",
                    cli.config.display()
                );
                let default_config = BackupConfig::default();
                let config_str = toml::to_string_pretty(&default_config)
                    .expect("default config should be serializable");
                if let Err(e) = std::fs::write(&cli.config, config_str) {
                    log::warn!(
                        "Writing default config to {} failed {e}",
                        cli.config.display(),
                    );
                }

                default_config
            } else {
                log::error!("Reading the config file failed: {e}");
                return ExitCode::FAILURE;
            }
        }
    };

    if config.targets.is_empty() {
        log::error!("No backup targets configured in {}", cli.config.display());
        return ExitCode::FAILURE;
    }

    let dry_run = cli.dry_run;
    if dry_run {
        log::warn!("Running in dry-run mode");
    }

    // encryption recipients are validated once, before any capture starts
    let recipients = if config.encryption.encrypt {
        match capture::validate_recipients(&config.encryption.recipients) {
            Ok(usable) => Some(usable),
            Err(e) => {
                log::error!("{e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        None
    };

    let subdir = config.store.subdir();
    let tuning = config.transfer.tuning();
    let max_level = config.transfer.max_level;

    // spawn one thread per target; targets share nothing but the store
    let workers: Vec<_> = config
        .targets
        .iter()
        .cloned()
        .map(|target| {
            let name = target.name.clone();
            let job = TargetJob {
                target,
                cache_root: config.cache_root.clone(),
                store_root: config.store.root.clone(),
                subdir: subdir.clone(),
                recipients: recipients.clone(),
                tuning,
                max_level,
                dry_run,
            };

            let worker = thread::spawn(move || run_target(job));
            (name, worker)
        })
        .collect();

    // wait for completion of all targets

    let mut any_failed = false;
    for (name, worker) in workers {
        match worker.join().expect("no panic in target worker") {
            Ok(result) => log::info!(
                target: "backup",
                "Backup of {name} finished: {} bytes in {} object(s)",
                result.bytes_total,
                result.objects_used
            ),
            Err(e) => {
                any_failed = true;
                log::error!(target: "backup", "Backup of {name} failed: {e}");
            }
        }
    }

    if any_failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[derive(Debug, Display, Error, From)]
enum TargetError {
    #[display("{_0}")]
    State(StateError),
    #[display("{_0}")]
    Capture(CaptureError),
    #[display("{_0}")]
    Transfer(TransferError),
    #[display("{_0}")]
    Store(StoreError),
    #[display("{_0}")]
    Io(io::Error),
}

/// Everything one target's worker thread needs, owned.
struct TargetJob {
    target: TargetConfig,
    cache_root: PathBuf,
    store_root: PathBuf,
    subdir: String,
    recipients: Option<Vec<String>>,
    tuning: TransferTuning,
    max_level: u32,
    dry_run: bool,
}

fn run_target(job: TargetJob) -> Result<TransferResult, TargetError> {
    let TargetJob {
        target,
        cache_root,
        store_root,
        subdir,
        recipients,
        tuning,
        max_level,
        dry_run,
    } = job;

    let clean_name = capture::clean_target(&target.name);
    let state_store = StateStore::open(cache_root.join(&clean_name), max_level)?;

    let mut session = CaptureSession::start(
        &state_store,
        &target.name,
        &subdir,
        &target.mount_point,
        recipients.as_deref(),
    )?;
    log::info!(
        target: "backup",
        "Capturing {} into {}",
        target.mount_point.display(),
        session.name()
    );

    if dry_run {
        // drain and discard the capture; neither the store nor the capture
        // state are touched
        let bytes_total = io::copy(session.producer_mut(), &mut io::sink())?;
        log::info!(
            target: "backup",
            "Dry run: capture of {} produced {bytes_total} bytes",
            target.name
        );
        session.failure()?;
        return Ok(TransferResult {
            objects_used: 0,
            bytes_total,
        });
    }

    let store = FsStore::open(store_root)?;
    let engine = TransferEngine::new(&store, tuning);
    let stem = session.name().to_string();

    match engine.run(session.producer_mut(), &stem) {
        Ok(result) => {
            session.success()?;
            Ok(result)
        }
        Err(e) => {
            if let Err(settle_error) = session.failure() {
                log::warn!(
                    target: "backup",
                    "Discarding the failed capture of {} also failed: {settle_error}",
                    target.name
                );
            }
            Err(TargetError::Transfer(e))
        }
    }
}
