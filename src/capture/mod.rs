//! Capture sessions: one run's archive stream for one backup target.
//!
//! A session owns the archiver pipeline and the working capture state for
//! its duration. The caller streams the producer's output to the store and
//! then settles the session with exactly one of [`CaptureSession::success`]
//! (commit state, advance level) or [`CaptureSession::failure`] (kill the
//! pipeline, discard working state).

pub mod producer;

use std::io;
use std::path::Path;
use std::process::Command;

use chrono::Local;
use derive_more::{Display, Error, From};
use regex::Regex;

use crate::state::{LoadedState, StateError, StateStore};
use producer::{CommandProducer, Producer};

const ARCHIVER: &str = "tar";
const FILTER: &str = "gpg";

const PLAIN_EXT: &str = "tar.gz";
const ENCRYPTED_EXT: &str = "tar.gpg";

#[derive(Debug, Display, Error, From)]
/// Errors while setting up or settling a capture.
pub enum CaptureError {
    /// Capture state could not be loaded or stored.
    #[display("capture state error: {_0}")]
    #[from]
    State(StateError),

    /// The archiver or filter process could not be launched.
    #[display("failed to launch the capture pipeline: {_0}")]
    Spawn(io::Error),

    /// The pipeline exited with a failure, the captured stream is not
    /// trustworthy.
    #[display("capture pipeline exited with failure")]
    ProducerFailed,

    /// Encryption was requested but no recipient resolves to a usable key.
    #[display("no usable encryption recipient")]
    NoUsableRecipient,
}

/// Check each recipient against the local gpg keyring and return the
/// usable subset. Encryption with zero usable recipients is a
/// configuration error, surfaced before any capture begins.
pub fn validate_recipients(recipients: &[String]) -> Result<Vec<String>, CaptureError> {
    let mut usable = Vec::new();
    for recipient in recipients {
        let listing = Command::new(FILTER)
            .arg("--batch")
            .arg("--list-keys")
            .arg(recipient)
            .output();
        match listing {
            Ok(output) if output.status.success() => usable.push(recipient.clone()),
            Ok(_) => {
                log::warn!(target: "capture", "No key for encryption recipient {recipient}")
            }
            Err(e) => {
                log::warn!(target: "capture", "Key check for {recipient} did not run: {e}")
            }
        }
    }

    if usable.is_empty() {
        Err(CaptureError::NoUsableRecipient)
    } else {
        Ok(usable)
    }
}

/// One capture of one target. See the module documentation for the
/// settlement protocol.
pub struct CaptureSession<'a> {
    state_store: &'a StateStore,
    state: LoadedState,
    producer: CommandProducer,
    key_stem: String,
    settled: bool,
}

impl<'a> CaptureSession<'a> {
    /// Launch the archiver for one capture of `mount_point`. With
    /// `recipients` set the stream is encrypted to them, otherwise it is
    /// gzip-compressed.
    pub fn start(
        state_store: &'a StateStore,
        target: &str,
        subdir: &str,
        mount_point: &Path,
        recipients: Option<&[String]>,
    ) -> Result<Self, CaptureError> {
        let state = state_store.load()?;
        if state.level == 0 {
            log::info!(target: "capture", "Starting full capture of {}", mount_point.display());
        } else {
            log::info!(
                target: "capture",
                "Starting level {} incremental capture of {}",
                state.level,
                mount_point.display()
            );
        }

        let mut archiver = Command::new(ARCHIVER);
        archiver
            .arg("--create")
            .arg("--file=-")
            .arg("--directory")
            .arg(mount_point)
            .arg("--listed-incremental")
            .arg(&state.metadata_path)
            .arg(".");

        let filter = recipients.map(|recipients| {
            let mut filter = Command::new(FILTER);
            filter.arg("--batch").arg("--encrypt");
            for recipient in recipients {
                filter.arg("--recipient").arg(recipient);
            }
            filter
        });

        let ext = if filter.is_some() {
            ENCRYPTED_EXT
        } else {
            PLAIN_EXT
        };
        let key_stem = object_key(subdir, target, state.level, ext);

        let producer = CommandProducer::spawn(archiver, filter).map_err(CaptureError::Spawn)?;

        Ok(Self {
            state_store,
            state,
            producer,
            key_stem,
            settled: false,
        })
    }

    /// Destination key stem of this capture.
    pub fn name(&self) -> &str {
        &self.key_stem
    }

    pub fn level(&self) -> u32 {
        self.state.level
    }

    pub fn producer_mut(&mut self) -> &mut CommandProducer {
        &mut self.producer
    }

    /// The transfer landed: verify the pipeline exited cleanly and commit
    /// the capture state. A pipeline failure discards the working state
    /// instead and reports [`CaptureError::ProducerFailed`].
    pub fn success(mut self) -> Result<(), CaptureError> {
        self.settled = true;

        let clean_exit = self.producer.wait().map_err(CaptureError::Spawn)?;
        if !clean_exit {
            log::error!(target: "capture", "Capture pipeline of {} failed, not committing", self.key_stem);
            self.state_store.discard(&self.state)?;
            return Err(CaptureError::ProducerFailed);
        }

        self.state_store.commit(&self.state)?;
        Ok(())
    }

    /// The transfer failed: kill the pipeline and discard the working
    /// state. The committed state of prior runs stays untouched, so the
    /// next run retries at the same level.
    pub fn failure(mut self) -> Result<(), CaptureError> {
        self.settled = true;

        self.producer.terminate();
        let _ = self.producer.wait();
        self.state_store.discard(&self.state)?;
        Ok(())
    }
}

impl Drop for CaptureSession<'_> {
    fn drop(&mut self) {
        if !self.settled {
            // a session has to be settled by its caller; killing the
            // pipeline here keeps an unsettled drop from leaking processes
            log::error!(target: "capture", "Capture session {} dropped unsettled", self.key_stem);
            self.producer.terminate();
            let _ = self.producer.wait();
        }
    }
}

/// Destination key of one capture:
/// `{subdir}/{clean_target}-{timestamp}.{level}.{ext}`.
fn object_key(subdir: &str, target: &str, level: u32, ext: &str) -> String {
    let timestamp = Local::now().format("%Y-%m-%d-%H-%M-%S");
    format!("{subdir}/{}-{timestamp}.{level}.{ext}", clean_target(target))
}

/// Restrict a target name to characters safe in object keys and directory
/// names.
pub fn clean_target(name: &str) -> String {
    let unsafe_chars = Regex::new(r"[^A-Za-z0-9_.-]+").unwrap();
    let cleaned = unsafe_chars.replace_all(name.trim_matches('/'), "_");

    if cleaned.is_empty() {
        "root".to_string()
    } else {
        cleaned.into_owned()
    }
}
