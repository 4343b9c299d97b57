//! Persistent capture state of one backup target.
//!
//! The state directory holds the position in the full/incremental cycle
//! (`curlevel`) and the archiver's incremental metadata blob, gzip
//! compressed at rest (`incr.gz`). The blob is opaque: it is decompressed
//! to a working copy for the duration of one capture and only written back
//! once the transfer is confirmed successful, so the persisted state always
//! describes the last capture that actually reached the store.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use derive_more::{Display, Error, From};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

const LEVEL_FILE: &str = "curlevel";
const METADATA_WORKING: &str = "incr";
const METADATA_BLOB: &str = "incr.gz";

const CACHEDIR_TAG: &str = "CACHEDIR.TAG";
const CACHEDIR_TAG_CONTENT: &str = "Signature: 8a477f597d28d172789f06886806bc55\n\
                                    # This directory holds incr-backup capture state.\n";

#[derive(Debug, Display, Error, From)]
/// Errors of the capture state directory.
pub enum StateError {
    /// State directory or one of its files is not accessible.
    #[display("capture state not accessible: {_0}")]
    #[from]
    Io(io::Error),

    /// `curlevel` announces an incremental capture but the metadata blob of
    /// the previous run is gone.
    #[display("incremental metadata for level {level} is missing: {}", blob.display())]
    MissingMetadata { level: u32, blob: PathBuf },
}

/// State loaded for one capture: the level to capture at and the working
/// copy of the incremental metadata the archiver mutates in place.
#[derive(Debug)]
pub struct LoadedState {
    pub level: u32,
    pub metadata_path: PathBuf,
}

/// Store of one target's capture state.
///
/// All side effects stay inside the target's dedicated state directory;
/// nothing here is shared between targets.
#[derive(Debug)]
pub struct StateStore {
    state_dir: PathBuf,
    max_level: u32,
}

impl StateStore {
    /// Open the state directory, creating it on first use. The directory is
    /// tagged with a `CACHEDIR.TAG` marker once so other backup tools can
    /// exclude it.
    pub fn open(state_dir: PathBuf, max_level: u32) -> Result<Self, StateError> {
        fs::create_dir_all(&state_dir)?;

        let tag = state_dir.join(CACHEDIR_TAG);
        if !tag.exists() {
            fs::write(&tag, CACHEDIR_TAG_CONTENT)?;
        }

        Ok(Self {
            state_dir,
            max_level,
        })
    }

    pub fn state_dir(&self) -> &Path {
        self.state_dir.as_path()
    }

    /// Load the state for the next capture.
    ///
    /// A missing or unreadable `curlevel` means level 0. At level 0 stale
    /// metadata of prior runs is deleted since a full capture has no
    /// incremental dependency. At level > 0 the committed blob is
    /// decompressed to the working path; its absence is a configuration
    /// inconsistency and reported as [`StateError::MissingMetadata`].
    pub fn load(&self) -> Result<LoadedState, StateError> {
        let level = self.read_level();
        let working = self.state_dir.join(METADATA_WORKING);
        let blob = self.state_dir.join(METADATA_BLOB);

        if level == 0 {
            remove_if_exists(&working)?;
            remove_if_exists(&blob)?;
        } else {
            if !blob.exists() {
                return Err(StateError::MissingMetadata { level, blob });
            }

            let mut decoder = GzDecoder::new(File::open(&blob)?);
            let mut out = File::create(&working)?;
            io::copy(&mut decoder, &mut out)?;
            log::debug!(target: "state", "Restored incremental metadata to {}", working.display());
        }

        log::info!(target: "state", "Capture level {level} (of max {})", self.max_level);
        Ok(LoadedState {
            level,
            metadata_path: working,
        })
    }

    /// Commit after a confirmed-successful transfer: compress the working
    /// metadata over the committed blob and advance the level, wrapping
    /// back to 0 past `max_level`. Both writes go through a temporary file
    /// and rename.
    pub fn commit(&self, state: &LoadedState) -> Result<(), StateError> {
        let blob = self.state_dir.join(METADATA_BLOB);
        let staged = self.state_dir.join(format!("{METADATA_BLOB}.tmp"));

        let mut working = File::open(&state.metadata_path)?;
        let mut encoder = GzEncoder::new(File::create(&staged)?, Compression::default());
        io::copy(&mut working, &mut encoder)?;
        encoder.finish()?;
        fs::rename(&staged, &blob)?;
        fs::remove_file(&state.metadata_path)?;

        let next_level = (state.level + 1) % (self.max_level + 1);
        self.write_level(next_level)?;
        log::info!(target: "state", "Committed capture state, next level is {next_level}");

        Ok(())
    }

    /// Discard after a failed run: only the working metadata copy is
    /// removed, the committed blob and `curlevel` stay untouched.
    pub fn discard(&self, state: &LoadedState) -> Result<(), StateError> {
        remove_if_exists(&state.metadata_path)?;
        log::debug!(target: "state", "Discarded working capture state");
        Ok(())
    }

    fn read_level(&self) -> u32 {
        let level_file = self.state_dir.join(LEVEL_FILE);
        let content = match fs::read_to_string(&level_file) {
            Ok(content) => content,
            Err(e) => {
                log::debug!(target: "state", "No readable {LEVEL_FILE} ({e}), starting at level 0");
                return 0;
            }
        };

        match content.trim().parse::<u32>() {
            Ok(level) if level <= self.max_level => level,
            Ok(level) => {
                log::warn!(target: "state", "{LEVEL_FILE} holds {level}, beyond max level {}; starting full", self.max_level);
                0
            }
            Err(e) => {
                log::warn!(target: "state", "{LEVEL_FILE} is unparsable ({e}), starting at level 0");
                0
            }
        }
    }

    fn write_level(&self, level: u32) -> Result<(), StateError> {
        let level_file = self.state_dir.join(LEVEL_FILE);
        let staged = self.state_dir.join(format!("{LEVEL_FILE}.tmp"));
        fs::write(&staged, format!("{level}\n"))?;
        fs::rename(&staged, &level_file)?;
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
