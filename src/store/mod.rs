//! Object store interface of the transfer engine.
//!
//! The engine only ever talks to the store through [`ObjectStore`], so any
//! backend works as long as it honors the error classification contract:
//! network and socket level failures are [`StoreError::Network`] and safe
//! to retry, everything else propagates as fatal.

use std::io;

use derive_more::{Display, Error};

pub mod fs;
pub mod memory;

pub use fs::FsStore;
pub use memory::MemoryStore;

/// Store-side identifier of one in-progress multipart upload.
pub type UploadId = String;

/// One multipart upload the store knows to be in progress.
#[derive(Debug, Clone)]
pub struct InProgressUpload {
    pub key: String,
    pub upload_id: UploadId,
}

#[derive(Debug, Display, Error)]
/// Errors of an object store backend.
pub enum StoreError {
    /// Network or socket level failure; retrying may succeed.
    #[display("transient store failure: {_0}")]
    Network(io::Error),

    /// Store or medium refused the operation; retrying will not help.
    #[display("store failure: {_0}")]
    Io(io::Error),

    /// The backend and its caller disagree about the protocol state, e.g.
    /// an unknown upload id.
    #[display("store protocol violation: {_0}")]
    Protocol(#[error(ignore)] String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Network(_))
    }
}

/// A store assembling size-bounded objects from sequentially numbered
/// parts.
pub trait ObjectStore {
    /// Re-establish the connection after a transient failure.
    fn reconnect(&self) -> Result<(), StoreError>;

    /// Begin a multipart upload for `key`.
    fn initiate_multipart(&self, key: &str) -> Result<UploadId, StoreError>;

    /// Upload `bytes` as part `part_number` (1-based) of `upload`,
    /// returning the number of bytes written.
    fn upload_part(
        &self,
        upload: &UploadId,
        part_number: u32,
        bytes: &[u8],
    ) -> Result<usize, StoreError>;

    /// Finalize `upload`; afterwards the key is durable as a normal
    /// object.
    fn complete(&self, upload: &UploadId) -> Result<(), StoreError>;

    /// All multipart uploads the store considers in progress.
    fn list_in_progress_uploads(&self) -> Result<Vec<InProgressUpload>, StoreError>;
}
