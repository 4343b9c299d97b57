//! One destination object's in-progress multipart upload.

use derive_more::{Display, Error, From};

use crate::store::{ObjectStore, StoreError, UploadId};

/// Hard ceiling on part numbers, with a safety margin under the
/// 10 000-part limit common to multipart stores.
pub const MAX_PARTS: u32 = 9_500;

#[derive(Debug, Display, Error, From)]
pub enum UploadError {
    /// The object needs more parts than the store accepts.
    #[display("part number ceiling reached")]
    PartLimit,

    #[display("{_0}")]
    #[from]
    Store(StoreError),
}

impl UploadError {
    pub fn is_transient(&self) -> bool {
        matches!(self, UploadError::Store(e) if e.is_transient())
    }
}

/// Exclusive handle on one destination object's multipart upload.
///
/// Part numbers start at 1 and advance only on success, so a failed part
/// is retried under the same number rather than skipped.
pub struct UploadSession<'a, S: ObjectStore + ?Sized> {
    store: &'a S,
    key: String,
    upload_id: UploadId,
    part_number: u32,
    bytes_uploaded: u64,
}

impl<'a, S: ObjectStore + ?Sized> UploadSession<'a, S> {
    /// Initiate a multipart upload for `key`.
    pub fn open(store: &'a S, key: String) -> Result<Self, StoreError> {
        let upload_id = store.initiate_multipart(&key)?;
        log::debug!(target: "transfer::upload", "Opened multipart upload {upload_id} for {key}");

        Ok(Self {
            store,
            key,
            upload_id,
            part_number: 1,
            bytes_uploaded: 0,
        })
    }

    /// Rebind to an in-progress upload discovered after a reconnect. The
    /// part and byte counters continue where the abandoned session left
    /// off; the store's view of already-received parts is not queried.
    pub fn adopt(
        store: &'a S,
        key: String,
        upload_id: UploadId,
        part_number: u32,
        bytes_uploaded: u64,
    ) -> Self {
        log::debug!(target: "transfer::upload", "Adopted multipart upload {upload_id} for {key} at part {part_number}");

        Self {
            store,
            key,
            upload_id,
            part_number,
            bytes_uploaded,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Next part number to be uploaded.
    pub fn part_number(&self) -> u32 {
        self.part_number
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.bytes_uploaded
    }

    /// Upload `bytes` as the next sequential part. On failure the part
    /// counter stays unadvanced and the same part must be retried.
    pub fn upload_part(&mut self, bytes: &[u8]) -> Result<usize, UploadError> {
        if self.part_number > MAX_PARTS {
            return Err(UploadError::PartLimit);
        }

        let written = self
            .store
            .upload_part(&self.upload_id, self.part_number, bytes)?;

        log::trace!(
            target: "transfer::upload",
            "Uploaded part {} of {} ({} bytes)",
            self.part_number,
            self.key,
            bytes.len()
        );
        self.part_number += 1;
        self.bytes_uploaded += bytes.len() as u64;
        Ok(written)
    }

    /// Finalize the upload; the key becomes durable as a normal object.
    pub fn complete(self) -> Result<(), StoreError> {
        self.store.complete(&self.upload_id)?;
        log::debug!(
            target: "transfer::upload",
            "Completed {} with {} part(s), {} bytes",
            self.key,
            self.part_number - 1,
            self.bytes_uploaded
        );
        Ok(())
    }

    /// Drop the handle without contacting the store, returning the
    /// counters the replacement session continues from. Used when the
    /// handle may be stale after a connection loss.
    pub fn abandon(self) -> (String, u32, u64) {
        (self.key, self.part_number, self.bytes_uploaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn parts_are_numbered_sequentially_from_one() {
        let store = MemoryStore::new();
        let mut session = UploadSession::open(&store, "key".to_string()).unwrap();

        assert_eq!(session.part_number(), 1);
        session.upload_part(b"aaaa").unwrap();
        assert_eq!(session.part_number(), 2);
        session.upload_part(b"bb").unwrap();
        assert_eq!(session.part_number(), 3);
        assert_eq!(session.bytes_uploaded(), 6);

        session.complete().unwrap();
        assert_eq!(store.object("key").unwrap(), b"aaaabb");
    }

    #[test]
    fn failed_part_leaves_the_counter_unadvanced() {
        let store = MemoryStore::new();
        store.fail_once_on("key", 1);
        let mut session = UploadSession::open(&store, "key".to_string()).unwrap();

        let error = session.upload_part(b"data").unwrap_err();
        assert!(error.is_transient());
        assert_eq!(session.part_number(), 1);
        assert_eq!(session.bytes_uploaded(), 0);

        // the same part number succeeds on retry
        session.upload_part(b"data").unwrap();
        assert_eq!(session.part_number(), 2);
    }

    #[test]
    fn part_ceiling_is_enforced() {
        let store = MemoryStore::new();
        let upload_id = store.initiate_multipart("key").unwrap();
        let mut session =
            UploadSession::adopt(&store, "key".to_string(), upload_id, MAX_PARTS + 1, 0);

        assert!(matches!(
            session.upload_part(b"data"),
            Err(UploadError::PartLimit)
        ));
    }
}
