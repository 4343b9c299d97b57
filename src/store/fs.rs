//! Filesystem-backed object store.
//!
//! Objects live as plain files under a root directory. In-progress
//! multipart uploads are staged under `.multipart/<upload_id>/` with a JSON
//! descriptor and one file per part; `complete` assembles the parts in
//! order into the destination object and removes the staging directory.
//! Staging directories of interrupted runs stay behind and surface in
//! [`ObjectStore::list_in_progress_uploads`].

use std::fs::{self, File};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Local;

use super::{InProgressUpload, ObjectStore, StoreError, UploadId};

const STAGING_DIR: &str = ".multipart";
const DESCRIPTOR_FILE: &str = "descriptor.json";
const ASSEMBLY_FILE: &str = "object";

#[derive(serde::Serialize, serde::Deserialize)]
struct Descriptor {
    key: String,
    started: String,
}

/// Object store rooted at a local (or network-mounted) directory.
#[derive(Debug)]
pub struct FsStore {
    root: PathBuf,
    upload_seq: AtomicU64,
}

impl FsStore {
    pub fn open(root: PathBuf) -> Result<Self, StoreError> {
        fs::create_dir_all(root.join(STAGING_DIR)).map_err(classify)?;
        Ok(Self {
            root,
            upload_seq: AtomicU64::new(0),
        })
    }

    fn staging(&self, upload: &UploadId) -> PathBuf {
        self.root.join(STAGING_DIR).join(upload)
    }

    fn descriptor(&self, upload: &UploadId) -> Result<Descriptor, StoreError> {
        let raw = fs::read(self.staging(upload).join(DESCRIPTOR_FILE))
            .map_err(|_| StoreError::Protocol(format!("unknown upload id {upload}")))?;
        serde_json::from_slice(&raw)
            .map_err(|e| StoreError::Protocol(format!("unreadable descriptor of {upload}: {e}")))
    }
}

impl ObjectStore for FsStore {
    fn reconnect(&self) -> Result<(), StoreError> {
        // a reachability probe of the root stands in for reopening a
        // connection
        fs::read_dir(&self.root).map(|_| ()).map_err(classify)
    }

    fn initiate_multipart(&self, key: &str) -> Result<UploadId, StoreError> {
        let seq = self.upload_seq.fetch_add(1, Ordering::Relaxed);
        let upload_id = format!(
            "{}-{}-{seq:04}",
            Local::now().format("%Y%m%d%H%M%S"),
            std::process::id()
        );

        let staging = self.staging(&upload_id);
        fs::create_dir_all(&staging).map_err(classify)?;

        let descriptor = Descriptor {
            key: key.to_string(),
            started: Local::now().to_rfc3339(),
        };
        let raw = serde_json::to_vec(&descriptor)
            .map_err(|e| StoreError::Protocol(format!("descriptor of {key} unserializable: {e}")))?;
        fs::write(staging.join(DESCRIPTOR_FILE), raw).map_err(classify)?;

        log::debug!(target: "store::fs", "Initiated multipart upload {upload_id} for {key}");
        Ok(upload_id)
    }

    fn upload_part(
        &self,
        upload: &UploadId,
        part_number: u32,
        bytes: &[u8],
    ) -> Result<usize, StoreError> {
        let staging = self.staging(upload);
        if !staging.is_dir() {
            return Err(StoreError::Protocol(format!("unknown upload id {upload}")));
        }

        fs::write(staging.join(format!("part.{part_number:05}")), bytes).map_err(classify)?;
        log::trace!(target: "store::fs", "Wrote part {part_number} of {upload} ({} bytes)", bytes.len());
        Ok(bytes.len())
    }

    fn complete(&self, upload: &UploadId) -> Result<(), StoreError> {
        let descriptor = self.descriptor(upload)?;
        let staging = self.staging(upload);

        let mut parts: Vec<PathBuf> = fs::read_dir(&staging)
            .map_err(classify)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with("part."))
            })
            .collect();
        // part files are zero-padded, lexicographic order is part order
        parts.sort();

        let assembly = staging.join(ASSEMBLY_FILE);
        let mut out = File::create(&assembly).map_err(classify)?;
        for part in &parts {
            let mut part_file = File::open(part).map_err(classify)?;
            io::copy(&mut part_file, &mut out).map_err(classify)?;
        }
        drop(out);

        let destination = self.root.join(&descriptor.key);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(classify)?;
        }
        fs::rename(&assembly, &destination).map_err(classify)?;
        fs::remove_dir_all(&staging).map_err(classify)?;

        log::debug!(
            target: "store::fs",
            "Completed {upload}: {} part(s) assembled into {}",
            parts.len(),
            descriptor.key
        );
        Ok(())
    }

    fn list_in_progress_uploads(&self) -> Result<Vec<InProgressUpload>, StoreError> {
        let mut uploads = Vec::new();
        for entry in fs::read_dir(self.root.join(STAGING_DIR)).map_err(classify)? {
            let entry = entry.map_err(classify)?;
            let upload_id = entry.file_name().to_string_lossy().into_owned();

            match self.descriptor(&upload_id) {
                Ok(descriptor) => uploads.push(InProgressUpload {
                    key: descriptor.key,
                    upload_id,
                }),
                Err(e) => {
                    log::warn!(target: "store::fs", "Skipping staging entry {upload_id}: {e}")
                }
            }
        }
        Ok(uploads)
    }
}

/// Socket-shaped failures are worth a retry, everything else is not.
fn classify(e: io::Error) -> StoreError {
    use io::ErrorKind::*;

    match e.kind() {
        TimedOut | NotConnected | ConnectionReset | ConnectionAborted | BrokenPipe
        | WouldBlock | Interrupted => StoreError::Network(e),
        _ => StoreError::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn multipart_upload_assembles_parts_in_order() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::open(dir.path().to_path_buf()).unwrap();

        let upload = store.initiate_multipart("host/data.tar.gz").unwrap();
        store.upload_part(&upload, 1, b"first ").unwrap();
        store.upload_part(&upload, 2, b"second ").unwrap();
        store.upload_part(&upload, 3, b"third").unwrap();
        store.complete(&upload).unwrap();

        let object = fs::read(dir.path().join("host/data.tar.gz")).unwrap();
        assert_eq!(object, b"first second third");
        // staging is gone once the object is durable
        assert!(store.list_in_progress_uploads().unwrap().is_empty());
    }

    #[test]
    fn in_progress_uploads_are_listed_with_their_key() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::open(dir.path().to_path_buf()).unwrap();

        let upload = store.initiate_multipart("host/pending.tar.gz").unwrap();
        store.upload_part(&upload, 1, b"data").unwrap();

        let uploads = store.list_in_progress_uploads().unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].key, "host/pending.tar.gz");
        assert_eq!(uploads[0].upload_id, upload);
    }

    #[test]
    fn part_upload_to_unknown_id_is_a_protocol_error() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::open(dir.path().to_path_buf()).unwrap();

        let result = store.upload_part(&"nonexistent".to_string(), 1, b"data");
        assert!(matches!(result, Err(StoreError::Protocol(_))));
    }

    #[test]
    fn completing_an_empty_upload_produces_an_empty_object() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::open(dir.path().to_path_buf()).unwrap();

        let upload = store.initiate_multipart("host/empty.tar.gz").unwrap();
        store.complete(&upload).unwrap();

        let object = fs::read(dir.path().join("host/empty.tar.gz")).unwrap();
        assert!(object.is_empty());
    }
}
