//! In-memory object store with scriptable failures.
//!
//! Backs the transfer engine tests: transient network failures can be
//! injected for a specific part or for the store as a whole, and the
//! assembled objects inspected afterwards.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::sync::Mutex;

use super::{InProgressUpload, ObjectStore, StoreError, UploadId};

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    objects: HashMap<String, Vec<u8>>,
    uploads: HashMap<UploadId, Upload>,
    completions: HashMap<String, u32>,
    fail_once: HashSet<(String, u32)>,
    fail_connects: u32,
    parts_failing: bool,
    unreachable: bool,
    next_id: u64,
}

struct Upload {
    key: String,
    parts: BTreeMap<u32, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first upload attempt of `part_number` for the object `key`
    /// with a transient error.
    pub fn fail_once_on(&self, key: &str, part_number: u32) {
        self.inner
            .lock()
            .unwrap()
            .fail_once
            .insert((key.to_string(), part_number));
    }

    /// Fail the next `count` reconnect attempts with transient errors.
    pub fn fail_connects(&self, count: u32) {
        self.inner.lock().unwrap().fail_connects = count;
    }

    /// While set, every part upload fails with a transient error. Other
    /// operations, reconnects included, keep working.
    pub fn set_parts_failing(&self, parts_failing: bool) {
        self.inner.lock().unwrap().parts_failing = parts_failing;
    }

    /// While unreachable every store operation, reconnects included, fails
    /// with a transient error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.lock().unwrap().unreachable = unreachable;
    }

    /// Content of a completed object.
    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().objects.get(key).cloned()
    }

    /// How often `complete` was called for `key`.
    pub fn completions(&self, key: &str) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .completions
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn in_progress(&self) -> usize {
        self.inner.lock().unwrap().uploads.len()
    }
}

fn network(message: &str) -> StoreError {
    StoreError::Network(io::Error::new(
        io::ErrorKind::ConnectionReset,
        message.to_string(),
    ))
}

impl ObjectStore for MemoryStore {
    fn reconnect(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.unreachable {
            return Err(network("store unreachable"));
        }
        if inner.fail_connects > 0 {
            inner.fail_connects -= 1;
            return Err(network("injected reconnect failure"));
        }
        Ok(())
    }

    fn initiate_multipart(&self, key: &str) -> Result<UploadId, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.unreachable {
            return Err(network("store unreachable"));
        }

        inner.next_id += 1;
        let upload_id = format!("mem-{:04}", inner.next_id);
        inner.uploads.insert(
            upload_id.clone(),
            Upload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    fn upload_part(
        &self,
        upload: &UploadId,
        part_number: u32,
        bytes: &[u8],
    ) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.unreachable {
            return Err(network("store unreachable"));
        }
        if inner.parts_failing {
            return Err(network("injected part failure"));
        }

        let key = inner
            .uploads
            .get(upload)
            .ok_or_else(|| StoreError::Protocol(format!("unknown upload id {upload}")))?
            .key
            .clone();
        if inner.fail_once.remove(&(key, part_number)) {
            return Err(network("injected part failure"));
        }

        inner
            .uploads
            .get_mut(upload)
            .expect("upload id was just present")
            .parts
            .insert(part_number, bytes.to_vec());
        Ok(bytes.len())
    }

    fn complete(&self, upload: &UploadId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.unreachable {
            return Err(network("store unreachable"));
        }

        let finished = inner
            .uploads
            .remove(upload)
            .ok_or_else(|| StoreError::Protocol(format!("unknown upload id {upload}")))?;

        let mut object = Vec::new();
        for part in finished.parts.values() {
            object.extend_from_slice(part);
        }
        inner.objects.insert(finished.key.clone(), object);
        *inner.completions.entry(finished.key).or_insert(0) += 1;
        Ok(())
    }

    fn list_in_progress_uploads(&self) -> Result<Vec<InProgressUpload>, StoreError> {
        let inner = self.inner.lock().unwrap();
        if inner.unreachable {
            return Err(network("store unreachable"));
        }

        Ok(inner
            .uploads
            .iter()
            .map(|(upload_id, upload)| InProgressUpload {
                key: upload.key.clone(),
                upload_id: upload_id.clone(),
            })
            .collect())
    }
}
