//! Streaming multi-object multipart transfer.
//!
//! The engine turns an unbounded capture stream into a sequence of
//! size-bounded destination objects. Every object is a multipart upload of
//! sequentially numbered parts; when a chunk would push the current object
//! past its size limit the object is completed and the stream continues in
//! a new one with a `.NN` key suffix. Transient store failures are bridged
//! by dropping the possibly-orphaned upload handle, reconnecting and
//! rebinding to the in-progress upload the store reports for the same key,
//! all within one bounded wall-clock budget per failure episode.

pub mod chunk;
pub mod upload;

use std::io;
use std::thread;
use std::time::{Duration, Instant};

use derive_more::{Display, Error, From};

use crate::capture::producer::Producer;
use crate::store::{ObjectStore, StoreError};
use chunk::ChunkReader;
use upload::{UploadError, UploadSession};

/// Tuning knobs of one transfer.
#[derive(Debug, Clone, Copy)]
pub struct TransferTuning {
    /// Size of one uploaded part.
    pub chunk_size: usize,
    /// Upper bound on a single destination object.
    pub max_object_size: u64,
    /// Pause between reconnect attempts.
    pub retry_timeout: Duration,
    /// Wall-clock budget for one unbroken run of transient failures,
    /// measured from the first failure of the episode.
    pub failure_timeout: Duration,
}

/// Outcome of a successful transfer.
#[derive(Debug, Clone, Copy)]
pub struct TransferResult {
    pub objects_used: u32,
    pub bytes_total: u64,
}

#[derive(Debug, Display, Error, From)]
pub enum TransferError {
    /// Reading the capture stream failed.
    #[display("reading the capture stream failed: {_0}")]
    Read(io::Error),

    /// The store refused in a way that is not worth retrying.
    #[display("store failure: {_0}")]
    #[from]
    Store(StoreError),

    /// Transient failures did not clear up within the failure timeout.
    #[display("transfer did not recover within {}s of the first failure", _0.as_secs())]
    RetryBudgetExhausted(#[error(ignore)] Duration),

    /// The current object needs more parts than the store accepts.
    #[display("part number ceiling reached")]
    PartLimit,
}

/// Drives one capture stream into the store.
pub struct TransferEngine<'a, S: ObjectStore + ?Sized> {
    store: &'a S,
    tuning: TransferTuning,
}

impl<'a, S: ObjectStore + ?Sized> TransferEngine<'a, S> {
    pub fn new(store: &'a S, tuning: TransferTuning) -> Self {
        Self { store, tuning }
    }

    /// Stream the producer's output into one or more destination objects
    /// rooted at `stem`. An empty stream still produces exactly one
    /// completed, empty object.
    pub fn run<P: Producer + ?Sized>(
        &self,
        producer: &mut P,
        stem: &str,
    ) -> Result<TransferResult, TransferError> {
        let mut reader = ChunkReader::new(producer, self.tuning.chunk_size);
        let mut session = UploadSession::open(self.store, stem.to_string())?;
        let mut objects_used: u32 = 1;
        let mut rollovers: u32 = 0;
        let mut bytes_total: u64 = 0;

        while let Some(chunk) = reader.next_chunk().map_err(TransferError::Read)? {
            // rollover on exceeding the limit, not on reaching it
            if session.bytes_uploaded() + chunk.len() as u64 > self.tuning.max_object_size {
                session.complete()?;
                rollovers += 1;
                objects_used += 1;

                let key = format!("{stem}.{rollovers:02}");
                log::info!(target: "transfer", "Object size limit reached, continuing in {key}");
                session = UploadSession::open(self.store, key)?;
            }

            session = self.upload_with_recovery(session, &chunk)?;
            bytes_total += chunk.len() as u64;
        }

        session.complete()?;
        log::info!(
            target: "transfer",
            "Transferred {bytes_total} bytes into {objects_used} object(s) at {stem}"
        );

        Ok(TransferResult {
            objects_used,
            bytes_total,
        })
    }

    /// Upload one chunk, bridging transient failures until the failure
    /// timeout of the episode is exhausted. The episode ends with the
    /// chunk's successful upload.
    fn upload_with_recovery(
        &self,
        mut session: UploadSession<'a, S>,
        chunk: &[u8],
    ) -> Result<UploadSession<'a, S>, TransferError> {
        let mut first_failure: Option<Instant> = None;

        loop {
            match session.upload_part(chunk) {
                Ok(_) => return Ok(session),
                Err(UploadError::PartLimit) => return Err(TransferError::PartLimit),
                Err(UploadError::Store(e)) if e.is_transient() => {
                    log::warn!(
                        target: "transfer",
                        "Transient failure uploading part {} of {}: {e}",
                        session.part_number(),
                        session.key()
                    );
                    let since = *first_failure.get_or_insert_with(Instant::now);
                    session = self.reestablish(session, since)?;
                }
                Err(UploadError::Store(e)) => return Err(TransferError::Store(e)),
            }
        }
    }

    /// The handle may be orphaned on the store side: drop it, reconnect
    /// and look for an in-progress upload under the current object's exact
    /// key. The local part counter stays authoritative for the next part
    /// number; what the store already received is not reconciled, so a
    /// rebind does not guarantee the next part upload succeeds.
    fn reestablish(
        &self,
        session: UploadSession<'a, S>,
        first_failure: Instant,
    ) -> Result<UploadSession<'a, S>, TransferError> {
        let (key, part_number, bytes_uploaded) = session.abandon();

        loop {
            if first_failure.elapsed() > self.tuning.failure_timeout {
                return Err(TransferError::RetryBudgetExhausted(
                    self.tuning.failure_timeout,
                ));
            }

            match self.rebind(&key, part_number, bytes_uploaded) {
                Ok(session) => return Ok(session),
                Err(e) if e.is_transient() => {
                    log::warn!(
                        target: "transfer",
                        "Reconnect failed: {e}; next attempt in {}s",
                        self.tuning.retry_timeout.as_secs()
                    );
                    thread::sleep(self.tuning.retry_timeout);
                }
                Err(e) => return Err(TransferError::Store(e)),
            }
        }
    }

    fn rebind(
        &self,
        key: &str,
        part_number: u32,
        bytes_uploaded: u64,
    ) -> Result<UploadSession<'a, S>, StoreError> {
        self.store.reconnect()?;

        let uploads = self.store.list_in_progress_uploads()?;
        match uploads.into_iter().find(|upload| upload.key == key) {
            Some(found) => {
                log::info!(target: "transfer", "Resuming upload {} of {key}", found.upload_id);
                Ok(UploadSession::adopt(
                    self.store,
                    key.to_string(),
                    found.upload_id,
                    part_number,
                    bytes_uploaded,
                ))
            }
            // nothing to take over before the first part: the failure hit
            // before the store registered the upload, start the object over
            None if part_number == 1 => UploadSession::open(self.store, key.to_string()),
            None => Err(StoreError::Protocol(format!(
                "in-progress upload of {key} disappeared after {} part(s)",
                part_number - 1
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::producer::testing::ScriptedProducer;
    use crate::store::MemoryStore;

    fn tuning(chunk_size: usize, max_object_size: u64) -> TransferTuning {
        TransferTuning {
            chunk_size,
            max_object_size,
            retry_timeout: Duration::ZERO,
            failure_timeout: Duration::from_millis(50),
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn empty_stream_still_produces_one_completed_object() {
        let store = MemoryStore::new();
        let engine = TransferEngine::new(&store, tuning(10, 100));
        let mut producer = ScriptedProducer::new(Vec::new());

        let result = engine.run(&mut producer, "key").unwrap();

        assert_eq!(result.objects_used, 1);
        assert_eq!(result.bytes_total, 0);
        assert_eq!(store.completions("key"), 1);
        assert_eq!(store.object("key").unwrap(), b"");
    }

    #[test]
    fn oversized_capture_rolls_over_into_suffixed_objects() {
        // 40 bytes at chunk size 10 and object limit 25: the first object
        // takes parts of 10, 10 and 5 bytes, the second the remaining 15
        let store = MemoryStore::new();
        let engine = TransferEngine::new(&store, tuning(10, 25));
        let data = payload(40);
        let mut producer = ScriptedProducer::new(data.clone());

        let result = engine.run(&mut producer, "key").unwrap();

        assert_eq!(result.objects_used, 2);
        assert_eq!(result.bytes_total, 40);
        assert_eq!(store.object("key").unwrap(), &data[..25]);
        assert_eq!(store.object("key.01").unwrap(), &data[25..]);
        assert_eq!(store.completions("key"), 1);
        assert_eq!(store.completions("key.01"), 1);
    }

    #[test]
    fn chunk_reaching_the_limit_exactly_does_not_roll_over() {
        let store = MemoryStore::new();
        let engine = TransferEngine::new(&store, tuning(10, 20));
        let mut producer = ScriptedProducer::new(payload(20));

        let result = engine.run(&mut producer, "key").unwrap();

        assert_eq!(result.objects_used, 1);
        assert_eq!(store.object("key").unwrap().len(), 20);
    }

    #[test]
    fn object_count_is_the_stream_size_over_the_object_limit() {
        let store = MemoryStore::new();
        let engine = TransferEngine::new(&store, tuning(10, 30));
        let mut producer = ScriptedProducer::new(payload(100));

        let result = engine.run(&mut producer, "key").unwrap();

        // ceil(100 / 30)
        assert_eq!(result.objects_used, 4);
        for key in ["key", "key.01", "key.02", "key.03"] {
            assert_eq!(store.completions(key), 1);
        }
        assert_eq!(store.object("key.03").unwrap().len(), 10);
    }

    #[test]
    fn objects_reassemble_to_the_original_stream() {
        let store = MemoryStore::new();
        let engine = TransferEngine::new(&store, tuning(7, 20));
        let data = payload(64);
        let mut producer = ScriptedProducer::new(data.clone());

        engine.run(&mut producer, "key").unwrap();

        let mut reassembled = store.object("key").unwrap();
        let mut suffix = 1;
        while let Some(part) = store.object(&format!("key.{suffix:02}")) {
            reassembled.extend_from_slice(&part);
            suffix += 1;
        }
        assert_eq!(reassembled, data);
    }

    #[test]
    fn transient_part_failure_resumes_the_same_object() {
        let store = MemoryStore::new();
        store.fail_once_on("key", 2);
        let engine = TransferEngine::new(&store, tuning(10, 1_000));
        let data = payload(50);
        let mut producer = ScriptedProducer::new(data.clone());

        let result = engine.run(&mut producer, "key").unwrap();

        // all 5 parts land in the one original object
        assert_eq!(result.objects_used, 1);
        assert_eq!(store.object("key").unwrap(), data);
        assert_eq!(store.completions("key"), 1);
        assert_eq!(store.in_progress(), 0);
    }

    #[test]
    fn recovery_rides_out_failing_reconnects() {
        let store = MemoryStore::new();
        store.fail_once_on("key", 1);
        store.fail_connects(3);
        let engine = TransferEngine::new(&store, tuning(10, 1_000));
        let data = payload(10);
        let mut producer = ScriptedProducer::new(data.clone());

        let result = engine.run(&mut producer, "key").unwrap();

        assert_eq!(result.objects_used, 1);
        assert_eq!(store.object("key").unwrap(), data);
    }

    #[test]
    fn persistent_transient_failures_exhaust_the_retry_budget() {
        let store = MemoryStore::new();
        // every part upload fails, every reconnect and rebind succeeds;
        // the engine keeps retrying until the failure timeout is spent
        store.set_parts_failing(true);
        let engine = TransferEngine::new(&store, tuning(10, 1_000));
        let mut producer = ScriptedProducer::new(payload(10));

        let result = engine.run(&mut producer, "key");

        assert!(matches!(
            result,
            Err(TransferError::RetryBudgetExhausted(_))
        ));
        assert_eq!(store.completions("key"), 0);
    }
}
