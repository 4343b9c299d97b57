//! Fixed-size chunking of a producer's output stream.

use std::io;
use std::thread;
use std::time::Duration;

use crate::capture::producer::Producer;

/// Pause before re-polling a live producer that returned no bytes.
const IDLE_READ_DELAY: Duration = Duration::from_millis(50);

/// Pulls chunks of up to `chunk_size` bytes from a producer.
pub struct ChunkReader<'a, P: Producer + ?Sized> {
    producer: &'a mut P,
    chunk_size: usize,
}

impl<'a, P: Producer + ?Sized> ChunkReader<'a, P> {
    pub fn new(producer: &'a mut P, chunk_size: usize) -> Self {
        Self {
            producer,
            chunk_size,
        }
    }

    /// Next chunk of the stream, `None` at its end.
    ///
    /// Every chunk but the last is filled to `chunk_size`. A zero-length
    /// read from a live producer is not end-of-stream: the stream only
    /// ends once the pipe is dry and the producer has exited.
    pub fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut chunk = vec![0u8; self.chunk_size];
        let mut filled = 0;

        while filled < self.chunk_size {
            match self.producer.read(&mut chunk[filled..]) {
                Ok(0) => {
                    if self.producer.is_alive() {
                        thread::sleep(IDLE_READ_DELAY);
                        continue;
                    }
                    break;
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        if filled == 0 {
            return Ok(None);
        }
        chunk.truncate(filled);
        Ok(Some(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::producer::testing::ScriptedProducer;

    #[test]
    fn stream_is_split_into_full_chunks_and_a_remainder() {
        let mut producer = ScriptedProducer::new(vec![7u8; 25]);
        let mut reader = ChunkReader::new(&mut producer, 10);

        assert_eq!(reader.next_chunk().unwrap().unwrap().len(), 10);
        assert_eq!(reader.next_chunk().unwrap().unwrap().len(), 10);
        assert_eq!(reader.next_chunk().unwrap().unwrap().len(), 5);
        assert!(reader.next_chunk().unwrap().is_none());
    }

    #[test]
    fn short_reads_still_fill_the_chunk() {
        let mut producer = ScriptedProducer::new(vec![1u8; 16]).with_max_read(3);
        let mut reader = ChunkReader::new(&mut producer, 8);

        assert_eq!(reader.next_chunk().unwrap().unwrap().len(), 8);
        assert_eq!(reader.next_chunk().unwrap().unwrap().len(), 8);
        assert!(reader.next_chunk().unwrap().is_none());
    }

    #[test]
    fn empty_read_from_a_live_producer_is_not_end_of_stream() {
        let mut producer = ScriptedProducer::new(b"late data".to_vec()).with_empty_reads(3);
        let mut reader = ChunkReader::new(&mut producer, 16);

        let chunk = reader.next_chunk().unwrap().unwrap();
        assert_eq!(chunk, b"late data");
        assert!(reader.next_chunk().unwrap().is_none());
    }

    #[test]
    fn exhausted_producer_yields_no_chunk() {
        let mut producer = ScriptedProducer::new(Vec::new());
        let mut reader = ChunkReader::new(&mut producer, 16);

        assert!(reader.next_chunk().unwrap().is_none());
    }
}
