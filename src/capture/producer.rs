//! External processes producing the capture byte stream.

use std::io::{self, Read};
use std::process::{Child, ChildStdout, Command, Stdio};

use flate2::read::GzEncoder;
use flate2::Compression;

/// A byte-stream producer with process-style lifecycle.
///
/// The chunk reader's end-of-stream rule depends on [`is_alive`]: a
/// zero-length read only counts as end-of-stream once the producer has
/// exited.
///
/// [`is_alive`]: Producer::is_alive
pub trait Producer: Read {
    /// Whether any stage of the pipeline is still running.
    fn is_alive(&mut self) -> bool;

    /// Kill the whole pipeline. Exit collection is left to [`wait`].
    ///
    /// [`wait`]: Producer::wait
    fn terminate(&mut self);

    /// Wait for the pipeline to exit; `true` if every stage succeeded.
    fn wait(&mut self) -> io::Result<bool>;
}

enum PipelineOutput {
    /// Output of the final stage as the filter process emits it.
    Raw(ChildStdout),
    /// Archiver output gzip-compressed in process.
    Compressed(Box<GzEncoder<ChildStdout>>),
}

/// Producer over a spawned archiver, optionally piped through a filter
/// process.
///
/// Without a filter the archiver's output is gzip-compressed in process on
/// the way out; with one (encryption), the filter's output is passed
/// through untouched.
pub struct CommandProducer {
    stages: Vec<Child>,
    output: PipelineOutput,
}

impl CommandProducer {
    pub fn spawn(mut archiver: Command, filter: Option<Command>) -> io::Result<Self> {
        archiver.stdin(Stdio::null()).stdout(Stdio::piped());
        let mut archiver = archiver.spawn()?;
        let archiver_out = archiver.stdout.take().unwrap();
        log::trace!(target: "capture::producer", "Started archiver process");

        match filter {
            Some(mut filter) => {
                filter
                    .stdin(Stdio::from(archiver_out))
                    .stdout(Stdio::piped());
                let mut filter = match filter.spawn() {
                    Ok(filter) => filter,
                    Err(e) => {
                        let _ = archiver.kill();
                        let _ = archiver.wait();
                        return Err(e);
                    }
                };
                let filter_out = filter.stdout.take().unwrap();
                log::trace!(target: "capture::producer", "Started filter process");

                Ok(Self {
                    stages: vec![archiver, filter],
                    output: PipelineOutput::Raw(filter_out),
                })
            }
            None => Ok(Self {
                output: PipelineOutput::Compressed(Box::new(GzEncoder::new(
                    archiver_out,
                    Compression::default(),
                ))),
                stages: vec![archiver],
            }),
        }
    }
}

impl Read for CommandProducer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.output {
            PipelineOutput::Raw(out) => out.read(buf),
            PipelineOutput::Compressed(out) => out.read(buf),
        }
    }
}

impl Producer for CommandProducer {
    fn is_alive(&mut self) -> bool {
        self.stages
            .iter_mut()
            .any(|stage| matches!(stage.try_wait(), Ok(None)))
    }

    fn terminate(&mut self) {
        for stage in &mut self.stages {
            let _ = stage.kill();
        }
    }

    fn wait(&mut self) -> io::Result<bool> {
        let mut all_succeeded = true;
        for stage in &mut self.stages {
            let status = stage.wait()?;
            all_succeeded &= status.success();
        }
        Ok(all_succeeded)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Producer over a fixed byte buffer.
    ///
    /// `empty_reads` leading reads return zero bytes while the producer
    /// still reports itself alive, mimicking a spurious empty read on a
    /// live pipe. `max_read` caps the bytes served per read to exercise
    /// chunk assembly from short reads.
    pub(crate) struct ScriptedProducer {
        data: io::Cursor<Vec<u8>>,
        empty_reads: u32,
        max_read: Option<usize>,
    }

    impl ScriptedProducer {
        pub(crate) fn new(data: impl Into<Vec<u8>>) -> Self {
            Self {
                data: io::Cursor::new(data.into()),
                empty_reads: 0,
                max_read: None,
            }
        }

        pub(crate) fn with_empty_reads(mut self, empty_reads: u32) -> Self {
            self.empty_reads = empty_reads;
            self
        }

        pub(crate) fn with_max_read(mut self, max_read: usize) -> Self {
            self.max_read = Some(max_read);
            self
        }

        fn drained(&self) -> bool {
            self.data.position() >= self.data.get_ref().len() as u64
        }
    }

    impl Read for ScriptedProducer {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.empty_reads > 0 {
                self.empty_reads -= 1;
                return Ok(0);
            }
            match self.max_read {
                Some(max) if max < buf.len() => self.data.read(&mut buf[..max]),
                _ => self.data.read(buf),
            }
        }
    }

    impl Producer for ScriptedProducer {
        fn is_alive(&mut self) -> bool {
            self.empty_reads > 0 || !self.drained()
        }

        fn terminate(&mut self) {
            self.empty_reads = 0;
            let end = self.data.get_ref().len() as u64;
            self.data.set_position(end);
        }

        fn wait(&mut self) -> io::Result<bool> {
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_pipeline_compresses_the_archiver_output() {
        let mut command = Command::new("sh");
        command.arg("-c").arg("printf 'stream payload'");

        let mut producer = CommandProducer::spawn(command, None).unwrap();
        let mut compressed = Vec::new();
        producer.read_to_end(&mut compressed).unwrap();
        assert!(producer.wait().unwrap());
        assert!(!producer.is_alive());

        let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
        let mut payload = String::new();
        decoder.read_to_string(&mut payload).unwrap();
        assert_eq!(payload, "stream payload");
    }

    #[test]
    fn filtered_pipeline_passes_the_filter_output_through() {
        let mut archiver = Command::new("sh");
        archiver.arg("-c").arg("printf 'abc'");
        let mut filter = Command::new("tr");
        filter.arg("a-z").arg("A-Z");

        let mut producer = CommandProducer::spawn(archiver, Some(filter)).unwrap();
        let mut output = String::new();
        producer.read_to_string(&mut output).unwrap();

        assert_eq!(output, "ABC");
        assert!(producer.wait().unwrap());
    }

    #[test]
    fn terminate_kills_a_running_pipeline() {
        let mut command = Command::new("sleep");
        command.arg("30");

        let mut producer = CommandProducer::spawn(command, None).unwrap();
        assert!(producer.is_alive());

        producer.terminate();
        assert!(!producer.wait().unwrap());
    }
}
