//! Background byte producer for stream-read scenarios.
//!
//! The actor owns the write end of a pipe and nothing else; it never sees the
//! ring. The orchestrator reads through [`StimulusActor::reader_fd`] and shares
//! two flags with the actor:
//! - `stop`: set by the orchestrator once its reads are drained
//! - `failed`: set by the actor when a write fails
//!
//! The write end is non-blocking, so a full pipe never wedges the actor: it
//! backs off and re-checks `stop` instead. That keeps shutdown independent of
//! whether anyone (including reads still queued in the kernel) holds the read end.

use std::io::{self, PipeReader, PipeWriter, Write};
use std::os::fd::AsRawFd;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use log::{debug, error};

use crate::constants::{
    STREAM_WARMUP_MS, STREAM_WRITE_INTERVAL_US, STREAM_WRITE_LEN, STREAM_WRITES,
};
use crate::error::ScenarioError;

/// Byte the actor fills every write with.
pub const STREAM_PATTERN: u8 = 0x5a;

/// Pause before retrying a write into a full pipe.
const FULL_PIPE_BACKOFF: Duration = Duration::from_micros(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StimulusConfig {
    pub writes: u32,
    pub write_len: u32,
    pub interval: Duration,
    pub warmup: Duration,
}

impl Default for StimulusConfig {
    fn default() -> Self {
        Self {
            writes: STREAM_WRITES,
            write_len: STREAM_WRITE_LEN,
            interval: Duration::from_micros(STREAM_WRITE_INTERVAL_US),
            warmup: Duration::from_millis(STREAM_WARMUP_MS),
        }
    }
}

impl StimulusConfig {
    pub fn validate(&self) {
        assert!(self.writes > 0, "stimulus must write at least once");
        assert!(self.write_len > 0, "stimulus writes must be non-empty");
    }

    pub fn total_bytes(&self) -> u64 {
        u64::from(self.writes) * u64::from(self.write_len)
    }
}

/// What the actor managed to write before it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StimulusSummary {
    pub writes: u32,
    pub bytes: u64,
    pub short_writes: u32,
    /// The actor saw `stop` before finishing its writes.
    pub stopped_early: bool,
}

/// Handle to the running actor.
pub struct StimulusActor {
    handle: Option<thread::JoinHandle<io::Result<StimulusSummary>>>,
    reader: PipeReader,
    stop: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
}

impl StimulusActor {
    /// Creates the pipe and starts writing `config.writes` patterned chunks into it.
    pub fn spawn(config: StimulusConfig) -> Result<Self, ScenarioError> {
        config.validate();

        let (reader, writer) = io::pipe().map_err(|e| ScenarioError::io("create pipe", e))?;
        set_nonblocking(&writer).map_err(|e| ScenarioError::io("set pipe non-blocking", e))?;

        let stop = Arc::new(AtomicBool::new(false));
        let failed = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);
        let worker_failed = Arc::clone(&failed);

        let handle = thread::Builder::new()
            .name("stimulus".into())
            .spawn(move || produce(config, writer, &worker_stop, &worker_failed))
            .map_err(|e| ScenarioError::io("spawn stimulus actor", e))?;

        Ok(Self {
            handle: Some(handle),
            reader,
            stop,
            failed,
        })
    }

    /// Read end of the pipe. Valid for as long as the actor lives.
    pub fn reader_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    /// Fails once the actor has reported a write error.
    pub fn check(&self) -> Result<(), ScenarioError> {
        if self.failed.load(Ordering::Acquire) {
            return Err(ScenarioError::Stimulus(
                "write to stream failed before stop".into(),
            ));
        }
        Ok(())
    }

    /// Stops the actor and joins it.
    ///
    /// The read end closes when the returned handle is dropped, so no read may
    /// still be in flight on [`reader_fd`](Self::reader_fd).
    pub fn finish(mut self) -> Result<StimulusSummary, ScenarioError> {
        self.stop.store(true, Ordering::Release);
        self.join()
    }

    fn join(&mut self) -> Result<StimulusSummary, ScenarioError> {
        let Some(handle) = self.handle.take() else {
            return Ok(StimulusSummary::default());
        };
        match handle.join() {
            Ok(Ok(summary)) => Ok(summary),
            Ok(Err(e)) => Err(ScenarioError::Stimulus(e.to_string())),
            Err(_) => Err(ScenarioError::Stimulus("stimulus thread panicked".into())),
        }
    }
}

impl Drop for StimulusActor {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop.store(true, Ordering::Release);
            let _ = self.join();
        }
    }
}

fn set_nonblocking(writer: &PipeWriter) -> io::Result<()> {
    let fd = writer.as_raw_fd();
    // SAFETY: `fd` is a live descriptor owned by `writer`.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: As above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn produce(
    config: StimulusConfig,
    mut writer: PipeWriter,
    stop: &AtomicBool,
    failed: &AtomicBool,
) -> io::Result<StimulusSummary> {
    let chunk = vec![STREAM_PATTERN; config.write_len as usize];
    let mut summary = StimulusSummary::default();

    thread::sleep(config.warmup);

    while summary.writes < config.writes {
        if stop.load(Ordering::Acquire) {
            summary.stopped_early = true;
            break;
        }

        match writer.write(&chunk) {
            Ok(n) => {
                if n < chunk.len() {
                    debug!("short write {n}");
                    summary.short_writes += 1;
                }
                summary.writes += 1;
                summary.bytes += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(FULL_PIPE_BACKOFF);
                continue;
            }
            Err(e) => {
                error!("stimulus write: {e}");
                failed.store(true, Ordering::Release);
                return Err(e);
            }
        }

        thread::sleep(config.interval);
    }

    debug!(
        "stimulus done: {} writes, {} bytes",
        summary.writes, summary.bytes
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Read;
    use std::mem::ManuallyDrop;
    use std::os::fd::FromRawFd;

    use super::*;

    fn quick(writes: u32, write_len: u32) -> StimulusConfig {
        StimulusConfig {
            writes,
            write_len,
            interval: Duration::ZERO,
            warmup: Duration::ZERO,
        }
    }

    /// Borrows the actor's read end as a `File` without taking ownership.
    fn reader(actor: &StimulusActor) -> ManuallyDrop<File> {
        // SAFETY: The actor keeps the fd open; ManuallyDrop never closes it.
        ManuallyDrop::new(unsafe { File::from_raw_fd(actor.reader_fd()) })
    }

    #[test]
    fn writes_every_chunk_with_the_pattern() {
        let config = quick(8, 512);
        let actor = StimulusActor::spawn(config).unwrap();

        let mut bytes = vec![0u8; config.total_bytes() as usize];
        reader(&actor).read_exact(&mut bytes).unwrap();
        assert!(bytes.iter().all(|&b| b == STREAM_PATTERN));
        assert!(actor.check().is_ok());

        let summary = actor.finish().unwrap();
        assert_eq!(summary.writes, 8);
        assert_eq!(summary.bytes, config.total_bytes());
        assert!(!summary.stopped_early);
    }

    #[test]
    fn stop_releases_a_writer_facing_a_full_pipe() {
        // Far more than any pipe buffer holds, and nobody reads.
        let actor = StimulusActor::spawn(quick(4096, 4096)).unwrap();
        thread::sleep(Duration::from_millis(20));

        let summary = actor.finish().unwrap();
        assert!(summary.stopped_early);
        assert!(summary.writes < 4096);
    }

    #[test]
    fn dropping_the_actor_joins_it() {
        let actor = StimulusActor::spawn(quick(4096, 4096)).unwrap();
        drop(actor);
    }

    #[test]
    #[should_panic(expected = "stimulus must write at least once")]
    fn zero_writes_rejected() {
        quick(0, 64).validate();
    }
}
