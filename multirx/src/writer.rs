//! Per-channel file writers.
//!
//! A [`WriterWorker`] owns one channel's [`BlockConsumer`] and one output
//! file. It polls the queue, writes every block's samples verbatim, and naps
//! for a short while when there's nothing to do. That nap is the only place it
//! waits; it is off the real-time path, so latency is traded for CPU time.
//!
//! A writer never stops just because the [`StopFlag`] is set. Once it sees the
//! flag it flushes, polls faster, and keeps draining until the queue reports
//! [`Dequeue::Closed`], meaning the producer has been dropped and every queued
//! block has been written.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
    thread,
    time::Duration,
};

use tracing::{debug, error, info};

use crate::{
    Error, StopFlag,
    queue::{BlockConsumer, Dequeue},
};

/// How long a writer sleeps when its queue is empty.
pub const DEFAULT_IDLE: Duration = Duration::from_millis(100);

/// Idle interval used once a stop has been requested.
const DRAIN_IDLE: Duration = Duration::from_millis(5);

/// Buffer size between the writer and the file.
const WRITE_BUF_SIZE: usize = 1 << 20;

/// What a writer accomplished.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriterReport {
    /// Channel index.
    pub channel: usize,
    /// Destination file.
    pub path: PathBuf,
    /// False if persistence was disabled and nothing was written.
    pub persisted: bool,
    /// Blocks written.
    pub blocks: u64,
    /// Samples written.
    pub samples: u64,
    /// Bytes written.
    pub bytes: u64,
}

impl WriterReport {
    fn new(channel: usize, path: PathBuf, persisted: bool) -> Self {
        Self {
            channel,
            path,
            persisted,
            blocks: 0,
            samples: 0,
            bytes: 0,
        }
    }
}

/// Persists one channel's blocks to one file.
#[derive(Debug)]
pub struct WriterWorker {
    channel: usize,
    path: PathBuf,
    idle: Duration,
    queue: Option<BlockConsumer>,
}

impl WriterWorker {
    /// Set up a writer draining `queue` into the file at `path`.
    pub fn new(channel: usize, path: impl Into<PathBuf>, queue: BlockConsumer) -> Self {
        Self {
            channel,
            path: path.into(),
            idle: DEFAULT_IDLE,
            queue: Some(queue),
        }
    }

    /// Set up a writer for a run with persistence turned off. It performs no
    /// I/O and finishes immediately.
    pub fn disabled(channel: usize, path: impl Into<PathBuf>) -> Self {
        Self {
            channel,
            path: path.into(),
            idle: DEFAULT_IDLE,
            queue: None,
        }
    }

    /// Change how long the writer sleeps when its queue is empty.
    pub fn with_idle(mut self, idle: Duration) -> Self {
        self.idle = idle;
        self
    }

    /// Run the writer on a new thread named `writer-<channel>`.
    pub fn spawn(
        self,
        stop: StopFlag,
    ) -> std::io::Result<thread::JoinHandle<Result<WriterReport, Error>>> {
        thread::Builder::new()
            .name(format!("writer-{}", self.channel))
            .spawn(move || self.run(&stop))
    }

    /// Run the writer on the current thread until its queue is closed and
    /// drained.
    pub fn run(self, stop: &StopFlag) -> Result<WriterReport, Error> {
        let Self {
            channel,
            path,
            idle,
            queue,
        } = self;

        let Some(queue) = queue else {
            debug!(channel, "Writing disabled, writer exiting");
            return Ok(WriterReport::new(channel, path, false));
        };

        let file = match File::create(&path) {
            Ok(file) => file,
            Err(source) => {
                error!("File {} failed to open: {}", path.display(), source);
                return Err(Error::FileOpen { path, source });
            }
        };
        let mut out = BufWriter::with_capacity(WRITE_BUF_SIZE, file);
        let mut report = WriterReport::new(channel, path, true);

        if let Err(source) = drain(&queue, &mut out, &mut report, idle, stop) {
            error!("Failed writing {}: {}", report.path.display(), source);
            return Err(Error::FileWrite {
                path: report.path,
                source,
            });
        }

        let result = out
            .into_inner()
            .map_err(|e| e.into_error())
            .and_then(|file| file.sync_all());
        if let Err(source) = result {
            error!("Failed finishing {}: {}", report.path.display(), source);
            return Err(Error::FileWrite {
                path: report.path,
                source,
            });
        }

        info!(
            channel,
            samples = report.samples,
            "File {} written!",
            report.path.display()
        );
        Ok(report)
    }
}

fn drain(
    queue: &BlockConsumer,
    out: &mut BufWriter<File>,
    report: &mut WriterReport,
    mut idle: Duration,
    stop: &StopFlag,
) -> std::io::Result<()> {
    let mut draining = false;
    loop {
        match queue.try_dequeue() {
            Dequeue::Block(block) => {
                out.write_all(block.bytes())?;
                report.blocks += 1;
                report.samples += block.len() as u64;
                report.bytes += block.bytes().len() as u64;
                continue;
            }
            Dequeue::Closed => return out.flush(),
            Dequeue::Empty => (),
        }

        if !draining && stop.is_stopped() {
            draining = true;
            idle = idle.min(DRAIN_IDLE);
            debug!(channel = report.channel, "Stop requested, draining queue");
            out.flush()?;
        }
        thread::sleep(idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Block, SAMPLE_SIZE, Sample, queue::channel_queue};

    fn block(start: i16, len: usize) -> Block {
        Block::from(
            (0..len)
                .map(|i| Sample::new(start, start.wrapping_add(i as i16)))
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn writes_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ch0.dat");
        let (tx, rx) = channel_queue(8);
        let expected: Vec<u8> = (0..3)
            .flat_map(|i| block(i * 10, 5).bytes().to_vec())
            .collect();
        for i in 0..3 {
            tx.try_enqueue(block(i * 10, 5)).unwrap();
        }
        drop(tx);

        let stop = StopFlag::new();
        let report = WriterWorker::new(0, &path, rx)
            .with_idle(Duration::from_millis(1))
            .run(&stop)
            .unwrap();
        assert_eq!(report.blocks, 3);
        assert_eq!(report.samples, 15);
        assert_eq!(report.bytes, 15 * SAMPLE_SIZE as u64);
        assert_eq!(std::fs::read(&path).unwrap(), expected);
    }

    #[test]
    fn drains_after_stop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ch1.dat");
        let (tx, rx) = channel_queue(64);
        let stop = StopFlag::new();
        for i in 0..10 {
            tx.try_enqueue(block(i, 100)).unwrap();
        }
        stop.request_stop();

        let handle = WriterWorker::new(1, &path, rx)
            .with_idle(Duration::from_millis(1))
            .spawn(stop.clone())
            .unwrap();

        // The producer may still push a little after the flag goes up.
        std::thread::sleep(Duration::from_millis(20));
        for i in 10..15 {
            tx.try_enqueue(block(i, 100)).unwrap();
        }
        drop(tx);

        let report = handle.join().unwrap().unwrap();
        assert_eq!(report.blocks, 15);
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            15 * 100 * SAMPLE_SIZE as u64
        );
    }

    #[test]
    fn open_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no-such-dir").join("ch2.dat");
        let (_tx, rx) = channel_queue(4);
        let err = WriterWorker::new(2, &path, rx)
            .run(&StopFlag::new())
            .unwrap_err();
        match err {
            Error::FileOpen { path: p, .. } => assert_eq!(p, path),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn disabled_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never.dat");
        let report = WriterWorker::disabled(0, &path)
            .run(&StopFlag::new())
            .unwrap();
        assert!(!report.persisted);
        assert_eq!(report.bytes, 0);
        assert!(!path.exists());
    }
}
