use std::{path::PathBuf, thread, time::Duration};

use tracing::{error, info};

use crate::{
    AcquisitionParams, AcquisitionReport, Error, RxDevice, StopFlag, StreamCmd, acquisition,
    queue::{self, BlockProducer},
    writer::{DEFAULT_IDLE, WriterReport, WriterWorker},
};

/// Default delay between issuing the start command and the first sample.
pub const DEFAULT_START_DELAY: Duration = Duration::from_millis(1500);

/// Where one channel's samples go.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelContext {
    /// Device channel index.
    pub index: usize,
    /// Destination file.
    pub path: PathBuf,
}

impl ChannelContext {
    /// Send channel `index` to the file at `path`.
    pub fn new(index: usize, path: impl Into<PathBuf>) -> Self {
        Self {
            index,
            path: path.into(),
        }
    }
}

/// Everything needed for one recording run.
#[derive(Clone, Debug)]
pub struct RecordConfig {
    /// One entry per device channel.
    pub channels: Vec<ChannelContext>,
    /// When false, nothing is written and the writers exit right away.
    pub persist: bool,
    /// Samples per channel to record. 0 means until stopped.
    pub total_num_samps: u64,
    /// How far in the future to schedule the stream start.
    pub start_delay: Duration,
    /// Queue depth per channel, in blocks. `None` picks one from the block
    /// size with [`queue::default_depth`].
    pub queue_depth: Option<usize>,
    /// How long writers sleep when their queue is empty.
    pub writer_idle: Duration,
}

impl RecordConfig {
    /// A persisting, unbounded run over the given channels.
    pub fn new(channels: Vec<ChannelContext>) -> Self {
        Self {
            channels,
            persist: true,
            total_num_samps: 0,
            start_delay: DEFAULT_START_DELAY,
            queue_depth: None,
            writer_idle: DEFAULT_IDLE,
        }
    }

    /// Turn writing to disk on or off.
    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Stop after this many samples per channel. 0 runs until stopped.
    pub fn with_total_num_samps(mut self, total_num_samps: u64) -> Self {
        self.total_num_samps = total_num_samps;
        self
    }

    /// Schedule the stream start this far in the future.
    pub fn with_start_delay(mut self, start_delay: Duration) -> Self {
        self.start_delay = start_delay;
        self
    }

    /// Set the queue depth per channel, in blocks.
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = Some(depth);
        self
    }

    /// Set how long writers sleep when their queue is empty.
    pub fn with_writer_idle(mut self, idle: Duration) -> Self {
        self.writer_idle = idle;
        self
    }

    /// Check the channel list against a device with `available` channels, and
    /// get it back sorted by channel index.
    fn validate(&self, available: usize) -> Result<Vec<ChannelContext>, Error> {
        let mut channels = self.channels.clone();
        channels.sort_by_key(|c| c.index);
        for (i, ctx) in channels.iter().enumerate() {
            if ctx.index >= available {
                return Err(Error::InvalidChannel {
                    channel: ctx.index,
                    available,
                });
            }
            if i > 0 && channels[i - 1].index == ctx.index {
                return Err(Error::DuplicateChannel(ctx.index));
            }
        }
        if channels.len() != available {
            return Err(Error::ChannelCount {
                configured: channels.len(),
                device: available,
            });
        }
        Ok(channels)
    }
}

/// Outcome of a recording run.
#[derive(Debug)]
pub struct RecordReport {
    /// What the acquisition loop saw.
    pub acquisition: AcquisitionReport,
    /// Each writer's result, in channel order.
    pub writers: Vec<Result<WriterReport, Error>>,
}

impl RecordReport {
    /// True if every writer finished without error.
    pub fn writers_ok(&self) -> bool {
        self.writers.iter().all(Result::is_ok)
    }
}

/// Record from `device` until done.
///
/// Validates the channel list, schedules the stream start, spawns a writer
/// thread per channel, runs the acquisition loop on the calling thread, and
/// waits for every writer to finish before returning.
///
/// Setting `stop` from another thread ends the run within one receive call.
/// The flag is always set by the time this returns.
///
/// Only startup problems are returned as `Err`. Once streaming has begun,
/// device trouble ends acquisition and shows up in the report, and a failed
/// writer only affects its own entry in [`RecordReport::writers`].
pub fn record<D: RxDevice + ?Sized>(
    device: &mut D,
    config: &RecordConfig,
    stop: &StopFlag,
) -> Result<RecordReport, Error> {
    let channels = config.validate(device.channel_count())?;
    let block_size = device.max_block_size();
    if block_size == 0 {
        return Err(Error::InvalidParameter("device block size is 0"));
    }
    let depth = config
        .queue_depth
        .unwrap_or_else(|| queue::default_depth(block_size));

    info!(
        channels = channels.len(),
        block_size,
        depth,
        "Begin streaming {} samples",
        config.total_num_samps
    );
    let start_at = device.time_now()? + config.start_delay;
    device.issue_stream_cmd(StreamCmd::start(config.total_num_samps, Some(start_at)))?;

    let mut sinks: Vec<BlockProducer> = Vec::with_capacity(channels.len());
    let mut handles = Vec::with_capacity(channels.len());
    for ctx in channels.iter() {
        let worker = if config.persist {
            let (tx, rx) = queue::channel_queue(depth);
            sinks.push(tx);
            WriterWorker::new(ctx.index, &ctx.path, rx)
        } else {
            WriterWorker::disabled(ctx.index, &ctx.path)
        };
        match worker.with_idle(config.writer_idle).spawn(stop.clone()) {
            Ok(handle) => handles.push((ctx.index, handle)),
            Err(e) => {
                error!("Couldn't start writer for channel {}: {}", ctx.index, e);
                stop.request_stop();
                if let Err(e) = device.issue_stream_cmd(StreamCmd::stop()) {
                    error!("Failed to stop streaming: {}", e);
                }
                drop(sinks);
                join_writers(handles);
                return Err(e.into());
            }
        }
    }

    let params = AcquisitionParams::new(&*device, config.total_num_samps, config.start_delay);
    let acquisition = acquisition::run(device, sinks, &params, stop);
    let writers = join_writers(handles);

    Ok(RecordReport {
        acquisition,
        writers,
    })
}

type WriterHandle = thread::JoinHandle<Result<WriterReport, Error>>;

fn join_writers(handles: Vec<(usize, WriterHandle)>) -> Vec<Result<WriterReport, Error>> {
    handles
        .into_iter()
        .map(|(channel, handle)| {
            handle
                .join()
                .unwrap_or(Err(Error::WriterPanicked(channel)))
        })
        .collect()
}
