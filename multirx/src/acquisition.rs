//! The real-time acquisition loop.
//!
//! One thread calls [`RxDevice::recv`] back to back, one block per channel per
//! call, and pushes each block into its channel's queue without ever waiting
//! on the queue. The device's own receive timeout is the only thing this loop
//! waits on.
//!
//! Every call's metadata is classified:
//!
//! - timeout: acquisition is over.
//! - overflow: counted, warned about once per run, and the (empty) block is
//!   dropped.
//! - out-of-sequence: logged, the block is kept.
//! - any other device error: logged, the block is kept.
//!
//! The loop also ends when the [`StopFlag`] is set, when the receive call
//! itself fails, or once a finite sample target has been reached. On the way
//! out it stops the stream, sets the stop flag for everyone else, and closes
//! the queues by dropping their producers.

use std::time::Duration;

use tracing::{error, info, trace, warn};

use crate::{
    Block, BlockPool, RxDevice, RxErrorCode, SAMPLE_SIZE, StopFlag, StreamCmd,
    queue::BlockProducer,
};

/// Slack added on top of the expected wait for every receive call.
pub const TIMEOUT_MARGIN: Duration = Duration::from_millis(100);

/// Timing and length parameters for one acquisition run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcquisitionParams {
    /// Samples per channel to acquire. 0 means run until stopped.
    pub total_num_samps: u64,
    /// Timeout for the very first receive call, which also has to wait out
    /// the scheduled stream start.
    pub first_timeout: Duration,
    /// Timeout for every later receive call.
    pub timeout: Duration,
}

impl AcquisitionParams {
    /// Work out the receive timeouts for a device whose stream was scheduled
    /// to start `start_delay` from now.
    pub fn new<D: RxDevice + ?Sized>(device: &D, total_num_samps: u64, start_delay: Duration) -> Self {
        let rate = device.sample_rate();
        let interval = if rate > 0.0 {
            Duration::try_from_secs_f64(device.max_block_size() as f64 / rate)
                .unwrap_or(Duration::ZERO)
        } else {
            Duration::ZERO
        };
        Self {
            total_num_samps,
            first_timeout: start_delay + TIMEOUT_MARGIN,
            timeout: interval + TIMEOUT_MARGIN,
        }
    }
}

/// Why the acquisition loop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndReason {
    /// The stop flag was set from outside the loop.
    StopRequested,
    /// The finite sample target was reached.
    TargetReached,
    /// The device timed out.
    Timeout,
    /// The receive call failed.
    DeviceError,
}

/// Counters accumulated by the acquisition loop.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunCounters {
    /// Samples per channel accepted from the device. Overflowed blocks are
    /// not counted.
    pub num_acc_samps: u64,
    /// Number of overflow indications.
    pub num_overflow: u64,
    /// Whether the overflow warning has been shown.
    pub overflow_warned: bool,
    /// Number of receive calls made.
    pub iterations: u64,
    /// Blocks refused by each channel's queue.
    pub dropped_blocks: Vec<u64>,
}

impl RunCounters {
    fn new(channels: usize) -> Self {
        Self {
            dropped_blocks: vec![0; channels],
            ..Self::default()
        }
    }

    /// Count an overflow. Returns true the first time only, when the warning
    /// should be shown.
    fn overflow(&mut self) -> bool {
        self.num_overflow += 1;
        !core::mem::replace(&mut self.overflow_warned, true)
    }

    /// Total blocks dropped across all channels.
    pub fn total_dropped(&self) -> u64 {
        self.dropped_blocks.iter().sum()
    }
}

/// Outcome of an acquisition run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcquisitionReport {
    /// Final counters.
    pub counters: RunCounters,
    /// What ended the loop.
    pub end: EndReason,
    /// Sample target the run was started with.
    pub total_num_samps: u64,
}

impl AcquisitionReport {
    /// True if a finite target was set, wasn't reached, and nobody asked the
    /// loop to stop.
    pub fn incomplete(&self) -> bool {
        self.total_num_samps > 0
            && self.counters.num_acc_samps < self.total_num_samps
            && self.end != EndReason::StopRequested
    }
}

/// Run the acquisition loop until one of its end conditions is hit.
///
/// `sinks` holds one queue producer per device channel, in channel order, or
/// is empty when nothing is being persisted. The device must already have been
/// issued its start command.
pub fn run<D: RxDevice + ?Sized>(
    device: &mut D,
    sinks: Vec<BlockProducer>,
    params: &AcquisitionParams,
    stop: &StopFlag,
) -> AcquisitionReport {
    let nchan = device.channel_count();
    let max_samps = device.max_block_size();
    debug_assert!(sinks.is_empty() || sinks.len() == nchan);

    let pool = BlockPool::new(max_samps);
    let mut blocks: Vec<Block> = Vec::with_capacity(nchan);
    let mut counters = RunCounters::new(nchan);
    let mut timeout = params.first_timeout;
    let target = params.total_num_samps;

    info!("Beginning streaming");
    let end = loop {
        if stop.is_stopped() {
            break EndReason::StopRequested;
        }
        if target > 0 && counters.num_acc_samps >= target {
            break EndReason::TargetReached;
        }

        blocks.clear();
        blocks.extend((0..nchan).map(|_| pool.get()));

        let (num_rx_samps, md) = match device.recv(&mut blocks, max_samps, timeout) {
            Ok(r) => r,
            Err(e) => {
                error!("Receive call failed: {}", e);
                break EndReason::DeviceError;
            }
        };
        timeout = params.timeout;
        counters.iterations += 1;

        if md.error_code == RxErrorCode::Timeout {
            error!("Timeout while streaming");
            break EndReason::Timeout;
        }
        if md.out_of_sequence {
            warn!(iteration = counters.iterations, "Out of sequence");
        }
        match md.error_code {
            RxErrorCode::None => (),
            RxErrorCode::Overflow => {
                if counters.overflow() {
                    let mb_per_sec =
                        device.sample_rate() * (SAMPLE_SIZE * nchan) as f64 / 1e6;
                    warn!(
                        "Got an overflow indication. Please consider the following:\n  \
                         Your write medium must sustain a rate of {mb_per_sec:.2} MB/s.\n  \
                         Dropped samples will not be written to the file.\n  \
                         This message will not appear again."
                    );
                }
                continue;
            }
            code => error!("Receiver error: {}", code),
        }

        trace!(
            samples = num_rx_samps,
            full_secs = md.time_spec.full_secs,
            frac_secs = md.time_spec.frac_secs,
            "Received packet"
        );

        let accepted = if target > 0 {
            num_rx_samps.min((target - counters.num_acc_samps).try_into().unwrap_or(usize::MAX))
        } else {
            num_rx_samps
        };
        counters.num_acc_samps += accepted as u64;
        if accepted == 0 || sinks.is_empty() {
            continue;
        }

        for (chan, (mut block, sink)) in blocks.drain(..).zip(sinks.iter()).enumerate() {
            block.truncate(accepted);
            if let Err(e) = sink.try_enqueue(block) {
                let dropped = &mut counters.dropped_blocks[chan];
                *dropped += 1;
                if dropped.is_power_of_two() {
                    let why = if e.is_closed() { "writer is gone" } else { "queue is full" };
                    warn!(channel = chan, dropped = *dropped, "Dropping block, {}", why);
                }
            }
        }
    };
    drop(blocks);

    info!("Stopping...");
    if let Err(e) = device.issue_stream_cmd(StreamCmd::stop()) {
        error!("Failed to stop streaming: {}", e);
    }
    stop.request_stop();
    drop(sinks);

    let report = AcquisitionReport {
        counters,
        end,
        total_num_samps: target,
    };
    info!(
        "Number of samples received: {}",
        report.counters.num_acc_samps
    );
    info!("Number of overflows: {}", report.counters.num_overflow);
    if report.counters.total_dropped() > 0 {
        warn!(
            "Blocks dropped per channel: {:?}",
            report.counters.dropped_blocks
        );
    }
    if report.incomplete() {
        match report.end {
            EndReason::DeviceError => warn!("Receive failed before all samples received"),
            _ => warn!("Received timeout before all samples received"),
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Sample,
        queue::{Dequeue, channel_queue},
        sim::{SimDevice, SimEvent},
    };
    use tracing_test::traced_test;

    fn params(total: u64) -> AcquisitionParams {
        AcquisitionParams {
            total_num_samps: total,
            first_timeout: Duration::from_millis(100),
            timeout: Duration::from_millis(100),
        }
    }

    #[test]
    fn timeouts_follow_block_interval() {
        let dev = SimDevice::new(2, 1000, 1e6);
        let p = AcquisitionParams::new(&dev, 0, Duration::from_millis(1500));
        assert_eq!(p.first_timeout, Duration::from_millis(1600));
        assert_eq!(p.timeout, Duration::from_millis(101));
    }

    #[test]
    #[traced_test]
    fn overflow_warns_once() {
        let mut dev = SimDevice::new(1, 10, 1e6)
            .with_event(2, SimEvent::Overflow)
            .with_event(4, SimEvent::Overflow)
            .with_event(6, SimEvent::Overflow);
        dev.issue_stream_cmd(StreamCmd::start(70, None)).unwrap();
        let report = run(&mut dev, Vec::new(), &params(70), &StopFlag::new());

        assert_eq!(report.counters.num_overflow, 3);
        assert!(report.counters.overflow_warned);
        assert_eq!(report.counters.num_acc_samps, 70);
        assert_eq!(report.counters.iterations, 10);
        assert_eq!(report.end, EndReason::TargetReached);
        logs_assert(|lines: &[&str]| {
            let n = lines
                .iter()
                .filter(|l| l.contains("Got an overflow indication"))
                .count();
            if n == 1 {
                Ok(())
            } else {
                Err(format!("overflow warning shown {n} times"))
            }
        });
    }

    #[test]
    #[traced_test]
    fn timeout_ends_run() {
        let mut dev = SimDevice::new(2, 100, 1e6).with_event(3, SimEvent::Timeout);
        dev.issue_stream_cmd(StreamCmd::start(1000, None)).unwrap();
        let stop = StopFlag::new();
        let report = run(&mut dev, Vec::new(), &params(1000), &stop);

        assert_eq!(report.end, EndReason::Timeout);
        assert_eq!(report.counters.num_acc_samps, 200);
        assert!(report.incomplete());
        assert!(stop.is_stopped());
        assert_eq!(dev.commands().last(), Some(&StreamCmd::stop()));
        assert!(logs_contain("Received timeout before all samples received"));
        assert!(!logs_contain("Receive failed before all samples received"));
    }

    #[test]
    #[traced_test]
    fn device_failure_before_target() {
        let mut dev = SimDevice::new(1, 100, 1e6).with_event(3, SimEvent::Fail);
        dev.issue_stream_cmd(StreamCmd::start(1000, None)).unwrap();
        let report = run(&mut dev, Vec::new(), &params(1000), &StopFlag::new());
        assert_eq!(report.end, EndReason::DeviceError);
        assert_eq!(report.counters.num_acc_samps, 200);
        assert!(report.incomplete());
        assert!(logs_contain("Receive failed before all samples received"));
        assert!(!logs_contain("Received timeout"));
    }

    #[test]
    fn device_failure_ends_run() {
        let mut dev = SimDevice::new(1, 100, 1e6).with_event(2, SimEvent::Fail);
        dev.issue_stream_cmd(StreamCmd::start(0, None)).unwrap();
        let report = run(&mut dev, Vec::new(), &params(0), &StopFlag::new());
        assert_eq!(report.end, EndReason::DeviceError);
        assert_eq!(report.counters.num_acc_samps, 100);
        assert!(!report.incomplete());
    }

    #[test]
    fn anomalies_keep_block() {
        let mut dev = SimDevice::new(1, 50, 1e6)
            .with_event(1, SimEvent::OutOfSequence)
            .with_event(2, SimEvent::Error(RxErrorCode::BadPacket));
        dev.issue_stream_cmd(StreamCmd::start(150, None)).unwrap();
        let (tx, rx) = channel_queue(8);
        let report = run(&mut dev, vec![tx], &params(150), &StopFlag::new());

        assert_eq!(report.counters.num_acc_samps, 150);
        let mut samples = Vec::new();
        while let Dequeue::Block(b) = rx.try_dequeue() {
            samples.extend_from_slice(b.samples());
        }
        assert_eq!(samples.len(), 150);
        assert!(samples.iter().enumerate().all(|(i, s)| *s == SimDevice::sample(0, i as u64)));
    }

    #[test]
    fn target_truncates_last_block() {
        let mut dev = SimDevice::new(2, 64, 1e6);
        dev.issue_stream_cmd(StreamCmd::start(0, None)).unwrap();
        let (tx0, rx0) = channel_queue(8);
        let (tx1, rx1) = channel_queue(8);
        let report = run(&mut dev, vec![tx0, tx1], &params(100), &StopFlag::new());

        assert_eq!(report.end, EndReason::TargetReached);
        assert_eq!(report.counters.num_acc_samps, 100);
        for (chan, rx) in [rx0, rx1].iter().enumerate() {
            let lens: Vec<usize> = std::iter::from_fn(|| match rx.try_dequeue() {
                Dequeue::Block(b) => Some(b.len()),
                _ => None,
            })
            .collect();
            assert_eq!(lens, vec![64, 36], "channel {chan}");
        }
    }

    #[test]
    fn full_queue_counts_drops() {
        let mut dev = SimDevice::new(2, 10, 1e6);
        dev.issue_stream_cmd(StreamCmd::start(100, None)).unwrap();
        let (tx0, rx0) = channel_queue(3);
        let (tx1, rx1) = channel_queue(100);
        let report = run(&mut dev, vec![tx0, tx1], &params(100), &StopFlag::new());

        assert_eq!(report.counters.num_acc_samps, 100);
        assert_eq!(report.counters.dropped_blocks, vec![7, 0]);
        assert_eq!(rx0.len(), 3);
        assert_eq!(rx1.len(), 10);
        // The oldest blocks survive.
        match rx0.try_dequeue() {
            Dequeue::Block(b) => assert_eq!(b.samples()[0], Sample::new(0, 0)),
            other => panic!("expected a block, got {other:?}"),
        }
    }

    #[test]
    fn preset_stop_makes_no_calls() {
        let mut dev = SimDevice::new(1, 10, 1e6);
        dev.issue_stream_cmd(StreamCmd::start(0, None)).unwrap();
        let stop = StopFlag::new();
        stop.request_stop();
        let report = run(&mut dev, Vec::new(), &params(0), &stop);
        assert_eq!(report.end, EndReason::StopRequested);
        assert_eq!(report.counters.iterations, 0);
        assert_eq!(dev.commands().last(), Some(&StreamCmd::stop()));
    }
}
