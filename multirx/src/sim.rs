//! A simulated multi-channel receiver.
//!
//! [`SimDevice`] streams a deterministic pattern so recordings can be checked
//! sample by sample: sample `n` of channel `c` is
//! `Complex { re: c, im: n as i16 }` (see [`SimDevice::sample`]). `n` counts
//! every sample the device produced, including ones lost to an overflow, so
//! dropped blocks show up as gaps in the pattern.
//!
//! Anomalies can be scripted per receive call with
//! [`with_event`][SimDevice::with_event]. Overflows don't use up a
//! `NumSampsAndDone` budget, so a bounded run with overflows still delivers
//! its full sample count.
//!
//! With [`paced`][SimDevice::paced] set, each call sleeps for as long as its
//! samples would take at the configured sample rate, and a scheduled start
//! time is honoured.

use std::{
    collections::HashMap,
    thread,
    time::{Duration, Instant},
};

use crate::{
    Block, Error, RxDevice, RxErrorCode, RxMetadata, Sample, StreamCmd, StreamMode, TimeSpec,
};

/// A scripted anomaly for a single receive call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimEvent {
    /// Report an overflow and deliver nothing. A block's worth of samples is
    /// lost.
    Overflow,
    /// Report a timeout and deliver nothing.
    Timeout,
    /// Deliver a normal block flagged as out-of-sequence.
    OutOfSequence,
    /// Deliver a normal block alongside this error code.
    Error(RxErrorCode),
    /// Fail the receive call outright.
    Fail,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StreamState {
    Idle,
    Continuous,
    Bounded { remaining: u64 },
}

/// A simulated receiver. See the [module docs][self].
#[derive(Debug)]
pub struct SimDevice {
    channels: usize,
    block_size: usize,
    sample_rate: f64,
    paced: bool,
    epoch: Instant,
    state: StreamState,
    start_at: Option<Duration>,
    next_index: u64,
    calls: u64,
    events: HashMap<u64, SimEvent>,
    commands: Vec<StreamCmd>,
}

impl SimDevice {
    /// Create a device streaming `channels` channels, `block_size` samples
    /// per receive call, at `sample_rate` samples per second.
    pub fn new(channels: usize, block_size: usize, sample_rate: f64) -> Self {
        Self {
            channels,
            block_size: block_size.max(1),
            sample_rate,
            paced: false,
            epoch: Instant::now(),
            state: StreamState::Idle,
            start_at: None,
            next_index: 0,
            calls: 0,
            events: HashMap::new(),
            commands: Vec::new(),
        }
    }

    /// Sleep in each receive call as a real device would.
    pub fn paced(mut self, paced: bool) -> Self {
        self.paced = paced;
        self
    }

    /// Script an anomaly for the `call`-th receive call, counting from 1.
    pub fn with_event(mut self, call: u64, event: SimEvent) -> Self {
        self.events.insert(call, event);
        self
    }

    /// The sample the device produces for `channel` at stream index `index`.
    pub fn sample(channel: usize, index: u64) -> Sample {
        Sample::new(channel as i16, index as i16)
    }

    /// Every stream command issued so far, oldest first.
    pub fn commands(&self) -> &[StreamCmd] {
        &self.commands
    }

    /// Number of receive calls made so far.
    pub fn calls(&self) -> u64 {
        self.calls
    }

    fn nap(&self, dur: Duration) {
        if self.paced && !dur.is_zero() {
            thread::sleep(dur);
        }
    }

    fn timed_out(&self, timeout: Duration) -> (usize, RxMetadata) {
        self.nap(timeout);
        (0, RxMetadata::error(RxErrorCode::Timeout))
    }

    fn device_time(&self, index: u64) -> TimeSpec {
        let start = self.start_at.unwrap_or(Duration::ZERO).as_secs_f64();
        let offset = if self.sample_rate > 0.0 {
            index as f64 / self.sample_rate
        } else {
            0.0
        };
        TimeSpec::from_secs_f64(start + offset)
    }
}

impl RxDevice for SimDevice {
    fn channel_count(&self) -> usize {
        self.channels
    }

    fn max_block_size(&self) -> usize {
        self.block_size
    }

    fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    fn time_now(&self) -> Result<TimeSpec, Error> {
        Ok(TimeSpec::from_secs_f64(self.epoch.elapsed().as_secs_f64()))
    }

    fn issue_stream_cmd(&mut self, cmd: StreamCmd) -> Result<(), Error> {
        self.commands.push(cmd);
        match cmd.mode {
            StreamMode::StartContinuous => self.state = StreamState::Continuous,
            StreamMode::NumSampsAndDone(remaining) => {
                self.state = StreamState::Bounded { remaining }
            }
            StreamMode::StopContinuous => {
                self.state = StreamState::Idle;
                return Ok(());
            }
        }
        self.start_at = cmd.time_spec.map(|t| t.as_duration());
        Ok(())
    }

    fn recv(
        &mut self,
        buffs: &mut [Block],
        max_samps: usize,
        timeout: Duration,
    ) -> Result<(usize, RxMetadata), Error> {
        if buffs.len() != self.channels {
            return Err(Error::InvalidParameter(
                "need exactly one buffer per channel",
            ));
        }
        self.calls += 1;

        let mut md = RxMetadata::default();
        match self.events.remove(&self.calls) {
            Some(SimEvent::Fail) => {
                return Err(Error::Device(String::from("simulated receive failure")));
            }
            Some(SimEvent::Timeout) => return Ok(self.timed_out(timeout)),
            Some(SimEvent::Overflow) => {
                self.next_index += self.block_size as u64;
                let mut md = RxMetadata::error(RxErrorCode::Overflow);
                md.time_spec = self.device_time(self.next_index);
                return Ok((0, md));
            }
            Some(SimEvent::OutOfSequence) => md.out_of_sequence = true,
            Some(SimEvent::Error(code)) => md.error_code = code,
            None => (),
        }

        let budget = match self.state {
            StreamState::Idle => return Ok(self.timed_out(timeout)),
            StreamState::Continuous => u64::MAX,
            StreamState::Bounded { remaining } => remaining,
        };
        if budget == 0 {
            self.state = StreamState::Idle;
            return Ok(self.timed_out(timeout));
        }

        if self.paced {
            if let Some(start) = self.start_at {
                let now = self.epoch.elapsed();
                if start > now {
                    if start - now > timeout {
                        return Ok(self.timed_out(timeout));
                    }
                    thread::sleep(start - now);
                }
            }
        }

        let n = self
            .block_size
            .min(max_samps)
            .min(budget.try_into().unwrap_or(usize::MAX));
        for (chan, block) in buffs.iter_mut().enumerate() {
            let region = block.recv_region(n);
            for (k, s) in region.iter_mut().enumerate() {
                *s = Self::sample(chan, self.next_index + k as u64);
            }
        }
        md.time_spec = self.device_time(self.next_index);
        self.next_index += n as u64;
        if let StreamState::Bounded { remaining } = &mut self.state {
            *remaining -= n as u64;
        }

        if self.paced && self.sample_rate > 0.0 {
            if let Ok(dur) = Duration::try_from_secs_f64(n as f64 / self.sample_rate) {
                self.nap(dur);
            }
        }
        Ok((n, md))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffers(n: usize) -> Vec<Block> {
        (0..n).map(|_| Block::with_capacity(16)).collect()
    }

    #[test]
    fn idle_times_out() {
        let mut dev = SimDevice::new(2, 8, 1e3);
        let mut buffs = buffers(2);
        let (n, md) = dev.recv(&mut buffs, 8, Duration::from_millis(5)).unwrap();
        assert_eq!(n, 0);
        assert_eq!(md.error_code, RxErrorCode::Timeout);
    }

    #[test]
    fn bounded_stream_then_timeout() {
        let mut dev = SimDevice::new(2, 8, 1e3);
        dev.issue_stream_cmd(StreamCmd::start(12, None)).unwrap();
        let mut buffs = buffers(2);
        let t = Duration::from_millis(5);

        let (n, md) = dev.recv(&mut buffs, 8, t).unwrap();
        assert_eq!((n, md.error_code), (8, RxErrorCode::None));
        assert_eq!(buffs[1].samples()[3], SimDevice::sample(1, 3));

        let (n, _) = dev.recv(&mut buffs, 8, t).unwrap();
        assert_eq!(n, 4);
        assert_eq!(buffs[0].samples()[0], SimDevice::sample(0, 8));
        assert_eq!(buffs[0].len(), 4);

        let (n, md) = dev.recv(&mut buffs, 8, t).unwrap();
        assert_eq!((n, md.error_code), (0, RxErrorCode::Timeout));
    }

    #[test]
    fn overflow_skips_samples() {
        let mut dev = SimDevice::new(1, 4, 1e3).with_event(2, SimEvent::Overflow);
        dev.issue_stream_cmd(StreamCmd::start(0, None)).unwrap();
        let mut buffs = buffers(1);
        let t = Duration::from_millis(5);
        dev.recv(&mut buffs, 4, t).unwrap();
        let (n, md) = dev.recv(&mut buffs, 4, t).unwrap();
        assert_eq!((n, md.error_code), (0, RxErrorCode::Overflow));
        dev.recv(&mut buffs, 4, t).unwrap();
        assert_eq!(buffs[0].samples()[0], SimDevice::sample(0, 8));
    }

    #[test]
    fn wrong_buffer_count() {
        let mut dev = SimDevice::new(3, 4, 1e3);
        let mut buffs = buffers(2);
        assert!(dev.recv(&mut buffs, 4, Duration::ZERO).is_err());
    }

    #[test]
    fn extreme_rate_still_delivers() {
        let mut dev = SimDevice::new(1, 2000, 1e-294);
        dev.issue_stream_cmd(StreamCmd::start(0, None)).unwrap();
        let mut buffs = buffers(1);
        let (n, md) = dev.recv(&mut buffs, 2000, Duration::ZERO).unwrap();
        assert_eq!((n, md.error_code), (2000, RxErrorCode::None));
    }

    #[test]
    fn timestamps_advance() {
        let mut dev = SimDevice::new(1, 500, 1e3);
        dev.issue_stream_cmd(StreamCmd::start(0, Some(TimeSpec::from_secs_f64(2.0))))
            .unwrap();
        let mut buffs = buffers(1);
        let (_, md) = dev.recv(&mut buffs, 500, Duration::ZERO).unwrap();
        assert_eq!(md.time_spec.full_secs, 2);
        let (_, md) = dev.recv(&mut buffs, 500, Duration::ZERO).unwrap();
        assert_eq!(md.time_spec.full_secs, 2);
        assert!((md.time_spec.frac_secs - 0.5).abs() < 1e-9);
    }
}
