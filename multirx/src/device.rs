use std::time::Duration;

use crate::{Block, Error};

/// A device time, split into whole and fractional seconds.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TimeSpec {
    /// Whole seconds.
    pub full_secs: i64,
    /// Fractional seconds, in `[0, 1)`.
    pub frac_secs: f64,
}

impl TimeSpec {
    /// Build a time from a count of seconds.
    pub fn from_secs_f64(secs: f64) -> Self {
        let full_secs = secs.floor();
        Self {
            full_secs: full_secs as i64,
            frac_secs: secs - full_secs,
        }
    }

    /// Get the time as a count of seconds.
    pub fn as_secs_f64(&self) -> f64 {
        self.full_secs as f64 + self.frac_secs
    }

    /// Get the time as a duration. Negative times saturate to zero.
    pub fn as_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.as_secs_f64()).unwrap_or(Duration::ZERO)
    }
}

impl core::ops::Add<Duration> for TimeSpec {
    type Output = TimeSpec;

    fn add(self, rhs: Duration) -> Self::Output {
        TimeSpec::from_secs_f64(self.as_secs_f64() + rhs.as_secs_f64())
    }
}

/// Error classification reported alongside every receive call.
///
/// Values follow the UHD `rx_metadata_t` error codes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum RxErrorCode {
    /// No error.
    #[default]
    None = 0x0,
    /// No packet arrived before the timeout expired.
    Timeout = 0x1,
    /// A stream command was issued for a time in the past.
    LateCommand = 0x2,
    /// Expected another stream command.
    BrokenChain = 0x4,
    /// The device produced samples faster than they were retrieved, and
    /// dropped some.
    Overflow = 0x8,
    /// Multi-channel alignment failed.
    Alignment = 0xC,
    /// The packet couldn't be parsed.
    BadPacket = 0xF,
}

impl RxErrorCode {
    /// Map a raw UHD error code. Unknown codes become `BadPacket`.
    pub fn from_raw(code: i32) -> Self {
        match code {
            0x0 => Self::None,
            0x1 => Self::Timeout,
            0x2 => Self::LateCommand,
            0x4 => Self::BrokenChain,
            0x8 => Self::Overflow,
            0xC => Self::Alignment,
            _ => Self::BadPacket,
        }
    }

    /// Human-readable description of the condition.
    pub fn description(&self) -> &'static str {
        match self {
            Self::None => "no error",
            Self::Timeout => "no packet received, implementation timed out",
            Self::LateCommand => "a stream command was issued in the past",
            Self::BrokenChain => "expected another stream command",
            Self::Overflow => "an internal receive buffer has filled or a sequence error has been detected",
            Self::Alignment => "multi-channel alignment failed",
            Self::BadPacket => "the packet could not be parsed",
        }
    }
}

impl std::fmt::Display for RxErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

/// Status of a single receive call.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RxMetadata {
    /// Error classification.
    pub error_code: RxErrorCode,
    /// Set when the device detected a gap or reordering in the stream. The
    /// delivered samples are still usable.
    pub out_of_sequence: bool,
    /// Device time of the first sample in the packet.
    pub time_spec: TimeSpec,
}

impl RxMetadata {
    /// Metadata for a call that produced nothing but an error.
    pub fn error(error_code: RxErrorCode) -> Self {
        Self {
            error_code,
            ..Self::default()
        }
    }
}

/// Streaming mode for a [`StreamCmd`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamMode {
    /// Stream until told to stop.
    StartContinuous,
    /// Stream exactly this many samples per channel, then stop.
    NumSampsAndDone(u64),
    /// Stop streaming.
    StopContinuous,
}

/// A stream command for an [`RxDevice`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StreamCmd {
    /// What to do.
    pub mode: StreamMode,
    /// When to do it, in device time. `None` means right away.
    pub time_spec: Option<TimeSpec>,
}

impl StreamCmd {
    /// Start streaming: continuously if `total_num_samps` is 0, otherwise
    /// for exactly `total_num_samps` samples.
    pub fn start(total_num_samps: u64, at: Option<TimeSpec>) -> Self {
        let mode = if total_num_samps == 0 {
            StreamMode::StartContinuous
        } else {
            StreamMode::NumSampsAndDone(total_num_samps)
        };
        Self {
            mode,
            time_spec: at,
        }
    }

    /// Stop streaming right away.
    pub fn stop() -> Self {
        Self {
            mode: StreamMode::StopContinuous,
            time_spec: None,
        }
    }
}

/// A configured multi-channel receiver.
///
/// By the time a device is handed to [`record`][crate::record] it should be
/// fully set up: sample rate, tuning, gain and clock source are all the
/// device's business. The recorder only starts and stops streaming and pulls
/// blocks.
pub trait RxDevice: Send {
    /// Number of channels streamed by every [`recv`][RxDevice::recv] call.
    fn channel_count(&self) -> usize;

    /// Largest number of samples a single receive call delivers per channel.
    fn max_block_size(&self) -> usize;

    /// Sample rate of every channel, in samples per second.
    fn sample_rate(&self) -> f64;

    /// Current device time.
    fn time_now(&self) -> Result<TimeSpec, Error>;

    /// Issue a stream command.
    fn issue_stream_cmd(&mut self, cmd: StreamCmd) -> Result<(), Error>;

    /// Receive one block per channel, waiting up to `timeout`.
    ///
    /// `buffs` holds one block per channel. Each is filled with the same
    /// number of samples (at most `max_samps`), and that count is returned
    /// alongside the reception metadata. A timeout is reported through the
    /// metadata, not as an `Err`; `Err` means the call itself failed.
    fn recv(
        &mut self,
        buffs: &mut [Block],
        max_samps: usize,
        timeout: Duration,
    ) -> Result<(usize, RxMetadata), Error>;
}

impl<D: RxDevice + ?Sized> RxDevice for Box<D> {
    fn channel_count(&self) -> usize {
        (**self).channel_count()
    }

    fn max_block_size(&self) -> usize {
        (**self).max_block_size()
    }

    fn sample_rate(&self) -> f64 {
        (**self).sample_rate()
    }

    fn time_now(&self) -> Result<TimeSpec, Error> {
        (**self).time_now()
    }

    fn issue_stream_cmd(&mut self, cmd: StreamCmd) -> Result<(), Error> {
        (**self).issue_stream_cmd(cmd)
    }

    fn recv(
        &mut self,
        buffs: &mut [Block],
        max_samps: usize,
        timeout: Duration,
    ) -> Result<(usize, RxMetadata), Error> {
        (**self).recv(buffs, max_samps, timeout)
    }
}
