use std::{path::PathBuf, time::Duration};

use color_eyre::eyre::{Context, eyre};
use multirx::{ChannelContext, RecordConfig};
use serde::Deserialize;

/// Accepted `samplerate` range, in Msps.
const SAMPLE_RATE_MSPS: std::ops::RangeInclusive<f64> = 0.001..=1000.0;

/// Which receiver backend to open.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// A multi-USRP through UHD. Needs the `uhd` feature.
    #[default]
    Uhd,
    /// The built-in simulated receiver.
    Sim,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[cfg_attr(not(feature = "uhd"), allow(dead_code))]
pub struct Global {
    /// Directory prefix for every channel's filename.
    pub filepath: PathBuf,
    /// Sample rate, in Msps.
    pub samplerate: f64,
    /// Receive gain, in dB.
    pub gain: f64,
    /// Samples per channel to record. 0 runs until interrupted.
    pub total_num_samps: u64,
    /// Write samples to disk at all.
    pub write_data: bool,
    pub device: DeviceKind,
    pub clock_source: String,
    pub subdev: String,
    /// Seconds between setup and the first sample.
    pub start_delay: f64,
    /// Queue depth per channel, in blocks.
    pub queue_depth: Option<usize>,
    /// Samples per receive call. Only used by the simulated device.
    pub block_size: usize,
}

impl Default for Global {
    fn default() -> Self {
        Self {
            filepath: PathBuf::new(),
            samplerate: 10.0,
            gain: 0.0,
            total_num_samps: 0,
            write_data: true,
            device: DeviceKind::default(),
            clock_source: String::from("external"),
            subdev: String::from("A:0"),
            start_delay: 1.5,
            queue_depth: None,
            block_size: 2000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
#[cfg_attr(not(feature = "uhd"), allow(dead_code))]
pub struct ChannelParams {
    #[serde(default)]
    pub deviceaddr: String,
    pub filename: PathBuf,
    /// Center frequency, in MHz.
    #[serde(default)]
    pub centerfrq: f64,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub global: Global,
    #[serde(rename = "usrp", default)]
    pub channels: Vec<ChannelParams>,
}

impl Config {
    pub fn load(path: &std::path::Path) -> color_eyre::Result<Self> {
        let text = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Couldn't read config file {}", path.display()))?;
        let config = Self::parse(&text)
            .wrap_err_with(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    pub fn parse(text: &str) -> color_eyre::Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> color_eyre::Result<()> {
        if self.channels.is_empty() {
            return Err(eyre!("At least one [[usrp]] entry is required"));
        }
        if !SAMPLE_RATE_MSPS.contains(&self.global.samplerate) {
            return Err(eyre!(
                "samplerate must be between {} and {} Msps, got {}",
                SAMPLE_RATE_MSPS.start(),
                SAMPLE_RATE_MSPS.end(),
                self.global.samplerate
            ));
        }
        self.start_delay()?;
        if self.global.block_size == 0 {
            return Err(eyre!("block_size must be at least 1"));
        }
        if self.global.queue_depth == Some(0) {
            return Err(eyre!("queue_depth must be at least 1"));
        }
        Ok(())
    }

    fn start_delay(&self) -> color_eyre::Result<Duration> {
        Duration::try_from_secs_f64(self.global.start_delay).map_err(|_| {
            eyre!(
                "start_delay must be a non-negative number of seconds, got {}",
                self.global.start_delay
            )
        })
    }

    pub fn sample_rate_hz(&self) -> f64 {
        self.global.samplerate * 1e6
    }

    /// Build the recorder's view of this config. Channel `n` is the `n`th
    /// `[[usrp]]` entry.
    pub fn record_config(&self) -> color_eyre::Result<RecordConfig> {
        let channels = self
            .channels
            .iter()
            .enumerate()
            .map(|(i, ch)| ChannelContext::new(i, self.global.filepath.join(&ch.filename)))
            .collect();
        let config = RecordConfig::new(channels)
            .with_persist(self.global.write_data)
            .with_total_num_samps(self.global.total_num_samps)
            .with_start_delay(self.start_delay()?);
        Ok(match self.global.queue_depth {
            Some(depth) => config.with_queue_depth(depth),
            None => config,
        })
    }

    #[cfg(feature = "uhd")]
    pub fn uhd_params(&self) -> multirx::uhd::UhdParams {
        multirx::uhd::UhdParams {
            channels: self
                .channels
                .iter()
                .map(|ch| multirx::uhd::UhdChannel {
                    device_addr: ch.deviceaddr.clone(),
                    center_freq_hz: ch.centerfrq * 1e6,
                })
                .collect(),
            subdev: self.global.subdev.clone(),
            clock_source: self.global.clock_source.clone(),
            sample_rate_hz: self.sample_rate_hz(),
            gain_db: self.global.gain,
        }
    }
}
