mod config;
mod os_signal;

use std::path::PathBuf;

use clap::Parser;
use color_eyre::{
    Section,
    eyre::{Context, eyre},
};
use multirx::{EndReason, RecordReport, RxDevice, StopFlag, sim::SimDevice};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, DeviceKind};

/// Record every channel of a multi-receiver setup to its own raw I/Q file.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// TOML configuration file
    config: PathBuf,
}

fn open_device(config: &Config) -> color_eyre::Result<Box<dyn RxDevice>> {
    match config.global.device {
        DeviceKind::Sim => {
            info!(
                "Using simulated receiver with {} channels",
                config.channels.len()
            );
            Ok(Box::new(
                SimDevice::new(
                    config.channels.len(),
                    config.global.block_size,
                    config.sample_rate_hz(),
                )
                .paced(true),
            ))
        }
        #[cfg(feature = "uhd")]
        DeviceKind::Uhd => {
            let dev = multirx::uhd::UhdDevice::open(&config.uhd_params())
                .wrap_err("Failed to set up the USRPs")?;
            Ok(Box::new(dev))
        }
        #[cfg(not(feature = "uhd"))]
        DeviceKind::Uhd => Err(eyre!(
            "This build has no UHD support; rebuild with `--features uhd` or use device = \"sim\""
        )),
    }
}

/// Turn the run's outcome into the process result. Writer failures are
/// collected into one report.
fn check_report(report: RecordReport) -> color_eyre::Result<()> {
    let acq = &report.acquisition;
    info!(
        "Done: {} samples per channel, {} overflows, {} dropped blocks",
        acq.counters.num_acc_samps,
        acq.counters.num_overflow,
        acq.counters.total_dropped()
    );
    for (chan, dropped) in acq.counters.dropped_blocks.iter().enumerate() {
        if *dropped > 0 {
            warn!("Channel {} dropped {} blocks", chan, dropped);
        }
    }

    let mut errors: Vec<multirx::Error> = report
        .writers
        .into_iter()
        .filter_map(Result::err)
        .collect();
    if acq.end == EndReason::DeviceError && errors.is_empty() {
        return Err(eyre!("Receiving from the device failed"));
    }
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)).wrap_err("A file writer failed"),
        _ => Err(errors.into_iter().fold(
            eyre!("encountered multiple errors"),
            |report, e| report.section(e),
        )),
    }
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Cli::parse();

    let config = Config::load(&args.config)?;
    let record = config.record_config()?;
    let kind = config.global.device;
    let mut device = open_device(&config)?;

    let stop = StopFlag::new();
    if record.total_num_samps == 0 {
        let quit = os_signal::quit_watch().await;
        let stop = stop.clone();
        tokio::spawn(async move {
            quit.quit().await;
            stop.request_stop();
        });
        info!("Press Ctrl + C to stop streaming...");
    }

    let pipeline_stop = stop.clone();
    let report = tokio::task::spawn_blocking(move || {
        #[cfg(feature = "uhd")]
        if kind == DeviceKind::Uhd {
            multirx::uhd::set_thread_priority_safe();
        }
        #[cfg(not(feature = "uhd"))]
        let _ = kind;
        multirx::record(device.as_mut(), &record, &pipeline_stop)
    })
    .await
    .wrap_err("Recorder thread panicked")?
    .wrap_err("Recording failed")?;

    check_report(report)
}
