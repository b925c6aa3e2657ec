use std::{
    path::Path,
    time::{Duration, Instant},
};

use anyhow::Result;
use multirx::{
    AcquisitionParams, ChannelContext, EndReason, Error, RecordConfig, SAMPLE_SIZE, Sample, StopFlag, StreamCmd,
    StreamMode,
    sim::{SimDevice, SimEvent},
};

fn read_samples(path: &Path) -> Result<Vec<Sample>> {
    let bytes = std::fs::read(path)?;
    assert_eq!(bytes.len() % SAMPLE_SIZE, 0);
    Ok(bytes
        .chunks_exact(SAMPLE_SIZE)
        .map(|c| {
            Sample::new(
                i16::from_ne_bytes([c[0], c[1]]),
                i16::from_ne_bytes([c[2], c[3]]),
            )
        })
        .collect())
}

fn expected(channel: usize, indices: impl IntoIterator<Item = u64>) -> Vec<Sample> {
    indices
        .into_iter()
        .map(|i| SimDevice::sample(channel, i))
        .collect()
}

fn config(dir: &Path, channels: usize) -> RecordConfig {
    RecordConfig::new(
        (0..channels)
            .map(|i| ChannelContext::new(i, dir.join(format!("ch{i}.dat"))))
            .collect(),
    )
    .with_start_delay(Duration::ZERO)
    .with_queue_depth(64)
    .with_writer_idle(Duration::from_millis(5))
}

#[test]
fn bounded_run_fills_every_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut device = SimDevice::new(3, 300, 1e6);
    let cfg = config(dir.path(), 3).with_total_num_samps(1000);
    let stop = StopFlag::new();

    let report = multirx::record(&mut device, &cfg, &stop)?;

    let acq = &report.acquisition;
    assert_eq!(acq.end, EndReason::TargetReached);
    assert_eq!(acq.counters.num_acc_samps, 1000);
    assert_eq!(acq.counters.num_overflow, 0);
    assert_eq!(acq.counters.total_dropped(), 0);
    assert!(!acq.incomplete());
    assert!(stop.is_stopped());

    for (chan, writer) in report.writers.iter().enumerate() {
        let writer = writer.as_ref().expect("writer failed");
        assert_eq!(writer.samples, 1000);
        assert_eq!(writer.bytes, 1000 * SAMPLE_SIZE as u64);
        let samples = read_samples(&cfg.channels[chan].path)?;
        assert_eq!(samples, expected(chan, 0..1000));
    }

    let cmds = device.commands();
    assert_eq!(cmds.len(), 2);
    assert_eq!(cmds[0].mode, StreamMode::NumSampsAndDone(1000));
    assert!(cmds[0].time_spec.is_some());
    assert_eq!(cmds[1], StreamCmd::stop());
    Ok(())
}

#[test]
fn stop_mid_run_drains_writers() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut device = SimDevice::new(3, 1000, 1e6).paced(true);
    let cfg = config(dir.path(), 3).with_queue_depth(1024);
    let params = AcquisitionParams::new(&device, 0, cfg.start_delay);
    let stop = StopFlag::new();

    let interrupter = {
        let stop = stop.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            stop.request_stop();
            Instant::now()
        })
    };
    let report = multirx::record(&mut device, &cfg, &stop)?;
    let returned = Instant::now();
    let stopped_at = interrupter.join().expect("interrupter panicked");

    // One receive call, then the writers' last idle and flush.
    let allowed = params.timeout + cfg.writer_idle + Duration::from_millis(100);
    let took = returned.saturating_duration_since(stopped_at);
    assert!(took < allowed, "record returned {took:?} after the stop");

    let acq = &report.acquisition;
    assert_eq!(acq.end, EndReason::StopRequested);
    assert!(acq.counters.num_acc_samps > 0);
    assert!(!acq.incomplete());
    assert_eq!(device.commands().last(), Some(&StreamCmd::stop()));
    assert_eq!(device.commands()[0].mode, StreamMode::StartContinuous);

    for chan in 0..3 {
        let samples = read_samples(&cfg.channels[chan].path)?;
        assert_eq!(samples.len() as u64, acq.counters.num_acc_samps);
        assert_eq!(samples, expected(chan, 0..acq.counters.num_acc_samps));
    }
    Ok(())
}

#[test]
fn overflowed_block_is_missing_from_every_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut device = SimDevice::new(3, 100, 1e6).with_event(5, SimEvent::Overflow);
    let cfg = config(dir.path(), 3).with_total_num_samps(900);
    let stop = StopFlag::new();

    let report = multirx::record(&mut device, &cfg, &stop)?;

    let acq = &report.acquisition;
    assert_eq!(acq.counters.num_overflow, 1);
    assert_eq!(acq.counters.iterations, 10);
    assert_eq!(device.calls(), 10);
    assert_eq!(acq.counters.num_acc_samps, 900);
    for chan in 0..3 {
        let samples = read_samples(&cfg.channels[chan].path)?;
        assert_eq!(samples, expected(chan, (0..400).chain(500..1000)));
    }
    Ok(())
}

#[test]
fn unopenable_file_only_fails_its_channel() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut device = SimDevice::new(3, 250, 1e6);
    let mut cfg = config(dir.path(), 3).with_total_num_samps(1000);
    let bad_path = dir.path().join("missing").join("ch1.dat");
    cfg.channels[1].path = bad_path.clone();
    let stop = StopFlag::new();

    let report = multirx::record(&mut device, &cfg, &stop)?;

    assert_eq!(report.acquisition.end, EndReason::TargetReached);
    assert_eq!(report.acquisition.counters.num_acc_samps, 1000);
    assert!(!report.writers_ok());
    match &report.writers[1] {
        Err(Error::FileOpen { path, .. }) => assert_eq!(path, &bad_path),
        other => panic!("expected an open failure, got {other:?}"),
    }
    for chan in [0, 2] {
        let writer = report.writers[chan].as_ref().expect("writer failed");
        assert_eq!(writer.samples, 1000);
        assert_eq!(
            read_samples(&cfg.channels[chan].path)?,
            expected(chan, 0..1000)
        );
    }
    assert_eq!(report.acquisition.counters.dropped_blocks[0], 0);
    assert_eq!(report.acquisition.counters.dropped_blocks[2], 0);
    Ok(())
}

#[test]
fn timeout_ends_run_early() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut device = SimDevice::new(2, 100, 1e6).with_event(3, SimEvent::Timeout);
    let cfg = config(dir.path(), 2).with_total_num_samps(1000);
    let stop = StopFlag::new();

    let report = multirx::record(&mut device, &cfg, &stop)?;

    assert_eq!(report.acquisition.end, EndReason::Timeout);
    assert!(report.acquisition.incomplete());
    assert!(stop.is_stopped());
    assert_eq!(device.commands().last(), Some(&StreamCmd::stop()));
    for chan in 0..2 {
        assert_eq!(
            read_samples(&cfg.channels[chan].path)?,
            expected(chan, 0..200)
        );
    }
    Ok(())
}

#[test]
fn persistence_disabled_writes_nothing() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut device = SimDevice::new(3, 100, 1e6);
    let cfg = config(dir.path(), 3)
        .with_total_num_samps(500)
        .with_persist(false);

    let report = multirx::record(&mut device, &cfg, &StopFlag::new())?;

    assert_eq!(report.acquisition.counters.num_acc_samps, 500);
    for (ctx, writer) in cfg.channels.iter().zip(report.writers.iter()) {
        let writer = writer.as_ref().expect("writer failed");
        assert!(!writer.persisted);
        assert!(!ctx.path.exists());
    }
    Ok(())
}

#[test]
fn bad_channel_selection_aborts_before_streaming() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut device = SimDevice::new(3, 100, 1e6);

    let cfg = config(dir.path(), 2);
    let err = multirx::record(&mut device, &cfg, &StopFlag::new()).unwrap_err();
    assert!(matches!(
        err,
        Error::ChannelCount {
            configured: 2,
            device: 3
        }
    ));

    let mut cfg = config(dir.path(), 3);
    cfg.channels[2].index = 5;
    let err = multirx::record(&mut device, &cfg, &StopFlag::new()).unwrap_err();
    assert!(matches!(err, Error::InvalidChannel { channel: 5, .. }));

    assert!(device.commands().is_empty());
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
    Ok(())
}
