use std::time::Duration;

use anyhow::Result;
use multirx::{ChannelContext, RecordConfig, StopFlag, sim::SimDevice};

fn main() -> Result<()> {
    // Directory to record into, defaulting to the current one.
    let mut args = std::env::args();
    args.next();
    let dir = std::path::PathBuf::from(args.next().unwrap_or_else(|| String::from(".")));

    // Three simulated channels at 2 Msps, 2000 samples per block.
    let mut device = SimDevice::new(3, 2000, 2e6).paced(true);

    // Record two seconds worth of samples, starting a quarter second out.
    let config = RecordConfig::new(
        (0..3)
            .map(|i| ChannelContext::new(i, dir.join(format!("sim{i}.dat"))))
            .collect(),
    )
    .with_total_num_samps(4_000_000)
    .with_start_delay(Duration::from_millis(250));

    let report = multirx::record(&mut device, &config, &StopFlag::new())?;
    println!(
        "Received {} samples per channel, {} overflows",
        report.acquisition.counters.num_acc_samps, report.acquisition.counters.num_overflow
    );
    for writer in report.writers {
        let writer = writer?;
        println!("{}: {} bytes", writer.path.display(), writer.bytes);
    }
    Ok(())
}
