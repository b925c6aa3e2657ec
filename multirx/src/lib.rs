/*!

Multi-channel SDR recording: read fixed-size sample blocks from every receive
channel of a device, hand each channel's blocks to its own writer thread
through a lock-free queue, and persist them as raw IQ files.

The pieces, from the bottom up:

- [`Block`] - one channel's batch of [`Sample`]s from a single receive call.
  Blocks come from a [`BlockPool`] and return to it when dropped, so the
  receive path doesn't allocate once the pipeline is warm.
- [`queue`] - the bounded single-producer/single-consumer hand-off between
  the acquisition thread and one writer.
- [`writer`] - a thread per channel that drains its queue into a file.
- [`acquisition`] - the real-time loop that calls [`RxDevice::recv`],
  classifies the result, and fans blocks out to the queues.
- [`StopFlag`] - the one-way shutdown signal every thread polls.
- [`record`] - wires all of the above together for a single run.

Devices implement [`RxDevice`]. A simulated device lives in [`sim`], and a UHD
multi-USRP backend is available with the `uhd` feature.

Recording three channels from the simulated device looks like this:

```no_run
use multirx::{ChannelContext, RecordConfig, StopFlag, sim::SimDevice};

fn main() -> Result<(), multirx::Error> {
    // Three channels, 2000-sample blocks, paced at 10 Msps.
    let mut device = SimDevice::new(3, 2000, 10e6).paced(true);

    let config = RecordConfig::new(vec![
        ChannelContext::new(0, "ch0.dat"),
        ChannelContext::new(1, "ch1.dat"),
        ChannelContext::new(2, "ch2.dat"),
    ])
    .with_total_num_samps(1_000_000);

    let stop = StopFlag::new();
    let report = multirx::record(&mut device, &config, &stop)?;
    println!(
        "received {} samples, {} overflows",
        report.acquisition.counters.num_acc_samps, report.acquisition.counters.num_overflow
    );
    Ok(())
}
```

*/

#![warn(missing_docs)]

pub mod acquisition;
mod device;
mod error;
pub mod queue;
mod recorder;
mod shutdown;
pub mod sim;
#[cfg(feature = "uhd")]
pub mod uhd;
pub mod writer;

use std::sync::mpsc;

pub use crate::acquisition::{AcquisitionParams, AcquisitionReport, EndReason, RunCounters};
pub use crate::device::{RxDevice, RxErrorCode, RxMetadata, StreamCmd, StreamMode, TimeSpec};
pub use crate::error::Error;
pub use crate::recorder::{ChannelContext, RecordConfig, RecordReport, record};
pub use crate::shutdown::StopFlag;

/// Complex 16-bit signed data, as delivered by the receiver in `sc16` format.
pub type Sample = num_complex::Complex<i16>;

/// Size of one sample record in an output file, in bytes.
pub const SAMPLE_SIZE: usize = core::mem::size_of::<Sample>();

/// A Block of samples for one channel.
///
/// A block is filled by a single [`RxDevice::recv`] call and then moved, by
/// value, through the channel's queue to its writer. There is never more than
/// one owner.
///
/// When dropped, a pooled block returns its allocation to the [`BlockPool`] it
/// came from. If that pool is gone, the allocation is simply freed.
pub struct Block {
    samples: Vec<Sample>,
    pool: Option<mpsc::Sender<Vec<Sample>>>,
}

impl Block {
    /// Allocate a free-standing block able to hold `capacity` samples.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
            pool: None,
        }
    }

    fn pooled(samples: Vec<Sample>, pool: mpsc::Sender<Vec<Sample>>) -> Self {
        Self {
            samples,
            pool: Some(pool),
        }
    }

    /// Get how many samples this block can hold without reallocating.
    pub fn capacity(&self) -> usize {
        self.samples.capacity()
    }

    /// Size of the block, in samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns true if there are no samples in the block.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Shorten the block to `len` samples. Has no effect if the block is
    /// already shorter.
    pub fn truncate(&mut self, len: usize) {
        self.samples.truncate(len);
    }

    /// Resize the block to exactly `len` zeroed samples and get them as a
    /// mutable slice, ready for a device to receive into.
    ///
    /// Follow up with [`truncate`][Block::truncate] once the number of
    /// samples actually received is known.
    pub fn recv_region(&mut self, len: usize) -> &mut [Sample] {
        self.samples.clear();
        self.samples.resize(len, Sample::new(0, 0));
        &mut self.samples
    }

    /// Get the samples in the block.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Get the sample sequence as bytes, exactly as it is written to disk:
    /// interleaved I/Q pairs of native-endian `i16`.
    pub fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.samples)
    }
}

impl From<Vec<Sample>> for Block {
    fn from(samples: Vec<Sample>) -> Self {
        Self {
            samples,
            pool: None,
        }
    }
}

impl core::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("len", &self.samples.len())
            .field("capacity", &self.samples.capacity())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        let Some(pool) = self.pool.take() else {
            return;
        };
        let inner = core::mem::take(&mut self.samples);
        if inner.capacity() > 0 {
            let _ = pool.send(inner);
        }
    }
}

/// A reusable pool of block allocations.
///
/// [`get`][BlockPool::get] pulls from blocks that were dropped first, and
/// allocates a new one if none are available. The pool grows so long as
/// blocks are held elsewhere, which the bounded channel queues keep in check.
pub struct BlockPool {
    block_size: usize,
    recycled: mpsc::Receiver<Vec<Sample>>,
    recycle: mpsc::Sender<Vec<Sample>>,
}

impl BlockPool {
    /// Create an empty pool handing out blocks of `block_size` samples.
    pub fn new(block_size: usize) -> Self {
        let (recycle, recycled) = mpsc::channel();
        Self {
            block_size,
            recycled,
            recycle,
        }
    }

    /// Get an empty block with at least `block_size` samples of capacity.
    pub fn get(&self) -> Block {
        let buf = match self.recycled.try_recv() {
            Ok(mut buf) => {
                buf.clear();
                buf
            }
            Err(_) => Vec::with_capacity(self.block_size),
        };
        Block::pooled(buf, self.recycle.clone())
    }
}

impl core::fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockPool")
            .field("block_size", &self.block_size)
            .finish_non_exhaustive()
    }
}
