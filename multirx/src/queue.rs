//! The per-channel hand-off between the acquisition loop and a writer.
//!
//! Each channel gets a bounded, lock-free queue with exactly one
//! [`BlockProducer`] and one [`BlockConsumer`]; neither half can be cloned.
//! Enqueueing never blocks: when the queue is full, the newest block is handed
//! back to the caller to drop and count. The queue never grows past its
//! capacity, so a writer that can't keep up costs data, not memory.

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};

use crate::{Block, SAMPLE_SIZE};

/// Default amount of buffering per channel, in bytes.
pub const DEFAULT_QUEUE_BYTES: usize = 64 << 20;

/// Pick a queue depth, in blocks, for a given block size in samples.
///
/// Buffers about [`DEFAULT_QUEUE_BYTES`] of samples, and never fewer than 4
/// blocks.
pub fn default_depth(block_size: usize) -> usize {
    (DEFAULT_QUEUE_BYTES / (block_size.max(1) * SAMPLE_SIZE)).max(4)
}

/// Create a queue holding up to `capacity` blocks.
///
/// A capacity of 0 is bumped up to 1.
pub fn channel_queue(capacity: usize) -> (BlockProducer, BlockConsumer) {
    let capacity = capacity.max(1);
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    (
        BlockProducer { tx, capacity },
        BlockConsumer { rx },
    )
}

/// Why a block was refused by [`BlockProducer::try_enqueue`]. The block is
/// handed back either way.
#[derive(Debug)]
pub enum EnqueueError {
    /// The queue is at capacity.
    Full(Block),
    /// The consumer is gone.
    Closed(Block),
}

impl EnqueueError {
    /// Get back the refused block.
    pub fn into_inner(self) -> Block {
        match self {
            Self::Full(b) | Self::Closed(b) => b,
        }
    }

    /// True if the consumer is gone, and every later enqueue will fail too.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

/// Result of a [`BlockConsumer::try_dequeue`].
#[derive(Debug)]
pub enum Dequeue {
    /// The oldest block in the queue.
    Block(Block),
    /// Nothing queued right now.
    Empty,
    /// Nothing queued, and the producer is gone, so nothing ever will be.
    Closed,
}

/// The sending half of a channel queue, owned by the acquisition loop.
#[derive(Debug)]
pub struct BlockProducer {
    tx: Sender<Block>,
    capacity: usize,
}

impl BlockProducer {
    /// Try to queue up a block without blocking.
    pub fn try_enqueue(&self, block: Block) -> Result<(), EnqueueError> {
        self.tx.try_send(block).map_err(|e| match e {
            TrySendError::Full(b) => EnqueueError::Full(b),
            TrySendError::Disconnected(b) => EnqueueError::Closed(b),
        })
    }

    /// Maximum number of queued blocks.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// The receiving half of a channel queue, owned by a writer.
#[derive(Debug)]
pub struct BlockConsumer {
    rx: Receiver<Block>,
}

impl BlockConsumer {
    /// Take the oldest queued block, without blocking.
    pub fn try_dequeue(&self) -> Dequeue {
        match self.rx.try_recv() {
            Ok(block) => Dequeue::Block(block),
            Err(TryRecvError::Empty) => Dequeue::Empty,
            Err(TryRecvError::Disconnected) => Dequeue::Closed,
        }
    }

    /// Number of blocks currently queued.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
