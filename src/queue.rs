//! Lock-free block handoff between the acquisition and the storage context.
//!
//! # Design
//! Two single-producer/single-consumer queues carry exclusive block references:
//!
//! * The **empty** queue is filled by the storage context (returning written blocks) and drained
//!   by the acquisition context (opening a new block).
//! * The **full** queue is filled by the acquisition context (completed blocks) and drained by the
//!   storage context.
//!
//! Each context only ever advances the index it owns on each queue. The index updates use
//! release stores and the opposite side reads them with acquire loads, so a block handed over
//! through a queue is fully written before the other context can observe it. No locks or critical
//! sections are needed and neither side ever blocks.
//!
//! Since the items are `&mut Block`, a block can be referenced from exactly one place at any time:
//! the live slot of the converter, one of the queues, or the storage sink while it is written.
use heapless::spsc::{Consumer, Producer, Queue};

use crate::Block;

/// Represents the errors that can occur when priming the queues.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// Double buffering needs at least two blocks.
    #[error("Buffer pool needs at least two blocks")]
    PoolTooSmall,
    /// The queue dimension must be a power of two larger than the block pool.
    #[error("Invalid queue dimension")]
    Dimension,
}

/// The queue storage of a session.
///
/// # Note
/// A queue of dimension `Q` holds up to `Q - 1` blocks, so `Q` must exceed the pool size.
pub struct QueuePair<'a, const Q: usize> {
    empty: Queue<&'a mut Block, Q>,
    full: Queue<&'a mut Block, Q>,
}

impl<const Q: usize> Default for QueuePair<'_, Q> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, const Q: usize> QueuePair<'a, Q> {
    pub const fn new() -> Self {
        Self {
            empty: Queue::new(),
            full: Queue::new(),
        }
    }

    /// Check that a pool of `blocks` blocks can be split into these queues.
    pub fn check(&self, blocks: usize) -> Result<(), QueueError> {
        if blocks < 2 {
            return Err(QueueError::PoolTooSmall);
        }
        if !Q.is_power_of_two() || Q <= blocks {
            return Err(QueueError::Dimension);
        }
        Ok(())
    }

    /// Prime the empty queue with the block pool and split the queues into the two contexts.
    ///
    /// # Args
    /// * `pool` - All blocks of the session. They are enqueued in order.
    ///
    /// # Returns
    /// (acquisition, storage) where `acquisition` belongs to the conversion handler and `storage`
    /// to the main loop.
    pub fn split<'q>(
        &'q mut self,
        pool: &'a mut [Block],
    ) -> Result<
        (AcquisitionQueues<'q, 'a, Q>, StorageQueues<'q, 'a, Q>),
        QueueError,
    > {
        self.check(pool.len())?;

        let (empty_in, empty_out) = self.empty.split();
        let (full_in, full_out) = self.full.split();

        let mut storage = StorageQueues {
            full: full_out,
            empty: empty_in,
        };
        for block in pool {
            storage
                .empty
                .enqueue(block)
                .map_err(|_| QueueError::Dimension)?;
        }

        let acquisition = AcquisitionQueues {
            empty: empty_out,
            full: full_in,
        };

        Ok((acquisition, storage))
    }
}

/// The queue ends owned by the acquisition (interrupt) context.
pub struct AcquisitionQueues<'q, 'a, const Q: usize> {
    empty: Consumer<'q, &'a mut Block, Q>,
    full: Producer<'q, &'a mut Block, Q>,
}

impl<'a, const Q: usize> AcquisitionQueues<'_, 'a, Q> {
    /// Check if an empty block can be acquired.
    #[inline]
    pub fn has_empty(&self) -> bool {
        self.empty.ready()
    }

    /// Take the oldest empty block.
    #[inline]
    pub fn acquire(&mut self) -> Option<&'a mut Block> {
        self.empty.dequeue()
    }

    /// Hand a completed block to the storage context.
    #[inline]
    pub fn publish(&mut self, block: &'a mut Block) {
        // Note(unwrap): The queue dimension exceeds the pool size, so every block of the pool
        // fits into the full queue at once.
        self.full.enqueue(block).unwrap();
    }
}

/// The queue ends owned by the storage (main loop) context.
pub struct StorageQueues<'q, 'a, const Q: usize> {
    full: Consumer<'q, &'a mut Block, Q>,
    empty: Producer<'q, &'a mut Block, Q>,
}

impl<'a, const Q: usize> StorageQueues<'_, 'a, Q> {
    /// Take the oldest completed block.
    #[inline]
    pub fn next_full(&mut self) -> Option<&'a mut Block> {
        self.full.dequeue()
    }

    /// The number of completed blocks waiting for storage.
    pub fn pending(&self) -> usize {
        self.full.len()
    }

    /// The number of blocks available to the acquisition context.
    pub fn available(&self) -> usize {
        self.empty.len()
    }

    /// Return a written block for reuse.
    #[inline]
    pub fn recycle(&mut self, block: &'a mut Block) {
        // Note(unwrap): The queue dimension exceeds the pool size.
        self.empty.enqueue(block).unwrap();
    }
}
