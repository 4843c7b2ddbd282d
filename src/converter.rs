//! Round-robin conversion handler
//!
//! # Design
//! The sample timer triggers the conversion of the first channel of every tick. The conversion
//! complete handler then calls [Converter::on_conversion] with the result, which immediately arms
//! the conversion of the following channel so that all channels of a tick are converted back to
//! back. Arming wraps back to the first channel after the last one; that conversion is left to the
//! next timer trigger.
//!
//! Results are appended to the live block. Full blocks are handed to the storage context and a new
//! block is only taken from the empty queue once the next result arrives. If no empty block is
//! available at that point the tick is dropped and counted as an overrun.
//!
//! An overrun can only occur when no block is live, i.e. at a tick boundary, since blocks always
//! hold whole ticks. The dropped result is then the first channel of the tick and the remaining
//! channels of that tick are not armed.
use heapless::Vec;
use volta_stream::{Channel, SampleWidth};

use crate::{
    queue::AcquisitionQueues, settings::MAX_CHANNELS, Block, TimingSupervisor,
};

/// The ADC multiplexer and conversion start.
pub trait Sampler {
    /// Select `channel` and its reference for the next conversion.
    ///
    /// The first channel of the list is converted on the next timer trigger. Every other channel
    /// starts converting immediately.
    fn arm(&mut self, channel: &Channel);
}

/// The acquisition context of a session.
pub struct Converter<'q, 'a, S, const Q: usize> {
    sampler: S,
    queues: AcquisitionQueues<'q, 'a, Q>,
    supervisor: &'q TimingSupervisor,
    channels: Vec<Channel, MAX_CHANNELS>,
    width: SampleWidth,
    // Right shift from a raw conversion to a recorded sample.
    shift: u8,
    // Samples per full block.
    capacity: usize,
    // The channel armed after the current conversion.
    next: usize,
    live: Option<&'a mut Block>,
    overrun: u16,
}

impl<'q, 'a, S: Sampler, const Q: usize> Converter<'q, 'a, S, Q> {
    /// Construct the conversion handler.
    ///
    /// # Args
    /// * `sampler` - The ADC. Its first channel must be set up for timer-triggered conversion.
    /// * `queues` - The acquisition side of the block queues.
    /// * `supervisor` - The tick deadline supervisor shared with the timer handler.
    /// * `channels` - The channels in conversion order. Must not be empty.
    /// * `width` - The recorded sample width.
    /// * `adc_bits` - The resolution of a raw conversion.
    pub fn new(
        sampler: S,
        queues: AcquisitionQueues<'q, 'a, Q>,
        supervisor: &'q TimingSupervisor,
        channels: &[Channel],
        width: SampleWidth,
        adc_bits: u8,
    ) -> Self {
        let mut list = Vec::new();
        list.extend(channels.iter().copied().take(MAX_CHANNELS));

        let shift = match width {
            SampleWidth::Eight => adc_bits.saturating_sub(8),
            SampleWidth::Sixteen => 0,
        };

        Self {
            sampler,
            queues,
            supervisor,
            capacity: width.samples_per_block(list.len()),
            channels: list,
            width,
            shift,
            next: 1 % channels.len().max(1),
            live: None,
            overrun: 0,
        }
    }

    /// Handle a completed conversion.
    ///
    /// # Args
    /// * `raw` - The right-aligned conversion result.
    pub fn on_conversion(&mut self, raw: u16) {
        let block = match self.live.take() {
            Some(block) => block,
            None => match self.queues.acquire() {
                Some(block) => {
                    block.open(self.overrun);
                    block
                }
                None => {
                    self.overrun = self.overrun.saturating_add(1);
                    self.supervisor.acknowledge();
                    return;
                }
            },
        };

        let count = self.channels.len();
        if count > 1 {
            self.sampler.arm(&self.channels[self.next]);
            if self.next == 0 {
                // The last channel of the tick just completed.
                self.supervisor.acknowledge();
            }
            self.next = if self.next + 1 < count { self.next + 1 } else { 0 };
        } else {
            self.supervisor.acknowledge();
        }

        block.push(self.width, raw >> self.shift);

        if block.len() >= self.capacity {
            self.queues.publish(block);
            self.overrun = 0;
        } else {
            self.live = Some(block);
        }
    }

    /// Hand over the partially filled live block once conversions have stopped.
    ///
    /// The block is truncated to the last complete tick. A block without a complete tick is kept
    /// and never written.
    ///
    /// # Returns
    /// The number of samples handed over.
    pub fn flush(&mut self) -> usize {
        let count = self.channels.len();
        let Some(block) = self.live.take() else {
            return 0;
        };

        if block.len() < count {
            self.live = Some(block);
            return 0;
        }

        let len = count * (block.len() / count);
        block.truncate(self.width, len);
        self.queues.publish(block);
        // The block carries the pending overruns.
        self.overrun = 0;
        len
    }

    /// Ticks dropped since the last block was completed.
    pub fn pending_overruns(&self) -> u16 {
        self.overrun
    }

    /// Samples per full block.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples in the live block.
    pub fn live_len(&self) -> usize {
        self.live.as_ref().map_or(0, |block| block.len())
    }

    pub fn sampler(&mut self) -> &mut S {
        &mut self.sampler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::QueuePair;
    use volta_stream::Reference;

    const BLOCK: Block = Block::new();

    #[derive(Default)]
    struct Mux {
        armed: std::vec::Vec<u8>,
    }

    impl Sampler for Mux {
        fn arm(&mut self, channel: &Channel) {
            self.armed.push(channel.pin);
        }
    }

    fn channels(count: u8) -> std::vec::Vec<Channel> {
        (0..count)
            .map(|pin| Channel::new(pin, Reference::Vcc))
            .collect()
    }

    #[test]
    fn round_robin_arming() {
        let supervisor = TimingSupervisor::new();
        let mut pool = [BLOCK; 2];
        let mut queues: QueuePair<'_, 4> = QueuePair::new();
        let (acquisition, _storage) = queues.split(&mut pool).unwrap();
        let mut converter = Converter::new(
            Mux::default(),
            acquisition,
            &supervisor,
            &channels(3),
            SampleWidth::Sixteen,
            10,
        );

        for tick in 0..2 {
            supervisor.on_timer();
            converter.on_conversion(3 * tick);
            assert!(!supervisor.missed());
            converter.on_conversion(3 * tick + 1);
            converter.on_conversion(3 * tick + 2);
        }
        assert!(!supervisor.missed());
        assert_eq!(converter.sampler().armed, [1, 2, 0, 1, 2, 0]);
        assert_eq!(converter.live_len(), 6);

        // The third tick starts before the second was acknowledged.
        supervisor.on_timer();
        converter.on_conversion(6);
        supervisor.on_timer();
        assert!(supervisor.missed());
    }

    #[test]
    fn full_blocks_are_published() {
        let supervisor = TimingSupervisor::new();
        let mut pool = [BLOCK; 2];
        let mut queues: QueuePair<'_, 4> = QueuePair::new();
        let (acquisition, mut storage) = queues.split(&mut pool).unwrap();
        let mut converter = Converter::new(
            Mux::default(),
            acquisition,
            &supervisor,
            &channels(1),
            SampleWidth::Sixteen,
            10,
        );
        assert_eq!(converter.capacity(), 256);

        for value in 0..300 {
            converter.on_conversion(value);
        }
        assert_eq!(storage.pending(), 1);
        assert_eq!(converter.live_len(), 44);

        let block = storage.next_full().unwrap();
        assert_eq!(block.len(), 256);
        assert_eq!(block.sample(SampleWidth::Sixteen, 255), 255);
        assert!(converter.sampler().armed.is_empty());
    }

    #[test]
    fn overrun_counting() {
        let supervisor = TimingSupervisor::new();
        let mut pool = [BLOCK; 2];
        let mut queues: QueuePair<'_, 4> = QueuePair::new();
        let (acquisition, mut storage) = queues.split(&mut pool).unwrap();
        let mut converter = Converter::new(
            Mux::default(),
            acquisition,
            &supervisor,
            &channels(2),
            SampleWidth::Eight,
            10,
        );
        assert_eq!(converter.capacity(), 512);

        // Fill both blocks while storage is stalled.
        for _ in 0..2 * 256 {
            supervisor.on_timer();
            converter.on_conversion(0x3ff);
            converter.on_conversion(0x004);
        }
        assert_eq!(storage.pending(), 2);
        assert!(!supervisor.missed());

        const STALLED: u16 = 17;
        for _ in 0..STALLED {
            supervisor.on_timer();
            converter.on_conversion(0x3ff);
        }
        assert!(!supervisor.missed());
        assert_eq!(converter.pending_overruns(), STALLED);

        // Storage catches up on one block.
        let block = storage.next_full().unwrap();
        assert_eq!(block.overrun(), 0);
        assert_eq!(block.sample(SampleWidth::Eight, 0), 0xff);
        assert_eq!(block.sample(SampleWidth::Eight, 1), 0x01);
        storage.recycle(block);

        for _ in 0..256 {
            supervisor.on_timer();
            converter.on_conversion(1);
            converter.on_conversion(2);
        }
        assert_eq!(converter.pending_overruns(), 0);

        storage.next_full().unwrap();
        let block = storage.next_full().unwrap();
        assert_eq!(block.overrun(), STALLED);
    }

    #[test]
    fn overrun_saturates() {
        let supervisor = TimingSupervisor::new();
        let mut pool = [BLOCK; 2];
        let mut queues: QueuePair<'_, 4> = QueuePair::new();
        let (acquisition, _storage) = queues.split(&mut pool).unwrap();
        let mut converter = Converter::new(
            Mux::default(),
            acquisition,
            &supervisor,
            &channels(1),
            SampleWidth::Eight,
            10,
        );

        for _ in 0..2 * 512 + 70_000 {
            converter.on_conversion(0);
        }
        assert_eq!(converter.pending_overruns(), u16::MAX);
    }

    #[test]
    fn flush_truncates_to_whole_ticks() {
        let supervisor = TimingSupervisor::new();
        let mut pool = [BLOCK; 2];
        let mut queues: QueuePair<'_, 4> = QueuePair::new();
        let (acquisition, mut storage) = queues.split(&mut pool).unwrap();
        let mut converter = Converter::new(
            Mux::default(),
            acquisition,
            &supervisor,
            &channels(3),
            SampleWidth::Sixteen,
            10,
        );

        // Two complete ticks and one partial tick.
        for value in 0..8 {
            converter.on_conversion(value);
        }
        assert_eq!(converter.flush(), 6);
        let block = storage.next_full().unwrap();
        assert_eq!(block.len(), 6);
        assert!(block.as_bytes()[12..].iter().all(|&b| b == 0));

        assert_eq!(converter.flush(), 0);

        // Less than a tick is dropped.
        converter.on_conversion(1);
        converter.on_conversion(2);
        assert_eq!(converter.flush(), 0);
        assert_eq!(storage.pending(), 0);
    }
}
