//! Sequential block storage.
//!
//! # Design
//! Before streaming starts, the sink reserves a contiguous region for the whole recording and
//! erases it. The multi-block write then runs without any erase work on the medium, which keeps the
//! write latency during streaming low and predictable. Blocks are written strictly in order.
//! When the session ends before the reservation is used up, the recording is truncated to the
//! number of blocks actually written.
use core::ops::Range;

use embedded_storage::nor_flash::{NorFlash, NorFlashError, NorFlashErrorKind};
use fugit::MicrosDurationU64;
use log::{debug, warn};
use volta_stream::BLOCK_SIZE;

use crate::Instant;

/// Maximum number of blocks erased in one device call.
pub const ERASE_CHUNK: u32 = 262_144;

/// A free running microsecond time base.
pub trait Monotonic {
    fn now(&self) -> Instant;
}

impl<T: Monotonic> Monotonic for &T {
    fn now(&self) -> Instant {
        T::now(self)
    }
}

/// A medium addressed in blocks of [BLOCK_SIZE] bytes.
pub trait BlockDevice {
    type Error: core::fmt::Debug;

    /// Allocate a contiguous region of `blocks` blocks for a new recording.
    ///
    /// # Returns
    /// The block addresses of the region.
    fn reserve(&mut self, blocks: u32) -> Result<Range<u32>, Self::Error>;

    /// Erase a range of blocks.
    fn erase(&mut self, blocks: Range<u32>) -> Result<(), Self::Error>;

    /// Begin a multi-block write of `count` blocks at block `start`.
    fn write_start(
        &mut self,
        start: u32,
        count: u32,
    ) -> Result<(), Self::Error>;

    /// Write the next block of the running multi-block write.
    fn write_next(
        &mut self,
        block: &[u8; BLOCK_SIZE],
    ) -> Result<(), Self::Error>;

    /// End the running multi-block write.
    fn write_stop(&mut self) -> Result<(), Self::Error>;

    /// Shorten the recording to its first `blocks` blocks.
    fn truncate(&mut self, blocks: u32) -> Result<(), Self::Error>;
}

/// Represents the errors that can occur while storing a recording.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error<E: core::fmt::Debug> {
    #[error("Reserving the recording failed: {0:?}")]
    Reserve(E),
    #[error("The reserved region does not match the request")]
    Reservation,
    #[error("Erasing failed: {0:?}")]
    Erase(E),
    #[error("Starting the block write failed: {0:?}")]
    WriteStart(E),
    #[error("Writing a block failed: {0:?}")]
    Write(E),
    #[error("Stopping the block write failed: {0:?}")]
    WriteStop(E),
    #[error("Truncating the recording failed: {0:?}")]
    Truncate(E),
    #[error("The reservation is full")]
    Full,
    #[error("No recording is open")]
    Closed,
}

/// Writes a single recording to a [BlockDevice].
pub struct StorageSink<D, C> {
    device: D,
    clock: C,
    region: Option<Range<u32>>,
    written: u32,
    max_latency: MicrosDurationU64,
}

impl<D: BlockDevice, C: Monotonic> StorageSink<D, C> {
    pub fn new(device: D, clock: C) -> Self {
        Self {
            device,
            clock,
            region: None,
            written: 0,
            max_latency: MicrosDurationU64::from_ticks(0),
        }
    }

    /// Reserve and erase the region of a new recording and start the multi-block write.
    ///
    /// # Args
    /// * `capacity` - The size of the recording in blocks, including the metadata block.
    pub fn open(&mut self, capacity: u32) -> Result<(), Error<D::Error>> {
        if self.region.is_some() {
            return Err(Error::Reservation);
        }

        let region = self.device.reserve(capacity).map_err(Error::Reserve)?;
        if region.len() != capacity as usize {
            return Err(Error::Reservation);
        }

        let mut start = region.start;
        while start < region.end {
            let end = region.end.min(start.saturating_add(ERASE_CHUNK));
            debug!("Erasing blocks {start}..{end}");
            self.device.erase(start..end).map_err(Error::Erase)?;
            start = end;
        }

        self.device
            .write_start(region.start, capacity)
            .map_err(Error::WriteStart)?;

        self.region = Some(region);
        self.written = 0;
        self.max_latency = MicrosDurationU64::from_ticks(0);
        Ok(())
    }

    /// Append the next block of the recording.
    ///
    /// # Returns
    /// The time the device took to accept the block.
    pub fn write_block(
        &mut self,
        block: &[u8; BLOCK_SIZE],
    ) -> Result<MicrosDurationU64, Error<D::Error>> {
        if self.remaining()? == 0 {
            return Err(Error::Full);
        }

        let start = self.clock.now();
        self.device.write_next(block).map_err(Error::Write)?;
        let latency = self
            .clock
            .now()
            .checked_duration_since(start)
            .unwrap_or(MicrosDurationU64::from_ticks(0));

        self.written += 1;
        if latency > self.max_latency {
            self.max_latency = latency;
        }
        Ok(latency)
    }

    /// Finish the recording and truncate it to the blocks written.
    pub fn close(&mut self) -> Result<u32, Error<D::Error>> {
        let capacity = self.capacity();
        if self.region.take().is_none() {
            return Err(Error::Closed);
        }

        self.device.write_stop().map_err(Error::WriteStop)?;

        if self.written < capacity {
            warn!("Truncating recording to {} blocks", self.written);
            self.device
                .truncate(self.written)
                .map_err(Error::Truncate)?;
        }

        Ok(self.written)
    }

    /// Blocks written to the open recording, metadata included.
    pub fn written(&self) -> u32 {
        self.written
    }

    /// Size of the reservation in blocks.
    pub fn capacity(&self) -> u32 {
        self.region.as_ref().map_or(0, |region| region.len() as u32)
    }

    /// Blocks left in the reservation.
    pub fn remaining(&self) -> Result<u32, Error<D::Error>> {
        let region = self.region.as_ref().ok_or(Error::Closed)?;
        Ok(region.len() as u32 - self.written)
    }

    pub fn is_open(&self) -> bool {
        self.region.is_some()
    }

    /// The longest write since the recording was opened.
    pub fn max_latency(&self) -> MicrosDurationU64 {
        self.max_latency
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn release(self) -> (D, C) {
        (self.device, self.clock)
    }
}

/// Errors of the [MemoryDevice].
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("Not enough memory")]
    NoSpace,
    #[error("Block address out of range")]
    OutOfRange,
    #[error("No multi-block write is running")]
    NotWriting,
    #[error("Injected write fault")]
    Fault,
}

/// A block device in RAM.
pub struct MemoryDevice<'a> {
    memory: &'a mut [u8],
    cursor: Option<Range<u32>>,
    length: u32,
    fail_after: Option<u32>,
}

impl<'a> MemoryDevice<'a> {
    /// # Args
    /// * `memory` - The backing memory. Trailing bytes short of a full block are unused.
    pub fn new(memory: &'a mut [u8]) -> Self {
        Self {
            memory,
            cursor: None,
            length: 0,
            fail_after: None,
        }
    }

    /// Fail every write after the next `blocks` successful block writes.
    pub fn fail_writes_after(&mut self, blocks: u32) {
        self.fail_after = Some(blocks);
    }

    /// The number of blocks the memory holds.
    pub fn blocks(&self) -> u32 {
        (self.memory.len() / BLOCK_SIZE) as u32
    }

    /// The current recording.
    pub fn recording(&self) -> &[u8] {
        &self.memory[..self.length as usize * BLOCK_SIZE]
    }
}

impl BlockDevice for MemoryDevice<'_> {
    type Error = MemoryError;

    fn reserve(&mut self, blocks: u32) -> Result<Range<u32>, MemoryError> {
        if blocks > self.blocks() {
            return Err(MemoryError::NoSpace);
        }
        self.length = blocks;
        Ok(0..blocks)
    }

    fn erase(&mut self, blocks: Range<u32>) -> Result<(), MemoryError> {
        if blocks.end > self.blocks() {
            return Err(MemoryError::OutOfRange);
        }
        let (start, end) = (blocks.start as usize, blocks.end as usize);
        self.memory[start * BLOCK_SIZE..end * BLOCK_SIZE].fill(0);
        Ok(())
    }

    fn write_start(
        &mut self,
        start: u32,
        count: u32,
    ) -> Result<(), MemoryError> {
        let end = start.checked_add(count).ok_or(MemoryError::OutOfRange)?;
        if end > self.blocks() {
            return Err(MemoryError::OutOfRange);
        }
        self.cursor = Some(start..end);
        Ok(())
    }

    fn write_next(
        &mut self,
        block: &[u8; BLOCK_SIZE],
    ) -> Result<(), MemoryError> {
        if let Some(remaining) = self.fail_after.as_mut() {
            if *remaining == 0 {
                return Err(MemoryError::Fault);
            }
            *remaining -= 1;
        }

        let cursor = self.cursor.as_mut().ok_or(MemoryError::NotWriting)?;
        if cursor.is_empty() {
            return Err(MemoryError::OutOfRange);
        }
        let offset = cursor.start as usize * BLOCK_SIZE;
        cursor.start += 1;

        self.memory[offset..offset + BLOCK_SIZE].copy_from_slice(block);
        Ok(())
    }

    fn write_stop(&mut self) -> Result<(), MemoryError> {
        self.cursor.take().ok_or(MemoryError::NotWriting)?;
        Ok(())
    }

    fn truncate(&mut self, blocks: u32) -> Result<(), MemoryError> {
        self.length = self.length.min(blocks);
        Ok(())
    }
}

/// A raw region of NOR flash used as a block device.
///
/// # Note
/// The region must start and end on erase sector boundaries and [BLOCK_SIZE] must be a multiple
/// of the flash write size.
pub struct FlashVolume<F> {
    flash: F,
    base: u32,
    blocks: u32,
    cursor: Option<Range<u32>>,
    length: u32,
}

impl<F: NorFlash> FlashVolume<F> {
    /// Create a volume.
    ///
    /// # Args
    /// * `flash` - The flash device.
    /// * `base` - Byte offset of the region in the flash.
    /// * `size` - Size of the region in bytes.
    pub fn new(
        flash: F,
        base: u32,
        size: u32,
    ) -> Result<Self, NorFlashErrorKind> {
        let erase = F::ERASE_SIZE as u32;
        if base % erase != 0
            || size % erase != 0
            || BLOCK_SIZE % F::WRITE_SIZE != 0
        {
            return Err(NorFlashErrorKind::NotAligned);
        }
        let end = base.checked_add(size).ok_or(NorFlashErrorKind::OutOfBounds)?;
        if end as usize > flash.capacity() {
            return Err(NorFlashErrorKind::OutOfBounds);
        }

        Ok(Self {
            flash,
            base,
            blocks: size / BLOCK_SIZE as u32,
            cursor: None,
            length: 0,
        })
    }

    /// Blocks of the current recording.
    pub fn len(&self) -> u32 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Read back a block of the current recording.
    pub fn read_block(
        &mut self,
        index: u32,
        block: &mut [u8; BLOCK_SIZE],
    ) -> Result<(), NorFlashErrorKind> {
        if index >= self.length {
            return Err(NorFlashErrorKind::OutOfBounds);
        }
        self.flash
            .read(self.offset(index), block)
            .map_err(|e| e.kind())
    }

    pub fn release(self) -> F {
        self.flash
    }

    fn offset(&self, block: u32) -> u32 {
        self.base + block * BLOCK_SIZE as u32
    }
}

impl<F: NorFlash> BlockDevice for FlashVolume<F> {
    type Error = NorFlashErrorKind;

    fn reserve(&mut self, blocks: u32) -> Result<Range<u32>, Self::Error> {
        if blocks > self.blocks {
            return Err(NorFlashErrorKind::OutOfBounds);
        }
        self.length = blocks;
        Ok(0..blocks)
    }

    fn erase(&mut self, blocks: Range<u32>) -> Result<(), Self::Error> {
        if blocks.end > self.blocks {
            return Err(NorFlashErrorKind::OutOfBounds);
        }
        if blocks.is_empty() {
            return Ok(());
        }

        // Widen to whole sectors. The region itself is sector aligned.
        let sector = F::ERASE_SIZE as u32;
        let from = self.offset(blocks.start) / sector * sector;
        let to = self.offset(blocks.end).div_ceil(sector) * sector;
        self.flash.erase(from, to).map_err(|e| e.kind())
    }

    fn write_start(
        &mut self,
        start: u32,
        count: u32,
    ) -> Result<(), Self::Error> {
        let end = start
            .checked_add(count)
            .ok_or(NorFlashErrorKind::OutOfBounds)?;
        if end > self.blocks {
            return Err(NorFlashErrorKind::OutOfBounds);
        }
        self.cursor = Some(start..end);
        Ok(())
    }

    fn write_next(
        &mut self,
        block: &[u8; BLOCK_SIZE],
    ) -> Result<(), Self::Error> {
        let cursor = self.cursor.as_mut().ok_or(NorFlashErrorKind::Other)?;
        if cursor.is_empty() {
            return Err(NorFlashErrorKind::OutOfBounds);
        }
        let index = cursor.start;
        cursor.start += 1;

        let offset = self.offset(index);
        self.flash.write(offset, block).map_err(|e| e.kind())
    }

    fn write_stop(&mut self) -> Result<(), Self::Error> {
        self.cursor.take().ok_or(NorFlashErrorKind::Other)?;
        Ok(())
    }

    fn truncate(&mut self, blocks: u32) -> Result<(), Self::Error> {
        self.length = self.length.min(blocks);
        Ok(())
    }
}
