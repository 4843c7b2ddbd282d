use volta_stream::{SampleWidth, BLOCK_SIZE};

/// A page of channel-interleaved samples.
///
/// Blocks are allocated once per session as a pool and then cycle between the converter, the full
/// queue, the storage sink and the empty queue.
#[derive(Debug)]
pub struct Block {
    data: [u8; BLOCK_SIZE],
    count: u16,
    overrun: u16,
}

impl Default for Block {
    fn default() -> Self {
        Self::new()
    }
}

impl Block {
    pub const fn new() -> Self {
        Self {
            data: [0; BLOCK_SIZE],
            count: 0,
            overrun: 0,
        }
    }

    /// Prepare the block for a new fill.
    ///
    /// # Args
    /// * `overrun` - The number of sample ticks dropped since the previous block completed.
    pub fn open(&mut self, overrun: u16) {
        self.count = 0;
        self.overrun = overrun;
    }

    /// Append a sample. The block must not be full.
    #[inline]
    pub fn push(&mut self, width: SampleWidth, value: u16) {
        let offset = self.count as usize * width.bytes();
        width.encode(value, &mut self.data[offset..]);
        self.count += 1;
    }

    /// The number of valid samples.
    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Ticks dropped before this block was opened.
    pub fn overrun(&self) -> u16 {
        self.overrun
    }

    /// Shorten the block to `len` samples and zero the remainder.
    pub fn truncate(&mut self, width: SampleWidth, len: usize) {
        let len = len.min(self.len());
        self.count = len as u16;
        self.data[len * width.bytes()..].fill(0);
    }

    /// Read back the sample at `index`.
    pub fn sample(&self, width: SampleWidth, index: usize) -> u16 {
        width.decode(&self.data[index * width.bytes()..])
    }

    pub fn as_bytes(&self) -> &[u8; BLOCK_SIZE] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8; BLOCK_SIZE] {
        &mut self.data
    }
}
