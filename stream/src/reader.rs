use super::{Error, Metadata, BLOCK_SIZE};

/// A single decoded sample.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Sample {
    /// Index of the channel in conversion order.
    pub channel: usize,
    pub value: u16,
}

/// A recorded stream held in memory.
///
/// # Note
/// The recording does not know how many samples of its final data block are valid. A session that
/// was stopped early leaves the remainder of that block zeroed.
#[derive(Clone, Debug)]
pub struct Recording<'a> {
    metadata: Metadata,
    data: &'a [u8],
}

impl<'a> Recording<'a> {
    /// Parse a recording.
    ///
    /// # Args
    /// * `stream` - The raw blocks of the recording, metadata block first.
    pub fn parse(stream: &'a [u8]) -> Result<Self, Error> {
        if stream.len() < BLOCK_SIZE || stream.len() % BLOCK_SIZE != 0 {
            return Err(Error::Truncated);
        }

        let (head, data) = stream.split_at(BLOCK_SIZE);
        let head: &[u8; BLOCK_SIZE] =
            head.try_into().map_err(|_| Error::Truncated)?;
        let metadata = Metadata::decode(head)?;

        Ok(Self { metadata, data })
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Number of data blocks following the metadata block.
    pub fn data_blocks(&self) -> usize {
        self.data.len() / BLOCK_SIZE
    }

    /// Iterate over all samples of all data blocks in recording order.
    pub fn samples(&self) -> impl Iterator<Item = Sample> + 'a {
        let width = self.metadata.width;
        let channels = self.metadata.channels.len();
        let valid = self.metadata.samples_per_block() * width.bytes();

        self.data.chunks_exact(BLOCK_SIZE).flat_map(move |block| {
            block[..valid].chunks_exact(width.bytes()).enumerate().map(
                move |(index, raw)| Sample {
                    channel: index % channels,
                    value: width.decode(raw),
                },
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Channel, Reference, SampleWidth};

    fn recording(width: SampleWidth, blocks: usize) -> std::vec::Vec<u8> {
        let metadata = Metadata {
            cpu_hz: 16_000_000,
            conversion_hz: 125_000,
            sample_interval: 8_000,
            sample_rate: 2000.0,
            width,
            channels: heapless::Vec::from_slice(&[
                Channel::new(0, Reference::Vcc),
                Channel::new(1, Reference::Vcc),
                Channel::new(2, Reference::External),
            ])
            .unwrap(),
        };

        let mut stream = std::vec![0u8; BLOCK_SIZE * (blocks + 1)];
        let head: &mut [u8; BLOCK_SIZE] =
            (&mut stream[..BLOCK_SIZE]).try_into().unwrap();
        metadata.encode(head).unwrap();

        let per_block = metadata.samples_per_block();
        for (block_index, block) in
            stream[BLOCK_SIZE..].chunks_exact_mut(BLOCK_SIZE).enumerate()
        {
            for (index, out) in block
                .chunks_exact_mut(width.bytes())
                .take(per_block)
                .enumerate()
            {
                width.encode((block_index * per_block + index) as u16, out);
            }
        }
        stream
    }

    #[test]
    fn sixteen_bit_samples() {
        let stream = recording(SampleWidth::Sixteen, 2);
        let recording = Recording::parse(&stream).unwrap();
        assert_eq!(recording.data_blocks(), 2);
        assert_eq!(recording.metadata().samples_per_block(), 255);

        let samples: std::vec::Vec<Sample> = recording.samples().collect();
        assert_eq!(samples.len(), 510);
        for (index, sample) in samples.iter().enumerate() {
            assert_eq!(sample.value as usize, index);
            assert_eq!(sample.channel, index % 3);
        }
    }

    #[test]
    fn eight_bit_samples() {
        let stream = recording(SampleWidth::Eight, 1);
        let recording = Recording::parse(&stream).unwrap();
        let samples: std::vec::Vec<Sample> = recording.samples().collect();
        assert_eq!(samples.len(), 510);
        assert_eq!(samples[300].value, 300 & 0xff);
        assert_eq!(samples[300].channel, 0);
    }

    #[test]
    fn rejects_partial_blocks() {
        let stream = recording(SampleWidth::Sixteen, 1);
        assert_eq!(
            Recording::parse(&stream[..BLOCK_SIZE + 10]).unwrap_err(),
            Error::Truncated
        );
        assert_eq!(
            Recording::parse(&stream[..100]).unwrap_err(),
            Error::Truncated
        );
    }
}
