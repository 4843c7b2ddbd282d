//! Volta logger block stream format
//!
//! # Design
//! A recording is a sequence of fixed-size blocks of [BLOCK_SIZE] bytes written back to back into
//! a contiguous region of the storage medium. Block 0 is the metadata block, every following block
//! is a data block.
//!
//! ## Metadata Block
//! All multi-byte fields are little-endian.
//!
//! * **CPU frequency** (u32): reference clock in Hz.
//! * **Conversion frequency** (u32): ADC clock in Hz.
//! * **Sample interval** (u32): reference clock cycles between two sample ticks.
//! * **Sample width** (u8): 8 or 16, see [SampleWidth].
//! * **Channel count** (u8)
//! * **Format version** (u8): [FORMAT_VERSION].
//! * Reserved (u8)
//! * **Channels** ([CHANNEL_CAPACITY] × 2 bytes): analog pin and [Reference] of every channel in
//!   conversion order. Unused entries are zero.
//!
//! The block ends with the textual handshake
//! ```text
//! \nVOLTAHELLO\n{"sps": <rate>}\nDATASTART\n
//! ```
//! positioned so that its final newline is the last byte of the block. Bytes between the
//! channel table and the handshake are zero.
//!
//! ## Data Blocks
//! A flat sequence of samples of the configured [SampleWidth], channel-interleaved in
//! conversion order. Every block holds [SampleWidth::samples_per_block] samples. The last block of
//! a recording that was stopped early may be partially filled, the remainder is zero.
#![cfg_attr(not(test), no_std)]

use core::fmt::Write;
use heapless::{String, Vec};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

mod reader;
pub use reader::*;

/// Size of every block of the stream in bytes.
pub const BLOCK_SIZE: usize = 512;

/// The number of channels the metadata block can describe.
pub const CHANNEL_CAPACITY: usize = 32;

/// Layout version written into the metadata block.
pub const FORMAT_VERSION: u8 = 1;

// Size of the fixed binary fields at the start of the metadata block.
const FIELDS_SIZE: usize = 16 + 2 * CHANNEL_CAPACITY;

// Upper bound on the handshake text length.
const HEADER_CAPACITY: usize = 128;

const HELLO: &[u8] = b"\nVOLTAHELLO\n";
const DATASTART: &[u8] = b"\nDATASTART\n";

/// Width of a single recorded sample.
#[repr(u8)]
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    IntoPrimitive,
    TryFromPrimitive,
    Serialize,
    Deserialize,
)]
pub enum SampleWidth {
    /// The high 8 bits of every conversion.
    Eight = 8,
    /// Full resolution conversions stored as little-endian u16.
    Sixteen = 16,
}

impl SampleWidth {
    /// Number of bytes per sample.
    pub const fn bytes(self) -> usize {
        match self {
            Self::Eight => 1,
            Self::Sixteen => 2,
        }
    }

    /// Number of valid samples in a full data block.
    ///
    /// This is the largest multiple of the channel count that fits into a block so that a block
    /// always ends on a complete multi-channel sample group.
    pub const fn samples_per_block(self, channels: usize) -> usize {
        if channels == 0 {
            return 0;
        }
        (BLOCK_SIZE / self.bytes() / channels) * channels
    }

    /// Write a sample into `out`, which must be at least [Self::bytes] long.
    #[inline]
    pub fn encode(self, value: u16, out: &mut [u8]) {
        match self {
            Self::Eight => out[0] = value as u8,
            Self::Sixteen => out[..2].copy_from_slice(&value.to_le_bytes()),
        }
    }

    /// Read a sample from `raw`, which must be at least [Self::bytes] long.
    #[inline]
    pub fn decode(self, raw: &[u8]) -> u16 {
        match self {
            Self::Eight => raw[0] as u16,
            Self::Sixteen => u16::from_le_bytes([raw[0], raw[1]]),
        }
    }
}

/// Analog reference selection of a channel.
#[repr(u8)]
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    IntoPrimitive,
    TryFromPrimitive,
    Serialize,
    Deserialize,
)]
pub enum Reference {
    /// External reference pin.
    External = 0,
    /// Supply voltage.
    Vcc = 1,
    /// Internal bandgap reference.
    Internal = 2,
    /// Second internal reference where available.
    InternalHigh = 3,
}

impl Default for Reference {
    fn default() -> Self {
        Self::Vcc
    }
}

impl Reference {
    /// Bit of this reference in a support mask.
    pub const fn mask(self) -> u8 {
        1 << self as u8
    }
}

/// One analog input source.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Analog input number.
    pub pin: u8,
    /// Reference used for conversions of this input.
    #[serde(default)]
    pub reference: Reference,
}

impl Channel {
    pub const fn new(pin: u8, reference: Reference) -> Self {
        Self { pin, reference }
    }
}

/// Errors encountered while encoding or decoding a stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// More channels than the metadata block can describe.
    #[error("Too many channels")]
    TooManyChannels,
    /// The metadata block does not describe any channel.
    #[error("No channels")]
    NoChannels,
    /// The handshake text does not fit into the metadata block.
    #[error("Handshake does not fit the metadata block")]
    HeaderOverflow,
    /// No handshake at the end of the metadata block.
    #[error("Missing stream handshake")]
    MissingHandshake,
    /// The handshake could not be parsed.
    #[error("Malformed stream handshake")]
    Handshake,
    /// Unknown sample width code.
    #[error("Unknown sample width")]
    Width,
    /// Unknown reference code.
    #[error("Unknown reference")]
    Reference,
    /// The stream is not a whole number of blocks.
    #[error("Truncated stream")]
    Truncated,
}

/// The JSON line of the handshake.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    /// Configured samples per second.
    pub sps: f32,
}

/// Session description stored in block 0.
#[derive(Clone, Debug, PartialEq)]
pub struct Metadata {
    pub cpu_hz: u32,
    pub conversion_hz: u32,
    /// Reference clock cycles per sample tick.
    pub sample_interval: u32,
    /// The configured sample rate announced in the handshake.
    pub sample_rate: f32,
    pub width: SampleWidth,
    pub channels: Vec<Channel, CHANNEL_CAPACITY>,
}

impl Metadata {
    /// The sample rate realized by the sample interval.
    pub fn achieved_rate(&self) -> f32 {
        self.cpu_hz as f32 / self.sample_interval as f32
    }

    /// Number of samples in a full data block.
    pub fn samples_per_block(&self) -> usize {
        self.width.samples_per_block(self.channels.len())
    }

    /// Serialize the metadata into a block.
    pub fn encode(&self, block: &mut [u8; BLOCK_SIZE]) -> Result<(), Error> {
        block.fill(0);

        block[0..4].copy_from_slice(&self.cpu_hz.to_le_bytes());
        block[4..8].copy_from_slice(&self.conversion_hz.to_le_bytes());
        block[8..12].copy_from_slice(&self.sample_interval.to_le_bytes());
        block[12] = self.width.into();
        block[13] = self.channels.len() as u8;
        block[14] = FORMAT_VERSION;

        for (channel, entry) in
            self.channels.iter().zip(block[16..FIELDS_SIZE].chunks_exact_mut(2))
        {
            entry[0] = channel.pin;
            entry[1] = channel.reference.into();
        }

        let header = handshake(self.sample_rate)?;
        let start = BLOCK_SIZE - header.len();
        block[start..].copy_from_slice(header.as_bytes());
        Ok(())
    }

    /// Parse a metadata block.
    pub fn decode(block: &[u8; BLOCK_SIZE]) -> Result<Self, Error> {
        let word = |offset: usize| {
            u32::from_le_bytes([
                block[offset],
                block[offset + 1],
                block[offset + 2],
                block[offset + 3],
            ])
        };

        let width = SampleWidth::try_from(block[12]).map_err(|_| Error::Width)?;

        let count = block[13] as usize;
        if count > CHANNEL_CAPACITY {
            return Err(Error::TooManyChannels);
        }
        if count == 0 {
            return Err(Error::NoChannels);
        }

        let mut channels = Vec::new();
        for entry in block[16..FIELDS_SIZE].chunks_exact(2).take(count) {
            let reference = Reference::try_from(entry[1])
                .map_err(|_| Error::Reference)?;
            // Note(unwrap): The count is bounded by the vector capacity above.
            channels.push(Channel::new(entry[0], reference)).unwrap();
        }

        let Handshake { sps } = parse_handshake(&block[FIELDS_SIZE..])?;

        Ok(Self {
            cpu_hz: word(0),
            conversion_hz: word(4),
            sample_interval: word(8),
            sample_rate: sps,
            width,
            channels,
        })
    }
}

/// Render the handshake text announcing `sample_rate`.
pub fn handshake(sample_rate: f32) -> Result<String<HEADER_CAPACITY>, Error> {
    let mut text: String<HEADER_CAPACITY> = String::new();
    write!(
        &mut text,
        "\nVOLTAHELLO\n{{\"sps\": {sample_rate}}}\nDATASTART\n"
    )
    .map_err(|_| Error::HeaderOverflow)?;

    if text.len() > BLOCK_SIZE - FIELDS_SIZE {
        return Err(Error::HeaderOverflow);
    }
    Ok(text)
}

// The handshake must end exactly at the end of `tail`.
fn parse_handshake(tail: &[u8]) -> Result<Handshake, Error> {
    let start = tail
        .windows(HELLO.len())
        .rposition(|window| window == HELLO)
        .ok_or(Error::MissingHandshake)?;

    let json = tail[start + HELLO.len()..]
        .strip_suffix(DATASTART)
        .ok_or(Error::MissingHandshake)?;
    let json = core::str::from_utf8(json).map_err(|_| Error::Handshake)?;

    let (handshake, _) = serde_json_core::from_str::<Handshake>(json)
        .map_err(|_| Error::Handshake)?;
    Ok(handshake)
}
