//! Acquisition settings and the deployment platform profile.
//!
//! Settings are validated once, before any sampling starts. Every violation is a configuration
//! error that prevents the session from arming.
use heapless::Vec;
use miniconf::Tree;
use serde::{Deserialize, Serialize};

use volta_stream::{Channel, Reference, SampleWidth, CHANNEL_CAPACITY};

/// Capacity of the channel list. Lists longer than [CHANNEL_CAPACITY] are rejected at validation.
pub const MAX_CHANNELS: usize = 64;

/// Represents the errors that can occur when validating settings.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("No channels configured")]
    NoChannels,
    #[error("Too many channels")]
    TooManyChannels,
    #[error("Invalid analog pin number")]
    InvalidChannel,
    #[error("Invalid ADC reference")]
    InvalidReference,
    #[error("Invalid ADC prescaler")]
    InvalidPrescaler,
    #[error("Invalid sample rate")]
    InvalidRate,
    #[error("Sample rate too high")]
    RateTooHigh,
    #[error("Sample rate too slow")]
    RateTooSlow,
    #[error("File block budget too small")]
    InvalidBudget,
    #[error("Malformed settings")]
    Malformed,
}

/// Hardware constants of the target the logger runs on.
///
/// The default describes an ATmega328P at 16 MHz with a 10-bit ADC and a 16-bit sample timer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Platform {
    /// Reference clock driving the sample timer and the ADC prescaler.
    pub cpu_hz: u32,
    /// Resolution of a raw conversion.
    pub adc_bits: u8,
    /// Number of analog inputs. Valid pins are `0..analog_inputs`.
    pub analog_inputs: u8,
    /// Mask of supported references, see [Reference::mask].
    pub references: u8,
    /// Minimum ADC clock cycles per conversion.
    pub min_conversion_cycles: u32,
    /// CPU cycles per sample tick reserved for other interrupt work.
    pub tick_overhead_cycles: u32,
    /// Extra CPU cycles per conversion to switch channels when sampling more than one.
    pub channel_setup_cycles: u32,
    /// Smallest selectable ADC clock divisor (log2).
    pub min_divisor_log2: u8,
    /// Largest selectable ADC clock divisor (log2).
    pub max_divisor_log2: u8,
    /// Conversion clock ceiling at full resolution.
    pub max_conversion_hz: u32,
    /// Conversion clock ceiling when only the high 8 bits are recorded.
    pub max_conversion_hz_reduced: u32,
    /// Width of the sample timer counter.
    pub timer_bits: u8,
    /// Available sample timer prescalers (log2), in ascending order.
    pub timer_prescalers_log2: Vec<u8, 8>,
}

impl Default for Platform {
    fn default() -> Self {
        Self {
            cpu_hz: 16_000_000,
            adc_bits: 10,
            analog_inputs: 8,
            references: Reference::External.mask()
                | Reference::Vcc.mask()
                | Reference::InternalHigh.mask(),
            min_conversion_cycles: 15,
            tick_overhead_cycles: 160,
            channel_setup_cycles: 100,
            min_divisor_log2: 2,
            max_divisor_log2: 7,
            max_conversion_hz: 1_000_000,
            max_conversion_hz_reduced: 2_000_000,
            timer_bits: 16,
            // Note(unwrap): The list is shorter than the vector capacity.
            timer_prescalers_log2: Vec::from_slice(&[0, 3, 6, 8, 10]).unwrap(),
        }
    }
}

/// Settings of an acquisition session.
#[derive(Clone, Debug, PartialEq, Tree, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Channels in conversion order. Pins may repeat.
    #[tree(with=miniconf::leaf)]
    pub channels: Vec<Channel, MAX_CHANNELS>,

    /// Sample ticks per second. Every tick converts all channels.
    pub sample_rate: f32,

    /// Record only the high 8 bits of every conversion.
    pub eight_bit: bool,

    /// Round the sample interval to a multiple of the ADC clock period to reduce sample jitter.
    pub round_interval: bool,

    /// Fixed ADC clock divisor (log2). Chosen automatically if absent.
    #[tree(with=miniconf::leaf)]
    pub conversion_divisor_log2: Option<u8>,

    /// Size of the storage reservation in blocks, including the metadata block.
    pub max_blocks: u32,

    #[tree(with=miniconf::leaf)]
    pub platform: Platform,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            // Note(unwrap): A single channel always fits.
            channels: Vec::from_slice(&[Channel::new(0, Reference::Vcc)])
                .unwrap(),
            sample_rate: 1000.0,
            eight_bit: false,
            round_interval: true,
            conversion_divisor_log2: None,
            max_blocks: 256_000,
            platform: Platform::default(),
        }
    }
}

impl Settings {
    /// Load settings from JSON. Absent fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let (settings, _) = serde_json_core::from_str::<Self>(json)
            .map_err(|_| Error::Malformed)?;
        Ok(settings)
    }

    /// The recorded sample width.
    pub fn width(&self) -> SampleWidth {
        if self.eight_bit {
            SampleWidth::Eight
        } else {
            SampleWidth::Sixteen
        }
    }

    /// Check everything that does not depend on clock arithmetic.
    ///
    /// See [crate::TimingPlan::new] for the timing checks.
    pub fn validate(&self) -> Result<(), Error> {
        if self.channels.is_empty() {
            return Err(Error::NoChannels);
        }
        if self.channels.len() > CHANNEL_CAPACITY {
            return Err(Error::TooManyChannels);
        }

        let platform = &self.platform;
        for channel in self.channels.iter() {
            if channel.pin >= platform.analog_inputs {
                return Err(Error::InvalidChannel);
            }
            if platform.references & channel.reference.mask() == 0 {
                return Err(Error::InvalidReference);
            }
        }

        if let Some(divisor) = self.conversion_divisor_log2 {
            if !(platform.min_divisor_log2..=platform.max_divisor_log2)
                .contains(&divisor)
            {
                return Err(Error::InvalidPrescaler);
            }
        }

        if !self.sample_rate.is_finite() || self.sample_rate <= 0.0 {
            return Err(Error::InvalidRate);
        }

        // The metadata block and at least one data block.
        if self.max_blocks < 2 {
            return Err(Error::InvalidBudget);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use miniconf::json_core;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert_eq!(settings.validate(), Ok(()));
        assert_eq!(settings.width(), SampleWidth::Sixteen);
    }

    #[test]
    fn from_json() {
        let settings = Settings::from_json(
            concat!(
                r#"{"channels":[{"pin":1,"reference":"External"},{"pin":2}],"#,
                r#""sample_rate":500.0,"eight_bit":true}"#
            ),
        )
        .unwrap();
        assert_eq!(
            settings.channels.as_slice(),
            &[
                Channel::new(1, Reference::External),
                Channel::new(2, Reference::Vcc)
            ]
        );
        assert_eq!(settings.sample_rate, 500.0);
        assert_eq!(settings.width(), SampleWidth::Eight);
        assert_eq!(settings.max_blocks, 256_000);
        assert_eq!(settings.platform, Platform::default());

        assert_eq!(
            Settings::from_json("{\"sample_rate\":"),
            Err(Error::Malformed)
        );
    }

    #[test]
    fn tree_paths() {
        let mut settings = Settings::default();
        json_core::set(&mut settings, "/sample_rate", b"250").unwrap();
        assert_eq!(settings.sample_rate, 250.0);

        let channels = br#"[{"pin":4,"reference":"Internal"}]"#;
        json_core::set(&mut settings, "/channels", channels).unwrap();
        assert_eq!(
            settings.channels.as_slice(),
            &[Channel::new(4, Reference::Internal)]
        );

        let mut buf = [0u8; 64];
        let len = json_core::get(&settings, "/channels", &mut buf).unwrap();
        assert_eq!(&buf[..len], channels);
        let len = json_core::get(&settings, "/eight_bit", &mut buf).unwrap();
        assert_eq!(&buf[..len], b"false");

        assert!(json_core::set(&mut settings, "/missing", b"1").is_err());
    }

    #[test]
    fn channel_errors() {
        let mut settings = Settings::default();
        settings.channels.clear();
        assert_eq!(settings.validate(), Err(Error::NoChannels));

        for _ in 0..=CHANNEL_CAPACITY {
            settings.channels.push(Channel::new(0, Reference::Vcc)).unwrap();
        }
        assert_eq!(settings.validate(), Err(Error::TooManyChannels));

        settings.channels.clear();
        settings.channels.push(Channel::new(8, Reference::Vcc)).unwrap();
        assert_eq!(settings.validate(), Err(Error::InvalidChannel));

        settings.channels[0] = Channel::new(7, Reference::Internal);
        assert_eq!(settings.validate(), Err(Error::InvalidReference));

        settings.channels[0] = Channel::new(7, Reference::InternalHigh);
        assert_eq!(settings.validate(), Ok(()));
    }

    #[test]
    fn prescaler_rate_and_budget() {
        let mut settings = Settings::default();
        settings.conversion_divisor_log2 = Some(1);
        assert_eq!(settings.validate(), Err(Error::InvalidPrescaler));
        settings.conversion_divisor_log2 = Some(8);
        assert_eq!(settings.validate(), Err(Error::InvalidPrescaler));
        settings.conversion_divisor_log2 = Some(7);
        assert_eq!(settings.validate(), Ok(()));

        for rate in [0.0, -1.0, f32::NAN, f32::INFINITY] {
            settings.sample_rate = rate;
            assert_eq!(settings.validate(), Err(Error::InvalidRate));
        }
        settings.sample_rate = 1000.0;

        settings.max_blocks = 1;
        assert_eq!(settings.validate(), Err(Error::InvalidBudget));
    }
}
