//! Sample clock planning.
//!
//! The sample timer fires once per sample interval and triggers the conversion of the first
//! channel. The remaining channels are converted back to back from the conversion handler, so the
//! ADC clock has to be fast enough to fit every channel of a tick into one interval. The slowest
//! ADC clock that meets this budget is chosen since it gives the analog front end the most
//! settling time.
use fugit::HertzU32;

use crate::settings::{Error, Settings};

/// Hardware that produces the periodic sample tick.
pub trait SampleTrigger {
    /// Start the sample timer and the conversion interrupts according to `plan`.
    fn enable(&mut self, plan: &TimingPlan);

    /// Stop the sample timer and the conversion interrupts.
    fn disable(&mut self);
}

/// Timer and ADC clock configuration derived from [Settings].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TimingPlan {
    pub cpu_hz: HertzU32,
    /// The ADC clock.
    pub conversion_hz: HertzU32,
    /// The ADC clock divisor (log2) relative to the CPU clock.
    pub divisor_log2: u8,
    /// CPU cycles per sample tick.
    pub interval_cycles: u32,
    /// The sample timer prescaler (log2).
    pub timer_prescaler_log2: u8,
    /// The sample timer top value. The timer period is `timer_reload + 1` prescaled counts.
    pub timer_reload: u32,
}

impl TimingPlan {
    /// Plan the sample clock.
    ///
    /// # Args
    /// * `settings` - The session settings. They are validated first.
    ///
    /// # Returns
    /// The timing plan or the configuration error that prevents sampling at the requested rate.
    pub fn new(settings: &Settings) -> Result<Self, Error> {
        settings.validate()?;

        let platform = &settings.platform;
        let channels = settings.channels.len() as i64;

        // The longest period the sample timer can count.
        let longest = platform
            .timer_prescalers_log2
            .iter()
            .max()
            .and_then(|&prescaler| {
                1u64.checked_shl(
                    u32::from(platform.timer_bits) + u32::from(prescaler),
                )
            })
            .ok_or(Error::RateTooSlow)?;

        let ticks = platform.cpu_hz as f64 / settings.sample_rate as f64 + 0.5;
        if ticks >= longest as f64 {
            return Err(Error::RateTooSlow);
        }
        let mut ticks = ticks as u64;

        let divisor_log2 = match settings.conversion_divisor_log2 {
            Some(divisor) => divisor,
            None => {
                let ticks = i64::try_from(ticks)
                    .map_err(|_| Error::RateTooSlow)?;
                // CPU cycles available to each conversion of a tick.
                let budget = (ticks - platform.tick_overhead_cycles as i64)
                    / channels
                    - if channels > 1 {
                        platform.channel_setup_cycles as i64
                    } else {
                        0
                    };

                (platform.min_divisor_log2..=platform.max_divisor_log2)
                    .rev()
                    .find(|&divisor| {
                        budget >= (platform.min_conversion_cycles as i64) << divisor
                    })
                    .ok_or(Error::RateTooHigh)?
            }
        };

        let conversion_hz = platform.cpu_hz >> divisor_log2;
        let ceiling = if settings.eight_bit {
            platform.max_conversion_hz_reduced
        } else {
            platform.max_conversion_hz
        };
        if conversion_hz > ceiling {
            return Err(Error::RateTooHigh);
        }

        if settings.round_interval && divisor_log2 > 0 {
            ticks = ticks
                .checked_add(1 << (divisor_log2 - 1))
                .ok_or(Error::RateTooSlow)?;
            ticks >>= divisor_log2;
            ticks <<= divisor_log2;
        }

        let span = 1u64 << platform.timer_bits;
        let timer_prescaler_log2 = platform
            .timer_prescalers_log2
            .iter()
            .copied()
            .find(|&prescaler| ticks < span << prescaler)
            .ok_or(Error::RateTooSlow)?;

        let counts = ticks >> timer_prescaler_log2;
        if counts == 0 {
            return Err(Error::RateTooHigh);
        }

        let interval_cycles = u32::try_from(counts << timer_prescaler_log2)
            .map_err(|_| Error::RateTooSlow)?;

        Ok(Self {
            cpu_hz: HertzU32::from_raw(platform.cpu_hz),
            conversion_hz: HertzU32::from_raw(conversion_hz),
            divisor_log2,
            interval_cycles,
            timer_prescaler_log2,
            timer_reload: (counts - 1) as u32,
        })
    }

    /// The achieved sample rate in ticks per second.
    pub fn sample_rate(&self) -> f32 {
        self.cpu_hz.raw() as f32 / self.interval_cycles as f32
    }

    /// The achieved sample interval in microseconds.
    pub fn interval_us(&self) -> f32 {
        self.interval_cycles as f32 / (self.cpu_hz.raw() as f32 / 1e6)
    }
}
