//! Operator stop requests.
use embedded_hal::digital::InputPin;
use embedded_io::ReadReady;
use fugit::MillisDurationU32;
use log::warn;

use crate::Instant;

/// Debounce interval of [DebouncedInput].
pub const DEBOUNCE: MillisDurationU32 = MillisDurationU32::from_ticks(5);

/// A source of stop requests polled from the storage loop.
pub trait StopSignal {
    /// Check if the operator asked to stop the recording.
    ///
    /// # Args
    /// * `now` - The current time.
    fn stop_requested(&mut self, now: Instant) -> bool;
}

/// Never requests a stop. The recording then ends when the reservation is full.
#[derive(Copy, Clone, Debug, Default)]
pub struct Never;

impl StopSignal for Never {
    fn stop_requested(&mut self, _now: Instant) -> bool {
        false
    }
}

/// Either of two signals.
impl<A: StopSignal, B: StopSignal> StopSignal for (A, B) {
    fn stop_requested(&mut self, now: Instant) -> bool {
        // Poll both so that debouncers keep tracking their input.
        let a = self.0.stop_requested(now);
        let b = self.1.stop_requested(now);
        a || b
    }
}

/// Stops on any byte received from the console.
pub struct ConsoleStop<R> {
    console: R,
}

impl<R: ReadReady> ConsoleStop<R> {
    pub fn new(console: R) -> Self {
        Self { console }
    }

    pub fn release(self) -> R {
        self.console
    }
}

impl<R: ReadReady> StopSignal for ConsoleStop<R> {
    fn stop_requested(&mut self, _now: Instant) -> bool {
        match self.console.read_ready() {
            Ok(ready) => ready,
            Err(e) => {
                warn!("Console failed, stopping: {e:?}");
                true
            }
        }
    }
}

/// A switch input that requests a stop while it is at its active level.
///
/// A level change is only accepted once the raw input has been stable for [DEBOUNCE].
pub struct DebouncedInput<P> {
    pin: P,
    active_high: bool,
    stable: bool,
    raw: bool,
    since: Option<Instant>,
}

impl<P: InputPin> DebouncedInput<P> {
    /// # Args
    /// * `pin` - The switch input.
    /// * `active_high` - Request a stop while the input is high rather than low.
    pub fn new(pin: P, active_high: bool) -> Self {
        Self {
            pin,
            active_high,
            stable: !active_high,
            raw: !active_high,
            since: None,
        }
    }

    /// Sample the input and update the debounced level.
    ///
    /// # Returns
    /// The debounced level. True if high.
    pub fn update(&mut self, now: Instant) -> bool {
        let Ok(level) = self.pin.is_high() else {
            return self.stable;
        };

        if level != self.raw {
            self.raw = level;
            self.since = Some(now);
        } else if level != self.stable {
            let settled = self
                .since
                .and_then(|since| now.checked_duration_since(since))
                .is_some_and(|held| {
                    held.ticks() >= u64::from(DEBOUNCE.to_micros())
                });
            if settled {
                self.stable = level;
            }
        }

        self.stable
    }

    pub fn release(self) -> P {
        self.pin
    }
}

impl<P: InputPin> StopSignal for DebouncedInput<P> {
    fn stop_requested(&mut self, now: Instant) -> bool {
        self.update(now) == self.active_high
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::Infallible;

    struct Switch(bool);

    impl embedded_hal::digital::ErrorType for Switch {
        type Error = Infallible;
    }

    impl InputPin for Switch {
        fn is_high(&mut self) -> Result<bool, Infallible> {
            Ok(self.0)
        }

        fn is_low(&mut self) -> Result<bool, Infallible> {
            Ok(!self.0)
        }
    }

    struct Console(Result<bool, embedded_io::ErrorKind>);

    impl embedded_io::ErrorType for Console {
        type Error = embedded_io::ErrorKind;
    }

    impl ReadReady for Console {
        fn read_ready(&mut self) -> Result<bool, Self::Error> {
            self.0
        }
    }

    fn at(ms: u32) -> Instant {
        Instant::from_ticks(ms as u64 * 1000)
    }

    #[test]
    fn debounce() {
        let mut input = DebouncedInput::new(Switch(false), true);
        assert!(!input.stop_requested(at(0)));

        // A short glitch is ignored.
        input.pin.0 = true;
        assert!(!input.stop_requested(at(10)));
        assert!(!input.stop_requested(at(12)));
        input.pin.0 = false;
        assert!(!input.stop_requested(at(13)));
        assert!(!input.stop_requested(at(30)));

        input.pin.0 = true;
        assert!(!input.stop_requested(at(40)));
        assert!(!input.stop_requested(at(44)));
        assert!(input.stop_requested(at(45)));
        assert!(input.stop_requested(at(46)));
    }

    #[test]
    fn active_low_switch() {
        let mut input = DebouncedInput::new(Switch(true), false);
        assert!(!input.stop_requested(at(0)));
        assert!(!input.stop_requested(at(100)));
        input.pin.0 = false;
        assert!(!input.stop_requested(at(101)));
        assert!(input.stop_requested(at(106)));
    }

    #[test]
    fn console() {
        let mut console = ConsoleStop::new(Console(Ok(false)));
        assert!(!console.stop_requested(at(0)));
        console.console.0 = Ok(true);
        assert!(console.stop_requested(at(0)));
        console.console.0 = Err(embedded_io::ErrorKind::Other);
        assert!(console.stop_requested(at(0)));
    }

    #[test]
    fn either() {
        let mut signal = (Never, DebouncedInput::new(Switch(true), true));
        assert!(!signal.stop_requested(at(0)));
        assert!(signal.stop_requested(at(5)));
        assert!(!Never.stop_requested(at(5)));
    }
}
