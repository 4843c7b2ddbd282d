//! Operator status indication.
use embedded_hal::{delay::DelayNs, digital::OutputPin};

/// On and off time of the fatal error blink.
pub const BLINK_MS: u32 = 200;

/// Session state shown to the operator.
pub trait Indicator {
    /// Show whether samples are being recorded.
    fn logging(&mut self, active: bool);

    /// Show that samples have been dropped. Cleared when the next session is armed.
    fn overrun(&mut self, active: bool);

    /// Show an unrecoverable condition.
    fn fatal(&mut self);
}

/// No indication.
impl Indicator for () {
    fn logging(&mut self, _active: bool) {}
    fn overrun(&mut self, _active: bool) {}
    fn fatal(&mut self) {}
}

/// A write LED and an error LED.
///
/// The error LED lights up on overruns. After a fatal error it blinks, see
/// [StatusLeds::blink_forever].
pub struct StatusLeds<W, E> {
    write: W,
    error: E,
    fatal: bool,
}

impl<W: OutputPin, E: OutputPin> StatusLeds<W, E> {
    pub fn new(mut write: W, mut error: E) -> Self {
        write.set_low().ok();
        error.set_low().ok();
        Self {
            write,
            error,
            fatal: false,
        }
    }

    /// Check if a fatal error was indicated.
    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    /// Run one blink cycle of the error LED.
    pub fn blink(&mut self, delay: &mut impl DelayNs) {
        self.error.set_high().ok();
        delay.delay_ms(BLINK_MS);
        self.error.set_low().ok();
        delay.delay_ms(BLINK_MS);
    }

    /// Blink the error LED until reset.
    pub fn blink_forever(mut self, mut delay: impl DelayNs) -> ! {
        self.write.set_low().ok();
        loop {
            self.blink(&mut delay);
        }
    }

    pub fn release(self) -> (W, E) {
        (self.write, self.error)
    }
}

impl<W: OutputPin, E: OutputPin> Indicator for StatusLeds<W, E> {
    fn logging(&mut self, active: bool) {
        self.write.set_state(active.into()).ok();
    }

    fn overrun(&mut self, active: bool) {
        if !self.fatal {
            self.error.set_state(active.into()).ok();
        }
    }

    fn fatal(&mut self) {
        self.fatal = true;
        self.write.set_low().ok();
        self.error.set_high().ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::Infallible;
    use std::{cell::RefCell, rc::Rc, vec::Vec};

    #[derive(Clone, Default)]
    struct Trace(Rc<RefCell<Vec<(&'static str, bool)>>>);

    struct Led(&'static str, Trace);

    impl embedded_hal::digital::ErrorType for Led {
        type Error = Infallible;
    }

    impl OutputPin for Led {
        fn set_low(&mut self) -> Result<(), Infallible> {
            self.1 .0.borrow_mut().push((self.0, false));
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Infallible> {
            self.1 .0.borrow_mut().push((self.0, true));
            Ok(())
        }
    }

    struct Delay(Trace);

    impl DelayNs for Delay {
        fn delay_ns(&mut self, _ns: u32) {
            unreachable!()
        }

        fn delay_ms(&mut self, ms: u32) {
            assert_eq!(ms, BLINK_MS);
            self.0 .0.borrow_mut().push(("delay", true));
        }
    }

    #[test]
    fn overrun_and_fatal() {
        let trace = Trace::default();
        let mut leds = StatusLeds::new(
            Led("write", trace.clone()),
            Led("error", trace.clone()),
        );
        trace.0.borrow_mut().clear();

        leds.logging(true);
        leds.overrun(true);
        leds.fatal();
        // The fatal indication is kept.
        leds.overrun(false);
        assert!(leds.is_fatal());

        leds.blink(&mut Delay(trace.clone()));

        assert_eq!(
            *trace.0.borrow(),
            [
                ("write", true),
                ("error", true),
                ("write", false),
                ("error", true),
                ("error", true),
                ("delay", true),
                ("error", false),
                ("delay", true),
            ]
        );
    }
}
