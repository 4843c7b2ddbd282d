//! Sample tick deadline supervision.
//!
//! The timer handler marks every tick as pending. The conversion handler acknowledges the tick
//! once the last channel of the tick has been converted. A tick that is still pending when the
//! timer fires again was serviced late, which latches the missed flag until the next session.
use core::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct TimingSupervisor {
    pending: AtomicBool,
    missed: AtomicBool,
}

impl TimingSupervisor {
    pub const fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            missed: AtomicBool::new(false),
        }
    }

    /// Clear all state before sampling starts.
    pub fn reset(&self) {
        self.pending.store(false, Ordering::Relaxed);
        self.missed.store(false, Ordering::Release);
    }

    /// Called from the sample timer handler on every tick.
    #[inline]
    pub fn on_timer(&self) {
        // The timer handler does not preempt itself, so load and store do not race.
        if self.pending.load(Ordering::Acquire) {
            self.missed.store(true, Ordering::Release);
        }
        self.pending.store(true, Ordering::Release);
    }

    /// Called from the conversion handler when the work of a tick is done.
    #[inline]
    pub fn acknowledge(&self) {
        self.pending.store(false, Ordering::Release);
    }

    /// Check if a tick deadline was missed.
    pub fn missed(&self) -> bool {
        self.missed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acknowledged_ticks() {
        let supervisor = TimingSupervisor::new();
        for _ in 0..10 {
            supervisor.on_timer();
            supervisor.acknowledge();
        }
        assert!(!supervisor.missed());
    }

    #[test]
    fn late_tick_latches() {
        let supervisor = TimingSupervisor::new();
        supervisor.on_timer();
        supervisor.on_timer();
        assert!(supervisor.missed());

        supervisor.acknowledge();
        supervisor.on_timer();
        assert!(supervisor.missed());

        supervisor.reset();
        assert!(!supervisor.missed());
    }
}
