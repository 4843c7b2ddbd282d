//! Fixed-rate analog acquisition streamed to raw block storage.
//!
//! A sample timer triggers a round of conversions over all configured channels on every tick.
//! The conversion handler ([Converter]) fills fixed-size [Block]s from a preallocated pool and
//! hands completed blocks to the main loop through a pair of lock-free queues ([QueuePair]). The
//! main loop ([Session]) writes them in order into a pre-erased contiguous region of a
//! [BlockDevice]. The first block of every recording describes the session, see [volta_stream].
#![cfg_attr(not(test), no_std)]

mod block;
pub mod converter;
pub mod indicator;
pub mod queue;
pub mod sampling_clock;
pub mod session;
pub mod settings;
pub mod stop;
pub mod storage;
mod supervisor;

pub use block::Block;
pub use converter::{Converter, Sampler};
pub use indicator::{Indicator, StatusLeds};
pub use queue::{QueueError, QueuePair};
pub use sampling_clock::{SampleTrigger, TimingPlan};
pub use session::{Session, SessionStats, State, Status};
pub use settings::{Platform, Settings};
pub use stop::StopSignal;
pub use storage::{BlockDevice, MemoryDevice, Monotonic, StorageSink};
pub use supervisor::TimingSupervisor;

pub use volta_stream;

/// A point in time on the 1 MHz session time base.
pub type Instant = fugit::TimerInstantU64<1_000_000>;
