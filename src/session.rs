//! Acquisition session control.
//!
//! # Design
//! A session walks through `Idle -> Armed -> Running -> Stopping -> Done`. Every error moves it to
//! [State::Fatal], which stops sampling and shows the fatal indication. A fatal session is never
//! resumed.
//!
//! * **Arming** validates the settings, plans the sample clock, reserves and erases the storage
//!   region, writes the metadata block and primes the block queues. It hands back the
//!   [Converter] that the conversion interrupt drives.
//! * **Running** is driven by repeated calls to [Session::poll] from the main loop. Each call stores
//!   at most one full block and checks the tick supervisor and the stop signal.
//! * **Stopping** disables the sample trigger, hands over the complete ticks of the live block,
//!   stores the remaining blocks and truncates the recording.
use core::fmt::Debug;

use fugit::MicrosDurationU64;
use heapless::Vec;
use log::{debug, error, info, warn};
use volta_stream::Metadata;

use crate::{
    queue::{QueueError, StorageQueues},
    settings::{self, Settings},
    storage::{self, BlockDevice, Monotonic, StorageSink},
    Block, Converter, Indicator, Instant, QueuePair, SampleTrigger, Sampler,
    StopSignal, TimingPlan, TimingSupervisor,
};

/// The session state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Idle,
    Armed,
    Running,
    Stopping,
    Done,
    Fatal,
}

/// The outcome of a [Session::poll].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    /// Keep polling.
    Streaming,
    /// The operator asked to stop. Call [Session::stop].
    StopRequested,
    /// The reservation is full and sampling has been disabled. Call [Session::stop].
    Full,
}

/// Represents the errors that end a session.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error<E: Debug> {
    #[error("Invalid settings: {0}")]
    Config(#[from] settings::Error),
    #[error("Invalid block pool: {0}")]
    Queue(#[from] QueueError),
    #[error("Metadata encoding failed: {0}")]
    Format(#[from] volta_stream::Error),
    #[error("Storage failed: {0}")]
    Storage(storage::Error<E>),
    #[error("Missed a sample tick, rate too high")]
    MissedTick,
    #[error("Not possible in state {0:?}")]
    State(State),
}

impl<E: Debug> From<storage::Error<E>> for Error<E> {
    fn from(error: storage::Error<E>) -> Self {
        Self::Storage(error)
    }
}

/// Statistics of a recording.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SessionStats {
    /// Blocks in the recording, including the metadata block.
    pub blocks: u32,
    /// Samples stored, all channels.
    pub samples: u64,
    pub channels: usize,
    /// Sample ticks dropped because no empty block was available.
    pub overruns: u32,
    /// The longest block write.
    pub max_latency: MicrosDurationU64,
    /// Time from the start of sampling to the last block write.
    pub elapsed: MicrosDurationU64,
}

impl SessionStats {
    pub const fn new(channels: usize) -> Self {
        Self {
            blocks: 0,
            samples: 0,
            channels,
            overruns: 0,
            max_latency: MicrosDurationU64::from_ticks(0),
            elapsed: MicrosDurationU64::from_ticks(0),
        }
    }

    /// Sample ticks stored.
    pub fn ticks(&self) -> u64 {
        self.samples / self.channels.max(1) as u64
    }

    /// The sample tick rate realized over the recording.
    pub fn sample_rate(&self) -> f32 {
        match self.elapsed.ticks() {
            0 => 0.0,
            elapsed => self.ticks() as f32 * 1e6 / elapsed as f32,
        }
    }
}

/// A single recording.
///
/// # Args
/// * `D` - The storage medium.
/// * `C` - The time base.
/// * `T` - The sample timer.
/// * `I` - The operator indication.
/// * `Q` - The block queue dimension, see [QueuePair].
pub struct Session<'q, 'a, D, C, T, I, const Q: usize> {
    settings: Settings,
    plan: Option<TimingPlan>,
    sink: StorageSink<D, C>,
    trigger: T,
    indicator: I,
    state: State,
    queues: Option<StorageQueues<'q, 'a, Q>>,
    supervisor: Option<&'q TimingSupervisor>,
    stats: SessionStats,
    started: Option<Instant>,
    last_write: Option<Instant>,
}

impl<'q, 'a, D, C, T, I, const Q: usize> Session<'q, 'a, D, C, T, I, Q>
where
    D: BlockDevice,
    C: Monotonic,
    T: SampleTrigger,
    I: Indicator,
{
    pub fn new(
        settings: Settings,
        device: D,
        clock: C,
        trigger: T,
        indicator: I,
    ) -> Self {
        let channels = settings.channels.len();
        Self {
            settings,
            plan: None,
            sink: StorageSink::new(device, clock),
            trigger,
            indicator,
            state: State::Idle,
            queues: None,
            supervisor: None,
            stats: SessionStats::new(channels),
            started: None,
            last_write: None,
        }
    }

    /// Prepare the recording.
    ///
    /// # Args
    /// * `pool` - The session blocks. The first one carries the metadata block.
    /// * `queues` - Storage for the block queues. Its dimension must exceed the pool size.
    /// * `supervisor` - The tick supervisor driven by the sample timer interrupt.
    /// * `sampler` - The ADC.
    ///
    /// # Returns
    /// The conversion handler to be driven from the conversion complete interrupt.
    pub fn arm<S: Sampler>(
        &mut self,
        pool: &'a mut [Block],
        queues: &'q mut QueuePair<'a, Q>,
        supervisor: &'q TimingSupervisor,
        sampler: S,
    ) -> Result<Converter<'q, 'a, S, Q>, Error<D::Error>> {
        self.expect(State::Idle)?;
        self.try_arm(pool, queues, supervisor, sampler)
            .map_err(|e| self.fail(e))
    }

    fn try_arm<S: Sampler>(
        &mut self,
        pool: &'a mut [Block],
        queues: &'q mut QueuePair<'a, Q>,
        supervisor: &'q TimingSupervisor,
        sampler: S,
    ) -> Result<Converter<'q, 'a, S, Q>, Error<D::Error>> {
        let plan = TimingPlan::new(&self.settings)?;
        let width = self.settings.width();

        for channel in self.settings.channels.iter() {
            info!("Sample pin: {} ({:?})", channel.pin, channel.reference);
        }
        info!("ADC bits: {}", u8::from(width));
        info!("ADC clock kHz: {}", plan.conversion_hz.to_kHz());
        info!("Sample rate: {}", plan.sample_rate());
        info!("Sample interval usec: {}", plan.interval_us());

        queues.check(pool.len())?;

        self.indicator.overrun(false);
        self.sink.open(self.settings.max_blocks)?;

        let metadata = Metadata {
            cpu_hz: plan.cpu_hz.raw(),
            conversion_hz: plan.conversion_hz.raw(),
            sample_interval: plan.interval_cycles,
            sample_rate: self.settings.sample_rate,
            width,
            channels: Vec::from_slice(&self.settings.channels)
                .map_err(|_| volta_stream::Error::TooManyChannels)?,
        };
        metadata.encode(pool[0].bytes_mut())?;
        self.sink.write_block(pool[0].as_bytes())?;

        let (acquisition, storage) = queues.split(pool)?;
        self.queues = Some(storage);
        self.supervisor = Some(supervisor);
        self.plan = Some(plan);

        self.transition(State::Armed);
        Ok(Converter::new(
            sampler,
            acquisition,
            supervisor,
            &self.settings.channels,
            width,
            self.settings.platform.adc_bits,
        ))
    }

    /// Start sampling.
    pub fn start(&mut self) -> Result<(), Error<D::Error>> {
        self.expect(State::Armed)?;
        let (Some(plan), Some(supervisor)) = (self.plan, self.supervisor) else {
            return Err(self.fail(Error::State(State::Armed)));
        };

        supervisor.reset();
        self.stats = SessionStats::new(self.settings.channels.len());
        self.started = Some(self.sink.now());
        self.last_write = None;

        self.trigger.enable(&plan);
        self.indicator.logging(true);
        self.transition(State::Running);
        info!("Logging");
        Ok(())
    }

    /// Service the running recording.
    ///
    /// # Args
    /// * `stop` - The operator stop signal.
    pub fn poll(
        &mut self,
        stop: &mut impl StopSignal,
    ) -> Result<Status, Error<D::Error>> {
        self.expect(State::Running)?;

        if let Err(e) = self.store_next() {
            return Err(self.fail(e));
        }

        if self.supervisor.is_some_and(|supervisor| supervisor.missed()) {
            return Err(self.fail(Error::MissedTick));
        }

        if self.sink.remaining().is_ok_and(|blocks| blocks == 0) {
            self.trigger.disable();
            self.transition(State::Stopping);
            return Ok(Status::Full);
        }

        if stop.stop_requested(self.sink.now()) {
            return Ok(Status::StopRequested);
        }

        Ok(Status::Streaming)
    }

    /// End the recording.
    ///
    /// # Args
    /// * `converter` - The conversion handler returned by [Session::arm].
    ///
    /// # Returns
    /// The recording statistics.
    pub fn stop<S: Sampler>(
        &mut self,
        converter: &mut Converter<'q, 'a, S, Q>,
    ) -> Result<SessionStats, Error<D::Error>> {
        match self.state {
            State::Running | State::Stopping => {}
            state => return Err(Error::State(state)),
        }

        self.trigger.disable();
        self.indicator.logging(false);
        if self.state == State::Running {
            self.transition(State::Stopping);
        }

        let live = converter.live_len();
        let flushed = converter.flush();
        if live > flushed {
            warn!("Dropping {} samples of an incomplete tick", live - flushed);
        }

        let pending = converter.pending_overruns();
        if pending > 0 {
            warn!("{pending} sample ticks dropped");
            self.stats.overruns =
                self.stats.overruns.saturating_add(pending.into());
            self.indicator.overrun(true);
        }

        match self.drain() {
            Ok(()) => {}
            Err(e) => return Err(self.fail(e)),
        }
        let blocks = match self.sink.close() {
            Ok(blocks) => blocks,
            Err(e) => return Err(self.fail(e.into())),
        };

        self.stats.blocks = blocks;
        self.stats.max_latency = self.sink.max_latency();
        if let (Some(start), Some(end)) = (self.started, self.last_write) {
            self.stats.elapsed = end
                .checked_duration_since(start)
                .unwrap_or(MicrosDurationU64::from_ticks(0));
        }

        let stats = self.stats;
        info!("Recording blocks: {}", stats.blocks);
        info!("Max block write usec: {}", stats.max_latency.ticks());
        info!("Record time sec: {}", stats.elapsed.to_millis() as f32 * 1e-3);
        info!("Sample count: {}", stats.ticks());
        info!("Samples/sec: {}", stats.sample_rate());
        info!("Overruns: {}", stats.overruns);

        self.transition(State::Done);
        Ok(stats)
    }

    // Store every remaining full block. Blocks beyond the reservation are dropped.
    fn drain(&mut self) -> Result<(), Error<D::Error>> {
        while self.sink.remaining()? > 0 {
            if !self.store_next()? {
                return Ok(());
            }
        }

        let mut dropped = 0;
        if let Some(queues) = self.queues.as_mut() {
            while let Some(block) = queues.next_full() {
                dropped += block.len();
                queues.recycle(block);
            }
        }
        if dropped > 0 {
            warn!("Reservation full, dropping {dropped} samples");
        }
        Ok(())
    }

    // Write the oldest full block, if any.
    fn store_next(&mut self) -> Result<bool, Error<D::Error>> {
        let Some(block) = self.queues.as_mut().and_then(|q| q.next_full())
        else {
            return Ok(false);
        };

        let result = self.sink.write_block(block.as_bytes());
        let (samples, overrun) = (block.len(), block.overrun());
        if let Some(queues) = self.queues.as_mut() {
            queues.recycle(block);
        }
        result?;

        self.last_write = Some(self.sink.now());
        self.stats.samples += samples as u64;
        if overrun > 0 {
            warn!("{overrun} sample ticks dropped");
            self.stats.overruns =
                self.stats.overruns.saturating_add(overrun.into());
            self.indicator.overrun(true);
        }
        Ok(true)
    }

    fn expect(&self, state: State) -> Result<(), Error<D::Error>> {
        if self.state == state {
            Ok(())
        } else {
            Err(Error::State(self.state))
        }
    }

    fn transition(&mut self, state: State) {
        debug!("Session {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    fn fail(&mut self, error: Error<D::Error>) -> Error<D::Error> {
        error!("Fatal: {error}");
        self.trigger.disable();
        self.indicator.fatal();
        self.transition(State::Fatal);
        error
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The sample clock plan once armed.
    pub fn plan(&self) -> Option<&TimingPlan> {
        self.plan.as_ref()
    }

    /// Statistics of the running recording.
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn trigger(&self) -> &T {
        &self.trigger
    }

    pub fn indicator(&self) -> &I {
        &self.indicator
    }

    pub fn indicator_mut(&mut self) -> &mut I {
        &mut self.indicator
    }

    pub fn release(self) -> (D, C, T, I) {
        let (device, clock) = self.sink.release();
        (device, clock, self.trigger, self.indicator)
    }
}
