//! Periodic tick execution on a background thread.

use std::{
    error::Error,
    fmt, io,
    panic::resume_unwind,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam::channel::{self, RecvTimeoutError, Sender};

/// The default classification period.
pub const DEFAULT_PERIOD: Duration = Duration::from_millis(4000);

/// What to do when a tick runs longer than the scheduling period.
///
/// Ticks never run concurrently: the tick closure has exclusive access to the scheduler state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum OverlapPolicy {
    /// Drop the ticks whose deadlines passed while the previous tick was running, and continue
    /// at the next deadline in the future.
    #[default]
    Skip,
    /// Run every missed tick, back to back, until the schedule has caught up.
    Queue,
}

impl OverlapPolicy {
    /// Computes the deadline of the tick after the one scheduled at `deadline`, given the current
    /// time `now`.
    fn next_deadline(self, deadline: Instant, now: Instant, period: Duration) -> (Instant, u32) {
        let next = deadline + period;
        match self {
            OverlapPolicy::Queue => (next, 0),
            OverlapPolicy::Skip if next >= now => (next, 0),
            OverlapPolicy::Skip => {
                let behind = now - next;
                let missed = (behind.as_nanos() / period.as_nanos()) as u32 + 1;
                (next + period * missed, missed)
            }
        }
    }
}

/// Information passed to every tick.
#[derive(Debug, Clone, Copy)]
pub struct Tick {
    index: u64,
    since_previous: Option<Duration>,
}

impl Tick {
    /// Number of ticks that ran before this one.
    #[inline]
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Time elapsed since the previous tick started, or [`None`] for the first tick.
    #[inline]
    pub fn since_previous(&self) -> Option<Duration> {
        self.since_previous
    }
}

/// A builder object that can be used to configure and spawn a [`SamplingScheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerBuilder {
    name: String,
    period: Duration,
    initial_delay: Duration,
    overlap: OverlapPolicy,
    stack_size: Option<usize>,
}

impl SchedulerBuilder {
    /// Sets the name of the scheduler thread.
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: name.into(),
            ..self
        }
    }

    /// Sets the time between two consecutive ticks.
    ///
    /// Defaults to [`DEFAULT_PERIOD`].
    ///
    /// # Panics
    ///
    /// Panics if `period` is zero.
    pub fn period(self, period: Duration) -> Self {
        assert!(!period.is_zero(), "scheduler period must not be zero");
        Self { period, ..self }
    }

    /// Sets the delay before the first tick. Defaults to zero.
    pub fn initial_delay(self, initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            ..self
        }
    }

    pub fn overlap(self, overlap: OverlapPolicy) -> Self {
        Self { overlap, ..self }
    }

    /// Sets the stack size of the scheduler thread, in bytes.
    ///
    /// By default, the platform's default stack size for new threads is used.
    pub fn stack_size(self, stack_size: usize) -> Self {
        Self {
            stack_size: Some(stack_size),
            ..self
        }
    }

    /// Spawns the scheduler thread.
    ///
    /// The thread takes ownership of `state` and calls `tick` with it periodically, until the
    /// scheduler is stopped. [`SamplingScheduler::stop`] hands `state` back.
    ///
    /// If the thread cannot be created, `state` is returned inside the [`SpawnError`].
    pub fn spawn<S, F>(self, state: S, mut tick: F) -> Result<SamplingScheduler<S>, SpawnError<S>>
    where
        S: Send + 'static,
        F: FnMut(&mut S, Tick) + Send + 'static,
    {
        let (stop, stop_recv) = channel::bounded::<()>(0);
        // The state is only handed over once the thread exists.
        let (state_send, state_recv) = channel::bounded::<S>(1);
        let Self {
            name,
            period,
            initial_delay,
            overlap,
            stack_size,
        } = self;

        let mut builder = thread::Builder::new().name(name.clone());
        if let Some(stack_size) = stack_size {
            builder = builder.stack_size(stack_size);
        }
        let spawned = builder.spawn(move || {
            let mut state = state_recv.recv().ok()?;
            log::debug!("scheduler '{name}' starting, period {period:?}");
            let mut deadline = Instant::now() + initial_delay;
            let mut previous: Option<Instant> = None;
            let mut index = 0;
            loop {
                match stop_recv.recv_deadline(deadline) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }

                let start = Instant::now();
                tick(
                    &mut state,
                    Tick {
                        index,
                        since_previous: previous.map(|p| start - p),
                    },
                );
                previous = Some(start);
                index += 1;

                let (next, missed) = overlap.next_deadline(deadline, Instant::now(), period);
                if missed > 0 {
                    log::warn!(
                        "scheduler '{name}': tick took {:?}, skipping {missed} tick(s)",
                        start.elapsed()
                    );
                }
                deadline = next;
            }
            log::debug!("scheduler '{name}' exiting after {index} tick(s)");
            Some(state)
        });

        match spawned {
            Ok(handle) => {
                // Cannot fail: the channel is empty and the thread keeps the receiver alive.
                state_send.try_send(state).ok();
                Ok(SamplingScheduler {
                    stop: Some(stop),
                    handle: Some(handle),
                })
            }
            Err(error) => Err(SpawnError { state, error }),
        }
    }
}

/// The error returned by [`SchedulerBuilder::spawn`] when the scheduler thread could not be
/// created.
pub struct SpawnError<S> {
    state: S,
    error: io::Error,
}

impl<S> SpawnError<S> {
    /// Returns the state that was passed to [`SchedulerBuilder::spawn`].
    pub fn into_state(self) -> S {
        self.state
    }

    /// Splits the error into the state and the underlying I/O error.
    pub fn into_parts(self) -> (S, io::Error) {
        (self.state, self.error)
    }

    pub fn io_error(&self) -> &io::Error {
        &self.error
    }
}

impl<S> fmt::Debug for SpawnError<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnError")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<S> fmt::Display for SpawnError<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to spawn scheduler thread: {}", self.error)
    }
}

impl<S> Error for SpawnError<S> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.error)
    }
}

/// Handle to a thread that periodically runs a tick closure on a state of type `S`.
///
/// When dropped, the scheduler is stopped and its thread joined. If a tick has panicked, the panic
/// will be forwarded to the thread dropping the scheduler.
pub struct SamplingScheduler<S: Send + 'static> {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<Option<S>>>,
}

impl SamplingScheduler<()> {
    /// Returns a builder that can be used to configure and spawn a [`SamplingScheduler`].
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder {
            name: "scheduler".into(),
            period: DEFAULT_PERIOD,
            initial_delay: Duration::ZERO,
            overlap: OverlapPolicy::default(),
            stack_size: None,
        }
    }
}

impl<S: Send + 'static> SamplingScheduler<S> {
    /// Returns whether the scheduler thread is still running.
    ///
    /// This returns `false` once a tick has panicked.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Stops the scheduler and returns its state.
    ///
    /// A tick that is currently running is allowed to finish first. No tick starts after this
    /// method returns.
    ///
    /// If a tick has panicked, this will propagate the panic to the calling thread.
    pub fn stop(mut self) -> S {
        match self.join() {
            Some(Ok(Some(state))) => state,
            Some(Err(payload)) => resume_unwind(payload),
            Some(Ok(None)) => unreachable!("scheduler state was never handed over"),
            None => unreachable!("scheduler thread was already joined"),
        }
    }

    fn join(&mut self) -> Option<thread::Result<Option<S>>> {
        // Closing the channel wakes up the thread.
        drop(self.stop.take());
        self.handle.take().map(JoinHandle::join)
    }
}

impl<S: Send + 'static> Drop for SamplingScheduler<S> {
    fn drop(&mut self) {
        if let Some(Err(payload)) = self.join() {
            if !thread::panicking() {
                resume_unwind(payload);
            }
        }
    }
}
