//! Performance measurement tools.

use std::{
    cell::Cell,
    fmt::{self, Arguments},
    time::{Duration, Instant},
};

/// A timer that can measure and average the time an operation takes.
///
/// Collected timings are averaged and reset when the timer is displayed using `{}`
/// ([`std::fmt::Display`]).
#[derive(Debug)]
pub struct Timer {
    name: &'static str,
    count: Cell<u32>,
    total: Cell<Duration>,
    max: Cell<Duration>,
}

impl Timer {
    /// Creates a new timer.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            count: Cell::new(0),
            total: Cell::new(Duration::ZERO),
            max: Cell::new(Duration::ZERO),
        }
    }

    /// Invokes a closure, measuring and recording the time it takes.
    pub fn time<T>(&mut self, timee: impl FnOnce() -> T) -> T {
        let _guard = self.start();
        timee()
    }

    /// Starts timing an operation using a drop guard.
    ///
    /// When the returned [`TimerGuard`] is dropped, the time between the call to `start` and the
    /// drop is measured and recorded.
    pub fn start(&mut self) -> TimerGuard<'_> {
        TimerGuard {
            start: Instant::now(),
            timer: self,
        }
    }

    /// Returns the number of operations recorded since the timer was last displayed.
    pub fn count(&self) -> u32 {
        self.count.get()
    }

    fn stop(&mut self, start: Instant) {
        let duration = start.elapsed();
        self.count.set(self.count.get().saturating_add(1));
        self.total.set(self.total.get() + duration);
        if duration > self.max.get() {
            self.max.set(duration);
        }
    }
}

/// Displays the average and maximum recorded time and resets them.
impl fmt::Display for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.count.replace(0);
        let total = self.total.replace(Duration::ZERO);
        let max = self.max.replace(Duration::ZERO);
        let avg_ms = if count == 0 {
            0.0
        } else {
            total.as_secs_f32() * 1000.0 / count as f32
        };
        let max_ms = max.as_secs_f32() * 1000.0;

        write!(f, "{}: {count}x{avg_ms:.01}ms (max {max_ms:.01}ms)", self.name)
    }
}

/// Guard returned by [`Timer::start`]. Stops timing the operation when dropped.
pub struct TimerGuard<'a> {
    start: Instant,
    timer: &'a mut Timer,
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        self.timer.stop(self.start);
    }
}

/// Logs frames per second with optional extra data.
#[derive(Debug)]
pub struct FpsCounter {
    name: String,
    frames: u32,
    start: Instant,
}

impl FpsCounter {
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            frames: 0,
            start: Instant::now(),
        }
    }

    /// Advances the frame counter by 1 and logs FPS if one second has passed.
    pub fn tick(&mut self) {
        self.tick_impl(format_args!(""));
    }

    /// Advances the frame counter by 1 and logs FPS and `extra` data if one second has passed.
    pub fn tick_with<D: fmt::Display>(&mut self, extra: D) {
        self.tick_impl(format_args!(" ({extra})"));
    }

    fn tick_impl(&mut self, args: Arguments<'_>) {
        self.frames += 1;
        if self.start.elapsed() > Duration::from_secs(1) {
            log::debug!("{}: {} FPS{}", self.name, self.frames, args);

            self.frames = 0;
            self.start = Instant::now();
        }
    }
}
