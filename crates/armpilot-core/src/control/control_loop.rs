//! Fixed-rate tick pacing
//!
//! The episode loop is synchronous and owns its own thread, so pacing is a
//! timer the loop consults each tick rather than a spawned callback loop:
//! measure elapsed work, sleep only the remainder, record overruns.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::{Error, Result};

/// Configuration for a control loop
#[derive(Debug, Clone)]
pub struct ControlLoopConfig {
    /// Target loop rate in Hz
    pub rate_hz: f64,
    /// Name for logging/debugging
    pub name: Arc<str>,
    /// Whether to warn on timing overruns
    pub warn_on_overrun: bool,
}

impl Default for ControlLoopConfig {
    fn default() -> Self {
        Self {
            rate_hz: 10.0,
            name: "control_loop".into(),
            warn_on_overrun: true,
        }
    }
}

impl ControlLoopConfig {
    /// Create a new config with the given rate
    pub fn new(rate_hz: f64) -> Self {
        Self {
            rate_hz,
            ..Default::default()
        }
    }

    /// Set the loop name
    pub fn with_name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = name.into();
        self
    }

    /// Enable or disable overrun warnings
    pub fn with_overrun_warning(mut self, warn: bool) -> Self {
        self.warn_on_overrun = warn;
        self
    }

    /// Get the target period
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate_hz)
    }

    /// Reject rates that cannot produce a period
    pub fn validate(&self) -> Result<()> {
        if !self.rate_hz.is_finite() || self.rate_hz <= 0.0 {
            return Err(Error::Config(format!(
                "{}: rate must be positive, got {}",
                self.name, self.rate_hz
            )));
        }
        Ok(())
    }
}

/// Statistics for a control loop
///
/// Tracks timing information using Welford's online algorithm for
/// numerically stable variance computation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlLoopStats {
    /// Number of loop iterations
    pub iterations: u64,
    /// Number of timing overruns
    pub overruns: u64,
    /// Total execution time
    pub total_execution_time: Duration,
    /// Maximum iteration time
    pub max_iteration_time: Duration,
    /// Minimum iteration time
    pub min_iteration_time: Duration,
    /// Average iteration time
    pub avg_iteration_time: Duration,
    /// Last iteration time
    pub last_iteration_time: Duration,
    welford_mean: f64,
    welford_m2: f64,
}

impl ControlLoopStats {
    pub fn update(&mut self, execution_time: Duration, target_period: Duration) {
        self.iterations += 1;
        self.total_execution_time += execution_time;
        self.last_iteration_time = execution_time;

        let time_secs = execution_time.as_secs_f64();

        if self.iterations == 1 {
            self.min_iteration_time = execution_time;
            self.max_iteration_time = execution_time;
            self.welford_mean = time_secs;
            self.welford_m2 = 0.0;
        } else {
            self.min_iteration_time = self.min_iteration_time.min(execution_time);
            self.max_iteration_time = self.max_iteration_time.max(execution_time);

            let delta = time_secs - self.welford_mean;
            self.welford_mean += delta / self.iterations as f64;
            let delta2 = time_secs - self.welford_mean;
            self.welford_m2 += delta * delta2;
        }

        self.avg_iteration_time = self.total_execution_time.div_f64(self.iterations as f64);

        if execution_time > target_period {
            self.overruns += 1;
        }
    }

    /// Get the overrun ratio (0.0 to 1.0)
    pub fn overrun_ratio(&self) -> f64 {
        if self.iterations == 0 {
            0.0
        } else {
            self.overruns as f64 / self.iterations as f64
        }
    }

    /// Get the timing range (max - min iteration time)
    pub fn timing_range(&self) -> Duration {
        self.max_iteration_time
            .saturating_sub(self.min_iteration_time)
    }

    /// Get timing jitter as standard deviation (in seconds)
    ///
    /// Returns 0.0 if fewer than 2 iterations have completed.
    pub fn jitter_std_dev(&self) -> f64 {
        if self.iterations < 2 {
            0.0
        } else {
            let variance = self.welford_m2 / (self.iterations - 1) as f64;
            variance.sqrt()
        }
    }

    /// Get timing jitter as standard deviation in Duration
    pub fn jitter_std_dev_duration(&self) -> Duration {
        Duration::from_secs_f64(self.jitter_std_dev())
    }
}

impl std::fmt::Display for ControlLoopStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ticks, {} overruns ({:.1}%), avg {:?}, max {:?}, jitter {:?}",
            self.iterations,
            self.overruns,
            self.overrun_ratio() * 100.0,
            self.avg_iteration_time,
            self.max_iteration_time,
            self.jitter_std_dev_duration()
        )
    }
}

/// Something that can block the control thread for a duration
///
/// Abstracted so loop-level tests can record requested sleeps instead of
/// waiting on the wall clock.
pub trait Sleeper: Send {
    fn sleep(&mut self, duration: Duration);
}

/// [`Sleeper`] backed by `std::thread::sleep`
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    #[inline]
    fn sleep(&mut self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Per-tick pacing for a synchronous control loop
///
/// Call [`TickTimer::start`] at the top of a tick and [`TickTimer::pace`]
/// after actuation. A tick that overruns its period is recorded and
/// followed immediately by the next one.
#[derive(Debug)]
pub struct TickTimer {
    config: ControlLoopConfig,
    period: Duration,
    started: Option<Instant>,
    stats: ControlLoopStats,
}

impl TickTimer {
    pub fn new(config: ControlLoopConfig) -> Self {
        let period = config.period();
        Self {
            config,
            period,
            started: None,
            stats: ControlLoopStats::default(),
        }
    }

    /// Mark the start of a tick
    #[inline]
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    /// Record a finished tick of `elapsed` work and return the sleep remainder
    ///
    /// The remainder is `max(0, period - elapsed)`.
    pub fn settle(&mut self, elapsed: Duration) -> Duration {
        self.stats.update(elapsed, self.period);
        match self.period.checked_sub(elapsed) {
            Some(remaining) => remaining,
            None => {
                if self.config.warn_on_overrun {
                    tracing::warn!(
                        "{}: loop overrun by {:?}",
                        self.config.name,
                        elapsed - self.period
                    );
                }
                Duration::ZERO
            }
        }
    }

    /// Finish the tick started by [`TickTimer::start`] and sleep out the period
    pub fn pace(&mut self, sleeper: &mut dyn Sleeper) -> Duration {
        let elapsed = self
            .started
            .take()
            .map(|t| t.elapsed())
            .unwrap_or_default();
        let remaining = self.settle(elapsed);
        if !remaining.is_zero() {
            sleeper.sleep(remaining);
        }
        remaining
    }

    #[inline]
    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn stats(&self) -> &ControlLoopStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = ControlLoopStats::default();
    }

    pub fn config(&self) -> &ControlLoopConfig {
        &self.config
    }
}
