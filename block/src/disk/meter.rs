//! Event counters with exponentially-weighted moving average rates.
//!
//! Each [Meter] exports its lifetime count as a prometheus counter and additionally tracks
//! 1-, 5-, and 15-minute moving averages of its per-second rate (updated every 5 seconds, like a
//! load average). Time is supplied by the caller so that rates follow the runtime's clock.

use prometheus_client::metrics::counter::Counter;
use std::{
    sync::{Mutex, PoisonError},
    time::{Duration, SystemTime},
};

/// Interval at which moving averages are updated.
const TICK: Duration = Duration::from_secs(5);

/// After this many idle ticks, every average has decayed to (effectively) zero.
const MAX_TICKS: u128 = 8_192;

/// Snapshot of a [Meter].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MeterStatus {
    /// Events per second, averaged over the last minute.
    pub minutes1: f64,

    /// Events per second, averaged over the last 5 minutes.
    pub minutes5: f64,

    /// Events per second, averaged over the last 15 minutes.
    pub minutes15: f64,

    /// Total events.
    pub count: u64,
}

struct Ewma {
    alpha: f64,
    rate: f64,
    initialized: bool,
}

impl Ewma {
    fn new(minutes: f64) -> Self {
        Self {
            alpha: 1.0 - (-TICK.as_secs_f64() / 60.0 / minutes).exp(),
            rate: 0.0,
            initialized: false,
        }
    }

    fn tick(&mut self, count: u64) {
        let instant = count as f64 / TICK.as_secs_f64();
        if self.initialized {
            self.rate += self.alpha * (instant - self.rate);
        } else {
            self.rate = instant;
            self.initialized = true;
        }
    }
}

struct State {
    last: Option<SystemTime>,
    uncounted: u64,
    minutes1: Ewma,
    minutes5: Ewma,
    minutes15: Ewma,
}

impl State {
    fn advance(&mut self, now: SystemTime) {
        let Some(last) = self.last else {
            self.last = Some(now);
            return;
        };
        let elapsed = now.duration_since(last).unwrap_or_default();
        let ticks = elapsed.as_nanos() / TICK.as_nanos();
        if ticks == 0 {
            return;
        }
        for _ in 0..ticks.min(MAX_TICKS) {
            let count = std::mem::take(&mut self.uncounted);
            self.minutes1.tick(count);
            self.minutes5.tick(count);
            self.minutes15.tick(count);
        }
        self.last = Some(last + TICK * u32::try_from(ticks).unwrap_or(u32::MAX));
    }
}

/// Counts events and tracks their moving average rate.
pub struct Meter {
    counter: Counter,
    state: Mutex<State>,
}

impl Default for Meter {
    fn default() -> Self {
        Self {
            counter: Counter::default(),
            state: Mutex::new(State {
                last: None,
                uncounted: 0,
                minutes1: Ewma::new(1.0),
                minutes5: Ewma::new(5.0),
                minutes15: Ewma::new(15.0),
            }),
        }
    }
}

impl Meter {
    /// Record `n` events at `now`.
    pub fn mark(&self, n: u64, now: SystemTime) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.advance(now);
        state.uncounted += n;
        self.counter.inc_by(n);
    }

    /// Snapshot the meter at `now`.
    pub fn status(&self, now: SystemTime) -> MeterStatus {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.advance(now);
        MeterStatus {
            minutes1: state.minutes1.rate,
            minutes5: state.minutes5.rate,
            minutes15: state.minutes15.rate,
            count: self.counter.get(),
        }
    }

    /// The prometheus counter backing the meter.
    pub fn counter(&self) -> Counter {
        self.counter.clone()
    }
}
