//! Idle strategies for duty-cycle loops: publishers retrying a backpressured
//! offer and the term cleaner between passes.

use std::thread;
use std::time::Duration;

/// Called after every unit of work with the amount of work done.
pub trait IdleStrategy: Send {
    /// Idles if `work_count` is zero; resets any escalation otherwise.
    fn idle(&mut self, work_count: usize);

    fn reset(&mut self);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BusySpinIdleStrategy;

impl IdleStrategy for BusySpinIdleStrategy {
    #[inline]
    fn idle(&mut self, work_count: usize) {
        if work_count == 0 {
            std::hint::spin_loop();
        }
    }

    fn reset(&mut self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct YieldingIdleStrategy;

impl IdleStrategy for YieldingIdleStrategy {
    #[inline]
    fn idle(&mut self, work_count: usize) {
        if work_count == 0 {
            thread::yield_now();
        }
    }

    fn reset(&mut self) {}
}

#[derive(Debug, Clone, Copy)]
pub struct SleepingIdleStrategy {
    period: Duration,
}

impl SleepingIdleStrategy {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl IdleStrategy for SleepingIdleStrategy {
    fn idle(&mut self, work_count: usize) {
        if work_count == 0 {
            thread::sleep(self.period);
        }
    }

    fn reset(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackoffState {
    Spinning,
    Yielding,
    Parking,
}

/// Spins, then yields, then parks with a doubling timeout up to `max_park`.
#[derive(Debug, Clone)]
pub struct BackoffIdleStrategy {
    max_spins: u64,
    max_yields: u64,
    min_park: Duration,
    max_park: Duration,
    state: BackoffState,
    spins: u64,
    yields: u64,
    park: Duration,
}

impl BackoffIdleStrategy {
    pub fn new(max_spins: u64, max_yields: u64, min_park: Duration, max_park: Duration) -> Self {
        let max_park = max_park.max(min_park);
        Self {
            max_spins,
            max_yields,
            min_park,
            max_park,
            state: BackoffState::Spinning,
            spins: 0,
            yields: 0,
            park: min_park,
        }
    }

    /// Current park timeout; the next park in the parking phase waits this long.
    pub fn park_period(&self) -> Duration {
        self.park
    }

    fn step(&mut self) -> Option<Duration> {
        match self.state {
            BackoffState::Spinning => {
                self.spins += 1;
                if self.spins > self.max_spins {
                    self.state = BackoffState::Yielding;
                }
                std::hint::spin_loop();
                None
            }
            BackoffState::Yielding => {
                self.yields += 1;
                if self.yields > self.max_yields {
                    self.state = BackoffState::Parking;
                    self.park = self.min_park;
                }
                thread::yield_now();
                None
            }
            BackoffState::Parking => {
                let park = self.park;
                self.park = (self.park * 2).min(self.max_park);
                Some(park)
            }
        }
    }
}

impl Default for BackoffIdleStrategy {
    fn default() -> Self {
        Self::new(10, 5, Duration::from_micros(1), Duration::from_millis(1))
    }
}

impl IdleStrategy for BackoffIdleStrategy {
    fn idle(&mut self, work_count: usize) {
        if work_count > 0 {
            self.reset();
            return;
        }
        if let Some(park) = self.step() {
            thread::park_timeout(park);
        }
    }

    fn reset(&mut self) {
        self.state = BackoffState::Spinning;
        self.spins = 0;
        self.yields = 0;
        self.park = self.min_park;
    }
}
