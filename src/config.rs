//! Nucleus configuration
//!
//! Author: Moroya Sakamoto

use crate::clock::Ticks;
use crate::error::{Error, Result};
use crate::spinlock::MAX_CPUS;
use crate::thread::Priority;
use crate::timerq::QueueKind;

/// Default round-robin slice (ticks)
pub const DEFAULT_RR_QUANTUM: Ticks = 10;

/// Kernel configuration, fixed at init
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Number of CPUs (one scheduler each)
    pub cpus: usize,
    /// Master clock frequency; 0 selects the software clock (1 tick = 1 ns)
    pub clock_hz: u64,
    /// Lowest real-time priority
    pub min_priority: Priority,
    /// Highest real-time priority
    pub max_priority: Priority,
    /// Timer queue backing
    pub timer_queue: QueueKind,
    /// Default round-robin slice
    pub rr_quantum: Ticks,
    /// Smallest legal non-zero timer interval / thread period
    pub min_interval: Ticks,
    /// Runaway watchdog period; 0 disables the watchdog
    pub watchdog: Ticks,
}

impl Config {
    /// Configuration for `cpus` CPUs ticking at `clock_hz`
    pub const fn new(cpus: usize, clock_hz: u64) -> Self {
        Self {
            cpus,
            clock_hz,
            min_priority: Priority::MIN,
            max_priority: Priority::MAX,
            timer_queue: QueueKind::List,
            rr_quantum: DEFAULT_RR_QUANTUM,
            min_interval: 1,
            watchdog: 0,
        }
    }

    /// Single CPU, software clock
    pub const fn testing() -> Self {
        Self::new(1, 0)
    }

    /// Select the timer queue backing
    pub const fn with_timer_queue(mut self, kind: QueueKind) -> Self {
        self.timer_queue = kind;
        self
    }

    /// Set the real-time priority range
    pub const fn with_priorities(mut self, min: Priority, max: Priority) -> Self {
        self.min_priority = min;
        self.max_priority = max;
        self
    }

    /// Set the default round-robin slice
    pub const fn with_rr_quantum(mut self, quantum: Ticks) -> Self {
        self.rr_quantum = quantum;
        self
    }

    /// Set the smallest legal interval
    pub const fn with_min_interval(mut self, ticks: Ticks) -> Self {
        self.min_interval = ticks;
        self
    }

    /// Arm a per-CPU watchdog sampling every `period` ticks
    pub const fn with_watchdog(mut self, period: Ticks) -> Self {
        self.watchdog = period;
        self
    }

    /// Check every field
    pub fn validate(&self) -> Result<()> {
        if self.cpus == 0 || self.cpus > MAX_CPUS {
            return Err(Error::InvalidArgument("cpu count out of range"));
        }
        if self.min_priority > self.max_priority {
            return Err(Error::InvalidArgument("empty priority range"));
        }
        if self.min_priority <= Priority::IDLE {
            return Err(Error::InvalidArgument("priority range overlaps idle level"));
        }
        if self.rr_quantum == 0 {
            return Err(Error::InvalidArgument("round-robin quantum must be non-zero"));
        }
        if self.min_interval == 0 {
            return Err(Error::InvalidArgument("minimum interval must be non-zero"));
        }
        if self.watchdog != 0 && self.watchdog < self.min_interval {
            return Err(Error::InvalidArgument("watchdog period below minimum interval"));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::testing()
    }
}
