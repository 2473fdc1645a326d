//! Clock / timebase — monotonic tick source and conversions
//!
//! The master clock counts raw hardware ticks. Tick↔nanosecond
//! conversion uses fixed-point scale/shift factors computed once at
//! setup, so the hot path never divides. Derived periodic time bases
//! express the same timeline in coarser jiffies.
//!
//! The wall clock is the monotonic count plus an offset that
//! [`Clock::adjust`] shifts; the kernel applies adjustments under the
//! nucleus lock and re-keys realtime timers in the same step.
//!
//! Author: Moroya Sakamoto

use alloc::vec::Vec;
use heapless::String;

use crate::error::{Error, Result};

/// Raw clock ticks
pub type Ticks = u64;

/// Nanoseconds
pub type Nanos = u64;

const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Fixed-point shift used by every conversion factor
const SCALE_SHIFT: u32 = 32;

/// Fixed-point multiplier: `out = (in * mult) >> SCALE_SHIFT`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scale {
    mult: u64,
}

impl Scale {
    /// Factor converting units of `from` Hz into units of `to` Hz
    pub const fn new(from_hz: u64, to_hz: u64) -> Self {
        Self {
            mult: (((to_hz as u128) << SCALE_SHIFT) / from_hz as u128) as u64,
        }
    }

    /// Apply the factor
    #[inline]
    pub const fn apply(&self, value: u64) -> u64 {
        ((value as u128 * self.mult as u128) >> SCALE_SHIFT) as u64
    }
}

/// Derived periodic time base
#[derive(Debug, Clone)]
pub struct TimeBase {
    name: String<16>,
    period_ns: Nanos,
    ns_to_jiffies: Scale,
}

impl TimeBase {
    /// Base name
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Duration of one jiffy in nanoseconds
    pub fn period_ns(&self) -> Nanos {
        self.period_ns
    }

    /// Jiffies → nanoseconds
    pub fn jiffies_to_ns(&self, jiffies: u64) -> Nanos {
        jiffies.saturating_mul(self.period_ns)
    }

    /// Nanoseconds → whole jiffies
    pub fn ns_to_jiffies(&self, ns: Nanos) -> u64 {
        self.ns_to_jiffies.apply(ns)
    }
}

/// Identifier of a derived time base
pub type BaseId = usize;

/// Master monotonic clock
pub struct Clock {
    /// Current raw tick count
    raw: Ticks,
    /// Tick frequency
    freq_hz: u64,
    ticks_to_ns: Scale,
    ns_to_ticks: Scale,
    /// (wall clock - monotonic) in ticks
    wallclock_offset: i64,
    /// Rejected backwards updates
    skews: u32,
    bases: Vec<TimeBase>,
}

impl Clock {
    /// Clock ticking at `freq_hz`
    pub fn new(freq_hz: u64) -> Result<Self> {
        if freq_hz == 0 {
            return Err(Error::InvalidArgument("clock frequency must be non-zero"));
        }
        Ok(Self {
            raw: 0,
            freq_hz,
            ticks_to_ns: Scale::new(freq_hz, NSEC_PER_SEC),
            ns_to_ticks: Scale::new(NSEC_PER_SEC, freq_hz),
            wallclock_offset: 0,
            skews: 0,
            bases: Vec::new(),
        })
    }

    /// Software clock for testing: one tick per nanosecond
    pub fn software() -> Self {
        Self {
            raw: 0,
            freq_hz: NSEC_PER_SEC,
            ticks_to_ns: Scale::new(NSEC_PER_SEC, NSEC_PER_SEC),
            ns_to_ticks: Scale::new(NSEC_PER_SEC, NSEC_PER_SEC),
            wallclock_offset: 0,
            skews: 0,
            bases: Vec::new(),
        }
    }

    /// Current raw tick count
    #[inline]
    pub fn read_raw(&self) -> Ticks {
        self.raw
    }

    /// Latch a hardware reading; backwards readings are ignored
    ///
    /// Returns false when the reading was rejected.
    pub fn set_raw(&mut self, now: Ticks) -> bool {
        if now < self.raw {
            self.skews += 1;
            return false;
        }
        self.raw = now;
        true
    }

    /// Advance by `delta` ticks
    pub fn advance(&mut self, delta: Ticks) {
        self.raw = self.raw.saturating_add(delta);
    }

    /// Tick frequency
    pub fn freq_hz(&self) -> u64 {
        self.freq_hz
    }

    /// Ticks → nanoseconds
    #[inline]
    pub fn ticks_to_ns(&self, ticks: Ticks) -> Nanos {
        self.ticks_to_ns.apply(ticks)
    }

    /// Nanoseconds → ticks
    #[inline]
    pub fn ns_to_ticks(&self, ns: Nanos) -> Ticks {
        self.ns_to_ticks.apply(ns)
    }

    /// Monotonic time in nanoseconds
    pub fn now_ns(&self) -> Nanos {
        self.ticks_to_ns(self.raw)
    }

    /// Wall clock in ticks
    pub fn wallclock(&self) -> Ticks {
        self.to_wallclock(self.raw)
    }

    /// Wall clock in nanoseconds
    pub fn wallclock_ns(&self) -> Nanos {
        self.ticks_to_ns(self.wallclock())
    }

    /// Monotonic date → wall clock date
    pub fn to_wallclock(&self, raw: Ticks) -> Ticks {
        raw.saturating_add_signed(self.wallclock_offset)
    }

    /// Wall clock date → monotonic date
    pub fn from_wallclock(&self, wall: Ticks) -> Ticks {
        wall.saturating_add_signed(self.wallclock_offset.saturating_neg())
    }

    /// Shift the wall clock by `delta` ticks
    pub fn adjust(&mut self, delta: i64) {
        self.wallclock_offset = self.wallclock_offset.saturating_add(delta);
    }

    /// Set the wall clock so that it currently reads `wall`
    pub fn set_wallclock(&mut self, wall: Ticks) {
        self.wallclock_offset = (wall as i128 - self.raw as i128)
            .clamp(i64::MIN as i128, i64::MAX as i128) as i64;
    }

    /// Current wall clock offset in ticks
    pub fn wallclock_offset(&self) -> i64 {
        self.wallclock_offset
    }

    /// Number of rejected backwards readings
    pub fn skews(&self) -> u32 {
        self.skews
    }

    /// Register a derived periodic base ticking every `period_ns`
    pub fn add_base(&mut self, name: &str, period_ns: Nanos) -> Result<BaseId> {
        if period_ns == 0 {
            return Err(Error::InvalidArgument("time base period must be non-zero"));
        }
        let mut n = String::new();
        for c in name.chars() {
            if n.push(c).is_err() {
                break;
            }
        }
        let hz = (NSEC_PER_SEC / period_ns).max(1);
        self.bases.push(TimeBase {
            name: n,
            period_ns,
            ns_to_jiffies: Scale::new(NSEC_PER_SEC, hz),
        });
        Ok(self.bases.len() - 1)
    }

    /// Derived base by id
    pub fn base(&self, id: BaseId) -> Option<&TimeBase> {
        self.bases.get(id)
    }

    /// Jiffies elapsed on a derived base
    pub fn base_jiffies(&self, id: BaseId) -> Option<u64> {
        self.bases.get(id).map(|b| b.ns_to_jiffies(self.now_ns()))
    }

    /// Derived base jiffies → master ticks
    pub fn jiffies_to_ticks(&self, id: BaseId, jiffies: u64) -> Option<Ticks> {
        self.bases
            .get(id)
            .map(|b| self.ns_to_ticks(b.jiffies_to_ns(jiffies)))
    }
}
