//! Timer engine — one-shot and periodic timers on per-CPU queues
//!
//! A timer is armed on the queue of the CPU it belongs to. The tick
//! handler of that CPU fires every timer whose date has been reached, in
//! queue order. Periodic timers are reloaded after their handler runs;
//! when several periods elapsed at once the missed ones are skipped and
//! counted, never replayed.
//!
//! Author: Moroya Sakamoto

use alloc::boxed::Box;
use alloc::vec::Vec;
use bitflags::bitflags;

use crate::arena::Handle;
use crate::clock::Ticks;
use crate::error::{Error, Result};
use crate::kernel::Kernel;
use crate::spinlock::CpuId;
use crate::thread::ThreadId;
use crate::timerq::TimerKey;

/// Timer handle
pub type TimerId = Handle<Timer>;

/// Lowest timer priority
pub const TIMER_LOPRIO: i32 = -999_999_999;
/// Default timer priority
pub const TIMER_STDPRIO: i32 = 0;
/// Highest timer priority
pub const TIMER_HIPRIO: i32 = 999_999_999;

/// How the start value of a timer is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    /// Ticks from now
    Relative,
    /// Raw monotonic date
    Absolute,
    /// Wall clock date; follows clock adjustments
    Realtime,
}

bitflags! {
    /// Timer status bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TimerStatus: u32 {
        /// Not in any queue
        const DEQUEUED = 1 << 0;
        /// Reloads after each shot
        const PERIODIC = 1 << 1;
        /// Fired at least once since armed
        const FIRED = 1 << 2;
        /// Stopped; a pending reload is cancelled
        const KILLED = 1 << 3;
        /// Date tracks the wall clock
        const REALTIME = 1 << 4;
    }
}

/// User expiry handler
pub type TimerFn = Box<dyn FnMut(&mut Kernel, TimerId) + Send>;

/// What a shot does
pub(crate) enum TimerHandler {
    /// Timed wait of a thread elapsed
    Timeout(ThreadId),
    /// Release point of a periodic thread
    Period(ThreadId),
    /// Round-robin slice of a thread exhausted
    Slice(ThreadId),
    /// Runaway detection period of a CPU
    Watchdog(CpuId),
    /// User callback, taken out while it runs
    Callback(Option<TimerFn>),
}

/// Handler resolved before dispatch, so it can run with `&mut Kernel`
enum Expiry {
    Timeout(ThreadId),
    Period(ThreadId),
    Slice(ThreadId),
    Watchdog(CpuId),
    Callback(Option<TimerFn>),
}

/// Timer object
pub struct Timer {
    /// Expiry date (raw ticks), meaningful while queued
    pub(crate) date: Ticks,
    /// Wall clock expiry of a realtime timer
    pub(crate) wall_date: Ticks,
    /// Reload interval, 0 for one-shot
    pub(crate) interval: Ticks,
    pub(crate) prio: i32,
    pub(crate) status: TimerStatus,
    pub(crate) handler: TimerHandler,
    pub(crate) cpu: CpuId,
    pub(crate) shots: u64,
    pub(crate) missed: u64,
}

impl Timer {
    pub(crate) fn new(cpu: CpuId, handler: TimerHandler) -> Self {
        Self {
            date: 0,
            wall_date: 0,
            interval: 0,
            prio: TIMER_STDPRIO,
            status: TimerStatus::DEQUEUED,
            handler,
            cpu,
            shots: 0,
            missed: 0,
        }
    }

    /// Is the timer queued?
    pub fn is_running(&self) -> bool {
        !self.status.contains(TimerStatus::DEQUEUED)
    }

    /// Expiry date while queued
    pub fn date(&self) -> Option<Ticks> {
        self.is_running().then_some(self.date)
    }

    /// Reload interval (0 = one-shot)
    pub fn interval(&self) -> Ticks {
        self.interval
    }

    /// Tie-break priority
    pub fn priority(&self) -> i32 {
        self.prio
    }

    /// Status bits
    pub fn status(&self) -> TimerStatus {
        self.status
    }

    /// CPU whose queue holds the timer
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// Shots fired so far
    pub fn shots(&self) -> u64 {
        self.shots
    }

    /// Periods skipped because the timer fired late
    pub fn missed(&self) -> u64 {
        self.missed
    }

    /// Owned by the nucleus rather than created by a user?
    pub fn is_nucleus_timer(&self) -> bool {
        !matches!(self.handler, TimerHandler::Callback(_))
    }
}

impl Kernel {
    /// Create a stopped timer on `cpu`
    pub fn timer_create<F>(&mut self, cpu: CpuId, handler: F) -> Result<TimerId>
    where
        F: FnMut(&mut Kernel, TimerId) + Send + 'static,
    {
        self.check_cpu(cpu)?;
        let id = self
            .timers
            .insert(Timer::new(cpu, TimerHandler::Callback(Some(Box::new(handler)))));
        log::trace!("timer {:?} created on cpu {}", id, cpu);
        Ok(id)
    }

    /// Arm a timer
    ///
    /// `interval` 0 makes a one-shot timer. A date already reached fires
    /// on the next tick of the timer's CPU.
    pub fn timer_start(&mut self, id: TimerId, value: Ticks, interval: Ticks, mode: TimerMode) -> Result<()> {
        if interval != 0 && interval < self.config.min_interval {
            return Err(Error::InvalidArgument("interval below minimum"));
        }
        let t = self.timer_ref(id)?;
        if t.is_nucleus_timer() {
            return Err(Error::NotPermitted("nucleus timers are driven by the nucleus"));
        }
        let prio = t.prio;
        let now = self.clock.read_raw();
        let date = match mode {
            TimerMode::Relative => now.saturating_add(value),
            TimerMode::Absolute => value,
            TimerMode::Realtime => self.clock.from_wallclock(value),
        };
        self.arm_timer(id, date, interval, prio)?;
        if let Some(t) = self.timers.get_mut(id) {
            t.status.set(TimerStatus::REALTIME, mode == TimerMode::Realtime);
            t.wall_date = value;
        }
        Ok(())
    }

    /// Stop a timer; stopping a stopped timer is a no-op
    pub fn timer_stop(&mut self, id: TimerId) -> Result<()> {
        self.timer_ref(id)?;
        self.disarm_timer(id);
        Ok(())
    }

    /// Stop and free a user timer
    pub fn timer_destroy(&mut self, id: TimerId) -> Result<()> {
        if self.timer_ref(id)?.is_nucleus_timer() {
            return Err(Error::NotPermitted("nucleus timers are freed by the nucleus"));
        }
        self.disarm_timer(id);
        self.timers.remove(id);
        log::trace!("timer {:?} destroyed", id);
        Ok(())
    }

    /// Change the tie-break priority, re-keying a queued timer
    pub fn timer_set_priority(&mut self, id: TimerId, prio: i32) -> Result<()> {
        let t = self.timer_mut(id)?;
        t.prio = prio;
        if t.is_running() {
            let (date, interval) = (t.date, t.interval);
            self.arm_timer(id, date, interval, prio)?;
        }
        Ok(())
    }

    /// Expiry date, `None` when stopped
    pub fn timer_date(&self, id: TimerId) -> Result<Option<Ticks>> {
        self.timer_ref(id).map(Timer::date)
    }

    /// Ticks until expiry; an elapsed but unfired timer reports 1
    pub fn timer_timeout(&self, id: TimerId) -> Result<Option<Ticks>> {
        let now = self.clock.read_raw();
        Ok(self
            .timer_ref(id)?
            .date()
            .map(|date| if date > now { date - now } else { 1 }))
    }

    /// Reload interval
    pub fn timer_interval(&self, id: TimerId) -> Result<Ticks> {
        self.timer_ref(id).map(Timer::interval)
    }

    /// Is the timer queued? Stale handles report false.
    pub fn timer_is_running(&self, id: TimerId) -> bool {
        self.timers.get(id).is_some_and(Timer::is_running)
    }

    /// Timer object
    pub fn timer(&self, id: TimerId) -> Result<&Timer> {
        self.timer_ref(id)
    }

    /// Move a user timer to another CPU's queue, keeping its date
    pub fn timer_migrate(&mut self, id: TimerId, cpu: CpuId) -> Result<()> {
        self.check_cpu(cpu)?;
        if self.timer_ref(id)?.is_nucleus_timer() {
            return Err(Error::NotPermitted("nucleus timers cannot be moved by hand"));
        }
        self.migrate_timer_inner(id, cpu)
    }

    /// Queued timers of a CPU in firing order
    pub fn pending_timers(&self, cpu: CpuId) -> Vec<TimerKey> {
        self.scheds
            .get(cpu)
            .map(|s| s.timers.keys())
            .unwrap_or_default()
    }

    /// Shift the wall clock, re-keying realtime timers
    pub fn clock_adjust(&mut self, delta: i64) {
        self.clock.adjust(delta);
        self.rekey_realtime_timers();
        log::debug!(
            "wall clock adjusted by {}, offset now {}",
            delta,
            self.clock.wallclock_offset()
        );
    }

    /// Set the wall clock, re-keying realtime timers
    pub fn set_wallclock(&mut self, wall: Ticks) {
        self.clock.set_wallclock(wall);
        self.rekey_realtime_timers();
        log::debug!("wall clock set to {}", wall);
    }

    fn rekey_realtime_timers(&mut self) {
        let realtime: Vec<TimerId> = self
            .timers
            .iter()
            .filter(|(_, t)| t.is_running() && t.status.contains(TimerStatus::REALTIME))
            .map(|(id, _)| id)
            .collect();
        for id in realtime {
            let Some(t) = self.timers.get(id) else {
                continue;
            };
            let (date, interval, prio) = (self.clock.from_wallclock(t.wall_date), t.interval, t.prio);
            if self.arm_timer(id, date, interval, prio).is_err() {
                self.fatal(format_args!("cannot re-key realtime timer {:?}", id));
            }
        }
    }

    /// Queue a timer at `date`, replacing any previous arming
    pub(crate) fn arm_timer(&mut self, id: TimerId, date: Ticks, interval: Ticks, prio: i32) -> Result<()> {
        self.timer_seq += 1;
        let seq = self.timer_seq;
        let t = self.timers.get_mut(id).ok_or(Error::NoSuchTimer)?;
        let queue = &mut self.scheds[t.cpu].timers;
        if t.is_running() {
            queue.remove(id);
        }
        t.date = date;
        t.interval = interval;
        t.prio = prio;
        t.status.remove(TimerStatus::FIRED | TimerStatus::KILLED);
        t.status.set(TimerStatus::PERIODIC, interval > 0);
        if let Err(e) = queue.insert(TimerKey { date, prio, seq, id }) {
            t.status.insert(TimerStatus::DEQUEUED);
            return Err(e);
        }
        t.status.remove(TimerStatus::DEQUEUED);
        Ok(())
    }

    /// Dequeue a timer and cancel any pending reload
    pub(crate) fn disarm_timer(&mut self, id: TimerId) {
        let Some(t) = self.timers.get_mut(id) else {
            return;
        };
        if t.is_running() {
            self.scheds[t.cpu].timers.remove(id);
        }
        t.status.insert(TimerStatus::DEQUEUED | TimerStatus::KILLED);
    }

    pub(crate) fn migrate_timer_inner(&mut self, id: TimerId, cpu: CpuId) -> Result<()> {
        let t = self.timers.get_mut(id).ok_or(Error::NoSuchTimer)?;
        let from = t.cpu;
        if from == cpu {
            return Ok(());
        }
        if !t.is_running() {
            t.cpu = cpu;
            return Ok(());
        }
        let Some(key) = self.scheds[from].timers.remove(id) else {
            return Err(Error::Corrupted("running timer missing from its queue"));
        };
        if let Err(e) = self.scheds[cpu].timers.insert(key) {
            // Target full: leave the timer where it was
            self.scheds[from].timers.insert(key)?;
            return Err(e);
        }
        t.cpu = cpu;
        log::trace!("timer {:?} migrated cpu {} -> {}", id, from, cpu);
        Ok(())
    }

    /// Fire every timer of `cpu` whose date has been reached
    pub(crate) fn fire_timers(&mut self, cpu: CpuId) {
        let now = self.clock.read_raw();
        let mut fired = 0u32;
        loop {
            let key = match self.scheds[cpu].timers.head() {
                Some(key) if key.date <= now => *key,
                _ => break,
            };
            self.scheds[cpu].timers.pop();

            let (date, owner) = match self.timers.get(key.id) {
                Some(t) => (t.date, t.cpu),
                None => self.fatal(format_args!("dangling timer {:?} queued on cpu {}", key.id, cpu)),
            };
            if date != key.date || owner != cpu {
                self.fatal(format_args!(
                    "timer {:?} keyed at {} on cpu {} but dated {} on cpu {}",
                    key.id, key.date, cpu, date, owner
                ));
            }
            let Some(t) = self.timers.get_mut(key.id) else {
                continue;
            };
            t.status.insert(TimerStatus::DEQUEUED | TimerStatus::FIRED);
            t.shots += 1;
            let interval = t.interval;
            // Skip the periods that already elapsed
            let (next, missed) = if interval > 0 {
                let periods = (now - key.date) / interval + 1;
                (key.date + periods * interval, periods - 1)
            } else {
                (0, 0)
            };
            t.missed += missed;
            if missed > 0 {
                log::warn!("timer {:?} skipped {} periods", key.id, missed);
            }
            let expiry = match &mut t.handler {
                TimerHandler::Timeout(tid) => Expiry::Timeout(*tid),
                TimerHandler::Period(tid) => Expiry::Period(*tid),
                TimerHandler::Slice(tid) => Expiry::Slice(*tid),
                TimerHandler::Watchdog(wd_cpu) => Expiry::Watchdog(*wd_cpu),
                TimerHandler::Callback(f) => Expiry::Callback(f.take()),
            };
            self.timer_shots += 1;
            fired += 1;

            match expiry {
                Expiry::Timeout(tid) => self.on_wait_timeout(tid),
                Expiry::Period(tid) => self.on_period(tid, missed),
                Expiry::Slice(tid) => self.on_slice(tid),
                Expiry::Watchdog(wd_cpu) => self.on_watchdog(wd_cpu),
                Expiry::Callback(Some(mut f)) => {
                    f(self, key.id);
                    if let Some(t) = self.timers.get_mut(key.id) {
                        if let TimerHandler::Callback(slot @ None) = &mut t.handler {
                            *slot = Some(f);
                        }
                    }
                }
                Expiry::Callback(None) => {}
            }

            // Reload unless the handler stopped or re-armed the timer
            let Some(t) = self.timers.get(key.id) else {
                continue;
            };
            if interval > 0
                && t.interval == interval
                && t.status.contains(TimerStatus::DEQUEUED)
                && !t.status.contains(TimerStatus::KILLED)
            {
                let prio = t.prio;
                let realtime = t.status.contains(TimerStatus::REALTIME);
                let wall_date = t.wall_date + (next - key.date);
                if self.arm_timer(key.id, next, interval, prio).is_err() {
                    self.fatal(format_args!("cannot reload periodic timer {:?}", key.id));
                }
                if let Some(t) = self.timers.get_mut(key.id) {
                    t.status.set(TimerStatus::REALTIME, realtime);
                    t.status.insert(TimerStatus::FIRED);
                    t.wall_date = wall_date;
                }
            }
        }
        if fired > 0 && !self.scheds[cpu].timers.is_sorted() {
            self.fatal(format_args!("timer queue of cpu {} out of order", cpu));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::timerq::QueueKind;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicU64, Ordering};

    fn counter(k: &mut Kernel, cpu: CpuId) -> (TimerId, Arc<AtomicU64>) {
        let hits = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&hits);
        let id = k
            .timer_create(cpu, move |_, _| {
                seen.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        (id, hits)
    }

    #[test]
    fn test_one_shot_fires_once() {
        let mut k = Kernel::testing();
        let (id, hits) = counter(&mut k, 0);
        k.timer_start(id, 100, 0, TimerMode::Relative).unwrap();
        assert_eq!(k.timer_timeout(id), Ok(Some(100)));
        k.tick(0, 99);
        assert_eq!(hits.load(Ordering::Relaxed), 0);
        k.tick(0, 100);
        k.tick(0, 500);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert!(!k.timer_is_running(id));
        assert_eq!(k.timer_timeout(id), Ok(None));
    }

    #[test]
    fn test_elapsed_date_fires_next_tick() {
        let mut k = Kernel::testing();
        k.tick(0, 1_000);
        let (id, hits) = counter(&mut k, 0);
        k.timer_start(id, 10, 0, TimerMode::Absolute).unwrap();
        assert_eq!(k.timer_timeout(id), Ok(Some(1)));
        k.tick(0, 1_001);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_periodic_skips_missed_periods() {
        let mut k = Kernel::testing();
        let (id, hits) = counter(&mut k, 0);
        k.timer_start(id, 10, 10, TimerMode::Relative).unwrap();
        k.tick(0, 10);
        assert_eq!(k.timer_date(id), Ok(Some(20)));
        // Late tick: 20, 30 and 40 elapsed, one shot only
        k.tick(0, 45);
        assert_eq!(hits.load(Ordering::Relaxed), 2);
        assert_eq!(k.timer_date(id), Ok(Some(50)));
        assert_eq!(k.timer(id).unwrap().missed(), 2);
    }

    #[test]
    fn test_stop_from_handler_cancels_reload() {
        let mut k = Kernel::testing();
        let id = k.timer_create(0, |k, me| k.timer_stop(me).unwrap()).unwrap();
        k.timer_start(id, 5, 5, TimerMode::Relative).unwrap();
        k.tick(0, 5);
        assert!(!k.timer_is_running(id));
        assert_eq!(k.timer(id).unwrap().shots(), 1);
    }

    #[test]
    fn test_rearm_from_handler_wins_over_reload() {
        let mut k = Kernel::testing();
        let id = k
            .timer_create(0, |k, me| {
                k.timer_start(me, 100, 0, TimerMode::Relative).unwrap();
            })
            .unwrap();
        k.timer_start(id, 5, 5, TimerMode::Relative).unwrap();
        k.tick(0, 5);
        assert_eq!(k.timer_date(id), Ok(Some(105)));
        assert_eq!(k.timer_interval(id), Ok(0));
    }

    #[test]
    fn test_equal_dates_fire_by_priority() {
        let order = Arc::new(spin::Mutex::new(Vec::new()));
        let mut k = Kernel::testing();
        for prio in [5, 10] {
            let log = Arc::clone(&order);
            let id = k
                .timer_create(0, move |_, _| log.lock().push(prio))
                .unwrap();
            k.timer_set_priority(id, prio).unwrap();
            k.timer_start(id, 50, 0, TimerMode::Absolute).unwrap();
        }
        k.tick(0, 50);
        assert_eq!(*order.lock(), [10, 5]);
    }

    #[test]
    fn test_queue_stays_sorted() {
        for kind in [QueueKind::List, QueueKind::Heap] {
            let mut k = Kernel::new(Config::testing().with_timer_queue(kind)).unwrap();
            let mut ids = Vec::new();
            for v in [40u64, 10, 30, 20, 50] {
                let (id, _) = counter(&mut k, 0);
                k.timer_start(id, v, 0, TimerMode::Relative).unwrap();
                ids.push(id);
            }
            k.timer_stop(ids[2]).unwrap();
            k.timer_start(ids[0], 5, 0, TimerMode::Relative).unwrap();
            let dates: Vec<Ticks> = k.pending_timers(0).iter().map(|key| key.date).collect();
            assert_eq!(dates, [5, 10, 20, 50]);
        }
    }

    #[test]
    fn test_interval_validation() {
        let mut k = Kernel::new(Config::testing().with_min_interval(10)).unwrap();
        let (id, _) = counter(&mut k, 0);
        assert!(matches!(
            k.timer_start(id, 0, 3, TimerMode::Relative),
            Err(Error::InvalidArgument(_))
        ));
        assert!(k.timer_start(id, 0, 10, TimerMode::Relative).is_ok());
    }

    #[test]
    fn test_realtime_timer_follows_adjustment() {
        let mut k = Kernel::testing();
        let (id, hits) = counter(&mut k, 0);
        k.timer_start(id, 1_000, 0, TimerMode::Realtime).unwrap();
        assert_eq!(k.timer_date(id), Ok(Some(1_000)));
        // Wall clock jumps 600 ahead: the wall date is reached sooner
        k.clock_adjust(600);
        assert_eq!(k.timer_date(id), Ok(Some(400)));
        k.tick(0, 400);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_migrate_between_cpus() {
        let mut k = Kernel::new(Config::new(2, 0)).unwrap();
        let (id, hits) = counter(&mut k, 0);
        k.timer_start(id, 30, 0, TimerMode::Relative).unwrap();
        k.timer_migrate(id, 1).unwrap();
        assert!(k.pending_timers(0).is_empty());
        assert_eq!(k.pending_timers(1).len(), 1);
        k.tick(0, 30);
        assert_eq!(hits.load(Ordering::Relaxed), 0);
        k.tick(1, 30);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert!(k.timer_migrate(id, 7).is_err());
    }

    #[test]
    fn test_destroy_invalidates_handle() {
        let mut k = Kernel::testing();
        let (id, _) = counter(&mut k, 0);
        k.timer_start(id, 10, 0, TimerMode::Relative).unwrap();
        k.timer_destroy(id).unwrap();
        assert!(k.pending_timers(0).is_empty());
        assert_eq!(k.timer_stop(id), Err(Error::NoSuchTimer));
    }
}
