//! Kernel — the nucleus instance
//!
//! Owns the master clock, the thread / synchronization object / timer
//! arenas and one scheduler per CPU. Every service is a method on
//! [`Kernel`]; callers that share it between CPUs go through
//! [`crate::pod::Pod`], which serializes access under the nucleus lock.
//!
//! Author: Moroya Sakamoto

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use crate::arena::Arena;
use crate::class::SchedClass;
use crate::clock::{BaseId, Clock, Nanos, Ticks};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::hooks::{ContextSwitch, FatalHandler, HookTable, NoSwitch, PanicOnFatal};
use crate::scheduler::Scheduler;
use crate::spinlock::CpuId;
use crate::synch::{Synch, SynchFlags, SynchId, WakeReason};
use crate::thread::{BlockMask, Priority, RunState, Thread, ThreadId};
use crate::timer::{Timer, TimerHandler, TimerId};

/// Nucleus instance
pub struct Kernel {
    pub(crate) config: Config,
    pub(crate) clock: Clock,
    pub(crate) threads: Arena<Thread>,
    pub(crate) synchs: Arena<Synch>,
    pub(crate) timers: Arena<Timer>,
    pub(crate) scheds: Vec<Scheduler>,
    pub(crate) switcher: Box<dyn ContextSwitch>,
    pub(crate) fatal_handler: Box<dyn FatalHandler>,
    pub(crate) hooks: HookTable,
    /// Round-robin slicing enabled
    pub(crate) rr_enabled: bool,
    /// Arming sequence of timer keys
    pub(crate) timer_seq: u64,
    pub(crate) timer_shots: u64,
    pub(crate) total_ticks: u64,
    running: bool,
}

impl Kernel {
    /// Kernel for `config`
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let clock = if config.clock_hz == 0 {
            Clock::software()
        } else {
            Clock::new(config.clock_hz)?
        };
        Ok(Self::build(config, clock))
    }

    /// Single-CPU kernel on the software clock (testing)
    pub fn testing() -> Self {
        Self::build(Config::testing(), Clock::software())
    }

    fn build(config: Config, clock: Clock) -> Self {
        let mut kernel = Self {
            config,
            clock,
            threads: Arena::new(),
            synchs: Arena::new(),
            timers: Arena::new(),
            scheds: Vec::with_capacity(config.cpus),
            switcher: Box::new(NoSwitch),
            fatal_handler: Box::new(PanicOnFatal),
            hooks: HookTable::default(),
            rr_enabled: true,
            timer_seq: 0,
            timer_shots: 0,
            total_ticks: 0,
            running: false,
        };
        for cpu in 0..config.cpus {
            let name = alloc::format!("idle/{}", cpu);
            let idle = kernel.create_thread(&name, SchedClass::Idle, Priority::IDLE, cpu, None);
            if let Some(t) = kernel.threads.get_mut(idle) {
                t.state = RunState::Running;
            }
            kernel
                .scheds
                .push(Scheduler::new(cpu, idle, config.timer_queue));
        }
        if config.watchdog > 0 {
            for cpu in 0..config.cpus {
                let wd = kernel.timers.insert(Timer::new(cpu, TimerHandler::Watchdog(cpu)));
                kernel.scheds[cpu].watchdog = Some(wd);
                if kernel.arm_timer(wd, config.watchdog, config.watchdog, 0).is_err() {
                    log::warn!("cpu {}: watchdog not armed", cpu);
                }
            }
        }
        log::debug!(
            "nucleus up: {} cpu(s), {} Hz, {:?} timer queues",
            config.cpus,
            kernel.clock.freq_hz(),
            config.timer_queue
        );
        kernel
    }

    /// Install the context switch hook
    pub fn with_context_switch(mut self, switcher: impl ContextSwitch + 'static) -> Self {
        self.switcher = Box::new(switcher);
        self
    }

    /// Install the fatal error handler
    pub fn with_fatal_handler(mut self, handler: impl FatalHandler + 'static) -> Self {
        self.fatal_handler = Box::new(handler);
        self
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Master clock
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Register a derived periodic time base
    pub fn add_time_base(&mut self, name: &str, period_ns: Nanos) -> Result<BaseId> {
        self.clock.add_base(name, period_ns)
    }

    /// Current raw clock date
    pub fn now(&self) -> Ticks {
        self.clock.read_raw()
    }

    /// Number of CPUs
    pub fn cpus(&self) -> usize {
        self.scheds.len()
    }

    /// Clock interrupt of `cpu` at raw date `now`
    ///
    /// Fires the expired timers of that CPU, then runs the dispatch pass
    /// on interrupt exit. Returns the switch performed, if any.
    pub fn tick(&mut self, cpu: CpuId, now: Ticks) -> Option<(ThreadId, ThreadId)> {
        if cpu >= self.scheds.len() {
            log::warn!("tick for unknown cpu {}", cpu);
            return None;
        }
        if !self.clock.set_raw(now) {
            log::warn!(
                "cpu {}: clock reading {} behind {}, ignored",
                cpu,
                now,
                self.clock.read_raw()
            );
        }
        self.total_ticks += 1;
        self.irq_enter(cpu);
        self.fire_timers(cpu);
        self.irq_exit(cpu)
    }

    /// Drive every CPU for `total` ticks in steps of `step` (simulation)
    pub fn run_for(&mut self, total: Ticks, step: Ticks) -> KernelStats {
        self.running = true;
        let step = step.max(1);
        let start = self.clock.read_raw();
        let mut elapsed = 0;

        while elapsed < total && self.running {
            elapsed += step;
            for cpu in 0..self.scheds.len() {
                self.tick(cpu, start + elapsed);
            }
        }

        self.running = false;
        KernelStats {
            elapsed,
            ..self.stats()
        }
    }

    /// Stop a [`Kernel::run_for`] loop (from a timer handler)
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Is a [`Kernel::run_for`] loop active?
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Counters
    pub fn stats(&self) -> KernelStats {
        KernelStats {
            elapsed: 0,
            total_ticks: self.total_ticks,
            context_switches: self.scheds.iter().map(Scheduler::switches).sum(),
            timer_shots: self.timer_shots,
            threads: self.threads.len() - self.scheds.len(),
            synchs: self.synchs.len(),
            timers: self.timers.iter().filter(|(_, t)| !t.is_nucleus_timer()).count(),
            clock_skews: self.clock.skews(),
        }
    }

    /// Check the cross-object invariants
    pub fn audit(&self) -> Result<()> {
        for (cpu, sched) in self.scheds.iter().enumerate() {
            let mut seen = Vec::new();
            for (prio, id) in sched.ready.iter() {
                let t = self
                    .threads
                    .get(id)
                    .ok_or(Error::Corrupted("stale thread in ready queue"))?;
                if t.state != RunState::Ready || t.cpu != cpu || t.cprio != prio || t.idle {
                    return Err(Error::Corrupted("ready queue entry out of sync"));
                }
                if seen.contains(&id) {
                    return Err(Error::Corrupted("thread queued twice"));
                }
                seen.push(id);
            }
            if sched.ready.len() != seen.len() {
                return Err(Error::Corrupted("ready queue length out of sync"));
            }
            if !self.threads.contains(sched.current) {
                return Err(Error::Corrupted("stale current thread"));
            }
            if !sched.timers.is_sorted() {
                return Err(Error::Corrupted("timer queue out of order"));
            }
            for key in sched.timers.keys() {
                let t = self
                    .timers
                    .get(key.id)
                    .ok_or(Error::Corrupted("stale timer in queue"))?;
                if !t.is_running() || t.date != key.date || t.cpu != cpu {
                    return Err(Error::Corrupted("timer key out of sync"));
                }
            }
        }

        for (id, t) in self.threads.iter() {
            let sched = &self.scheds[t.cpu];
            let consistent = match t.state {
                RunState::Ready => t.idle || sched.ready.contains(id),
                RunState::Running => sched.current == id && !sched.ready.contains(id),
                RunState::Blocked => !t.block.is_empty(),
                _ => true,
            };
            if !consistent {
                return Err(Error::Corrupted("run state out of sync with queues"));
            }
            if t.state != RunState::Blocked && !t.block.is_empty() {
                return Err(Error::Corrupted("runnable thread with block conditions"));
            }
            if t.block.contains(BlockMask::PENDING) != t.wchan.is_some() {
                return Err(Error::Corrupted("pending flag out of sync with wait channel"));
            }
            if let Some(wchan) = t.wchan {
                let waiting = self
                    .synchs
                    .get(wchan)
                    .is_some_and(|s| s.waiters.contains(&id));
                if !waiting {
                    return Err(Error::Corrupted("thread missing from its wait queue"));
                }
            }
            let expected = t
                .claims
                .iter()
                .filter_map(|&s| self.claim_priority(s))
                .fold(t.bprio, Priority::max);
            if t.cprio != expected {
                return Err(Error::Corrupted("effective priority differs from inheritance"));
            }
        }

        for (id, s) in self.synchs.iter() {
            let prios: Vec<Priority> = s
                .waiters
                .iter()
                .filter_map(|&w| self.threads.get(w).map(Thread::priority))
                .collect();
            if prios.len() != s.waiters.len() {
                return Err(Error::Corrupted("stale waiter"));
            }
            if s.flags.contains(SynchFlags::PRIO) && prios.windows(2).any(|w| w[0] < w[1]) {
                return Err(Error::Corrupted("wait queue out of priority order"));
            }
            if let Some(owner) = s.owner {
                let t = self
                    .threads
                    .get(owner)
                    .ok_or(Error::Corrupted("stale owner"))?;
                if !t.owned.contains(&id) {
                    return Err(Error::Corrupted("owner does not list its object"));
                }
                let best = prios.iter().copied().max();
                if s.flags.contains(SynchFlags::PIP) && best.is_some_and(|p| t.cprio < p) {
                    return Err(Error::Corrupted("owner below its claimants"));
                }
            }
        }
        Ok(())
    }

    /// Tear everything down
    pub fn shutdown(mut self) -> KernelStats {
        for id in self.synchs.handles() {
            let _ = self.synch_flush(id, WakeReason::Deleted);
        }
        for id in self.threads.handles() {
            if self.threads.get(id).is_some_and(|t| !t.idle) {
                self.finalize_delete(id);
            }
        }
        // Switch deleted current threads out so they get reaped
        for cpu in 0..self.scheds.len() {
            self.schedule(cpu);
        }
        let stats = self.stats();
        log::debug!(
            "nucleus down after {} ticks, {} switches",
            stats.total_ticks,
            stats.context_switches
        );
        stats
    }

    pub(crate) fn check_cpu(&self, cpu: CpuId) -> Result<()> {
        if cpu < self.scheds.len() {
            Ok(())
        } else {
            Err(Error::InvalidArgument("unknown cpu"))
        }
    }

    pub(crate) fn thread_ref(&self, id: ThreadId) -> Result<&Thread> {
        self.threads.get(id).ok_or(Error::NoSuchThread)
    }

    pub(crate) fn thread_mut(&mut self, id: ThreadId) -> Result<&mut Thread> {
        self.threads.get_mut(id).ok_or(Error::NoSuchThread)
    }

    pub(crate) fn synch_ref(&self, id: SynchId) -> Result<&Synch> {
        self.synchs.get(id).ok_or(Error::NoSuchSynch)
    }

    pub(crate) fn synch_mut(&mut self, id: SynchId) -> Result<&mut Synch> {
        self.synchs.get_mut(id).ok_or(Error::NoSuchSynch)
    }

    pub(crate) fn timer_ref(&self, id: TimerId) -> Result<&Timer> {
        self.timers.get(id).ok_or(Error::NoSuchTimer)
    }

    pub(crate) fn timer_mut(&mut self, id: TimerId) -> Result<&mut Timer> {
        self.timers.get_mut(id).ok_or(Error::NoSuchTimer)
    }

    /// Unrecoverable condition
    pub(crate) fn fatal(&self, msg: fmt::Arguments<'_>) -> ! {
        log::error!("nucleus fatal: {}", msg);
        self.fatal_handler.fatal(msg)
    }
}

/// Kernel counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KernelStats {
    /// Ticks covered by the last [`Kernel::run_for`]
    pub elapsed: Ticks,
    /// Clock interrupts handled
    pub total_ticks: u64,
    /// Context switches on all CPUs
    pub context_switches: u64,
    /// Timer shots fired
    pub timer_shots: u64,
    /// Live threads, idle threads excluded
    pub threads: usize,
    /// Live synchronization objects
    pub synchs: usize,
    /// Live user timers
    pub timers: usize,
    /// Backwards clock readings rejected
    pub clock_skews: u32,
}
