//! Thread — schedulable entity and its state machine
//!
//! A thread is Dormant until started, then alternates between Ready,
//! Running and Blocked. Blocked threads carry a mask of suspensive
//! conditions; the thread becomes Ready again only when the mask is
//! empty. Deletion parks the thread as a Zombie until its CPU switches
//! away from it, then the slot is reaped.
//!
//! Every operation here only updates bookkeeping and raises the
//! rescheduling hint of the affected CPU; the context switch itself
//! happens in [`Kernel::schedule`].
//!
//! Author: Moroya Sakamoto

use alloc::vec::Vec;
use bitflags::bitflags;
use heapless::String;

use crate::arena::Handle;
use crate::class::{QueuePos, SchedClass};
use crate::clock::Ticks;
use crate::error::{Error, Result};
use crate::hooks::HookKind;
use crate::kernel::Kernel;
use crate::scheduler::SchedStatus;
use crate::spinlock::CpuId;
use crate::synch::{SynchId, WakeReason};
use crate::timer::{Timer, TimerHandler, TimerId};

/// Thread handle
pub type ThreadId = Handle<Thread>;

/// Longest stored thread name (bytes)
pub const THREAD_NAME_LEN: usize = 32;

/// Thread priority (higher number = more urgent)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub i32);

impl Priority {
    /// Idle thread level, below every real-time priority
    pub const IDLE: Priority = Priority(-1);
    /// Lowest real-time priority
    pub const MIN: Priority = Priority(0);
    /// Highest real-time priority
    pub const MAX: Priority = Priority(99);
}

/// Thread run state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No such thread (reported for stale handles)
    NotCreated,
    /// Created, never started
    Dormant,
    /// Runnable, waiting for a CPU
    Ready,
    /// Current thread of its CPU
    Running,
    /// At least one suspensive condition pending
    Blocked,
    /// Deleted, waiting to be switched out and reaped
    Zombie,
}

bitflags! {
    /// Suspensive conditions of a blocked thread
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BlockMask: u32 {
        /// Explicit suspension
        const SUSPENDED = 1 << 0;
        /// Timed sleep (or the timeout half of a timed wait)
        const DELAYED = 1 << 1;
        /// Waiting on a synchronization object
        const PENDING = 1 << 2;
    }
}

/// Outcome flags of the last wait, cleared when a new wait begins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WaitInfo {
    /// The wait timed out
    pub timed_out: bool,
    /// The wait was broken by a forced wakeup
    pub forced_wake: bool,
    /// The object waited on was destroyed
    pub removed: bool,
    /// Ownership was stolen before the thread got to run
    pub robbed: bool,
    /// Granted ownership, not yet dispatched
    pub waken: bool,
}

/// Wait bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait forever
    Infinite,
    /// Do not wait at all
    NonBlocking,
    /// Wait at most this many ticks
    Relative(Ticks),
    /// Wait until this raw clock date
    Absolute(Ticks),
}

impl Timeout {
    /// Absolute deadline, `None` when unbounded
    pub(crate) fn deadline(self, now: Ticks) -> Result<Option<Ticks>> {
        match self {
            Timeout::Infinite => Ok(None),
            Timeout::NonBlocking => Err(Error::WouldBlock),
            Timeout::Relative(ticks) => Ok(Some(now.saturating_add(ticks))),
            Timeout::Absolute(date) => Ok(Some(date)),
        }
    }
}

/// Result of waiting for the next release point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodWait {
    /// Thread blocked until its next release
    Blocked,
    /// Release points already missed; the thread was not blocked
    Overrun(u64),
}

/// Result of a deletion request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deletion {
    /// Thread torn down (or parked as a zombie until switched out)
    Completed,
    /// Thread holds a boosting lock; deletion happens on its release
    Deferred,
}

/// Creation parameters
#[derive(Debug, Clone, Copy)]
pub struct ThreadParams<'a> {
    /// Thread name (truncated to [`THREAD_NAME_LEN`])
    pub name: &'a str,
    /// Base priority
    pub priority: Priority,
    /// Scheduling class
    pub class: SchedClass,
    /// CPU the thread runs on
    pub cpu: CpuId,
    /// Round-robin slice; `None` uses the configured default
    pub quantum: Option<Ticks>,
}

impl<'a> ThreadParams<'a> {
    /// FIFO thread on CPU 0
    pub const fn new(name: &'a str, priority: Priority) -> Self {
        Self {
            name,
            priority,
            class: SchedClass::Fifo,
            cpu: 0,
            quantum: None,
        }
    }

    /// Time-sliced thread
    pub const fn round_robin(mut self, quantum: Option<Ticks>) -> Self {
        self.class = SchedClass::RoundRobin;
        self.quantum = quantum;
        self
    }

    /// Bind to `cpu`
    pub const fn on_cpu(mut self, cpu: CpuId) -> Self {
        self.cpu = cpu;
        self
    }
}

/// Thread control block
pub struct Thread {
    pub(crate) id: ThreadId,
    pub(crate) name: String<THREAD_NAME_LEN>,
    pub(crate) class: SchedClass,
    /// Class and priority given at creation, restored by a restart
    pub(crate) iclass: SchedClass,
    pub(crate) iprio: Priority,
    /// Base priority, as last set by the owner of the thread
    pub(crate) bprio: Priority,
    /// Effective priority, including inheritance boosts
    pub(crate) cprio: Priority,
    pub(crate) state: RunState,
    pub(crate) block: BlockMask,
    pub(crate) info: WaitInfo,
    /// Object the thread is pending on
    pub(crate) wchan: Option<SynchId>,
    /// Object that granted ownership while the thread was not running
    pub(crate) wwake: Option<SynchId>,
    /// Owned objects with waiters boosting this thread
    pub(crate) claims: Vec<SynchId>,
    /// Owned objects
    pub(crate) owned: Vec<SynchId>,
    pub(crate) rtimer: TimerId,
    pub(crate) ptimer: TimerId,
    pub(crate) rrtimer: TimerId,
    pub(crate) cpu: CpuId,
    pub(crate) quantum: Option<Ticks>,
    /// Absolute end of the current timed wait
    pub(crate) wait_deadline: Option<Ticks>,
    pub(crate) period_waiting: bool,
    pub(crate) overruns: u64,
    pub(crate) saved_lock_depth: u32,
    pub(crate) delete_pending: bool,
    pub(crate) idle: bool,
    pub(crate) dispatches: u64,
    pub(crate) restarts: u64,
}

impl Thread {
    pub(crate) fn new(
        id: ThreadId,
        name: &str,
        class: SchedClass,
        prio: Priority,
        cpu: CpuId,
        quantum: Option<Ticks>,
        timers: [TimerId; 3],
    ) -> Self {
        let mut n = String::new();
        for c in name.chars() {
            if n.push(c).is_err() {
                break;
            }
        }
        let [rtimer, ptimer, rrtimer] = timers;
        Self {
            id,
            name: n,
            class,
            iclass: class,
            iprio: prio,
            bprio: prio,
            cprio: prio,
            state: RunState::Dormant,
            block: BlockMask::empty(),
            info: WaitInfo::default(),
            wchan: None,
            wwake: None,
            claims: Vec::new(),
            owned: Vec::new(),
            rtimer,
            ptimer,
            rrtimer,
            cpu,
            quantum,
            wait_deadline: None,
            period_waiting: false,
            overruns: 0,
            saved_lock_depth: 0,
            delete_pending: false,
            idle: class == SchedClass::Idle,
            dispatches: 0,
            restarts: 0,
        }
    }

    /// Handle of this thread
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Thread name
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Scheduling class
    pub fn class(&self) -> SchedClass {
        self.class
    }

    /// Base priority
    pub fn base_priority(&self) -> Priority {
        self.bprio
    }

    /// Effective priority
    pub fn priority(&self) -> Priority {
        self.cprio
    }

    /// Run state
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Pending suspensive conditions
    pub fn block_mask(&self) -> BlockMask {
        self.block
    }

    /// Outcome flags of the last wait
    pub fn info(&self) -> WaitInfo {
        self.info
    }

    /// Object the thread is pending on
    pub fn wchan(&self) -> Option<SynchId> {
        self.wchan
    }

    /// Objects currently boosting this thread
    pub fn claims(&self) -> &[SynchId] {
        &self.claims
    }

    /// Objects owned by this thread
    pub fn owned(&self) -> &[SynchId] {
        &self.owned
    }

    /// Is the effective priority inherited?
    pub fn is_boosted(&self) -> bool {
        !self.claims.is_empty()
    }

    /// CPU the thread belongs to
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// Round-robin slice override
    pub fn quantum(&self) -> Option<Ticks> {
        self.quantum
    }

    /// Per-CPU idle thread?
    pub fn is_idle(&self) -> bool {
        self.idle
    }

    /// Deletion waiting on a boosting lock release?
    pub fn is_delete_pending(&self) -> bool {
        self.delete_pending
    }

    /// Unconsumed period overruns
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Times the thread was switched in
    pub fn dispatches(&self) -> u64 {
        self.dispatches
    }

    /// Times the thread was restarted
    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    /// Resource timer (timeouts)
    pub fn resource_timer(&self) -> TimerId {
        self.rtimer
    }

    /// Periodic release timer
    pub fn period_timer(&self) -> TimerId {
        self.ptimer
    }

    /// Is the thread Ready or Running?
    pub fn is_runnable(&self) -> bool {
        matches!(self.state, RunState::Ready | RunState::Running)
    }

    /// Why the last wait ended
    pub fn wake_reason(&self) -> WakeReason {
        if self.info.removed {
            WakeReason::Deleted
        } else if self.info.forced_wake {
            WakeReason::ForcedWake
        } else if self.info.timed_out {
            WakeReason::Timeout
        } else {
            WakeReason::Woken
        }
    }
}

impl Kernel {
    /// Create a dormant thread
    pub fn thread_init(&mut self, params: ThreadParams<'_>) -> Result<ThreadId> {
        self.check_cpu(params.cpu)?;
        if params.class == SchedClass::Idle {
            return Err(Error::NotPermitted("idle class is reserved"));
        }
        if !params.class.accepts(params.priority, &self.config) {
            return Err(Error::InvalidArgument("priority out of range for class"));
        }
        if params.quantum == Some(0) {
            return Err(Error::InvalidArgument("round-robin quantum must be non-zero"));
        }
        let id = self.create_thread(
            params.name,
            params.class,
            params.priority,
            params.cpu,
            params.quantum,
        );
        log::debug!(
            "thread {} {:?} created: class {}, prio {}, cpu {}",
            params.name,
            id,
            params.class.name(),
            params.priority.0,
            params.cpu
        );
        Ok(id)
    }

    pub(crate) fn create_thread(
        &mut self,
        name: &str,
        class: SchedClass,
        prio: Priority,
        cpu: CpuId,
        quantum: Option<Ticks>,
    ) -> ThreadId {
        let timers = &mut self.timers;
        self.threads.insert_with(|tid| {
            let rtimer = timers.insert(Timer::new(cpu, TimerHandler::Timeout(tid)));
            let ptimer = timers.insert(Timer::new(cpu, TimerHandler::Period(tid)));
            let rrtimer = timers.insert(Timer::new(cpu, TimerHandler::Slice(tid)));
            Thread::new(tid, name, class, prio, cpu, quantum, [rtimer, ptimer, rrtimer])
        })
    }

    /// Make a dormant thread runnable
    pub fn thread_start(&mut self, id: ThreadId) -> Result<()> {
        let t = self.thread_ref(id)?;
        if t.state != RunState::Dormant {
            return Err(Error::state("start", t.state));
        }
        self.ready_thread(id);
        self.run_hooks(HookKind::Start, id);
        log::debug!("thread {:?} started", id);
        Ok(())
    }

    /// Add suspensive conditions to a thread
    ///
    /// A finite timeout arms the thread's resource timer and adds
    /// `DELAYED`. `PENDING` is reserved to synchronization objects.
    pub fn thread_suspend(&mut self, id: ThreadId, mask: BlockMask, timeout: Timeout) -> Result<()> {
        let t = self.thread_ref(id)?;
        if t.idle {
            return Err(Error::NotPermitted("idle thread cannot block"));
        }
        if matches!(t.state, RunState::Dormant | RunState::Zombie) {
            return Err(Error::state("suspend", t.state));
        }
        if t.delete_pending && mask.contains(BlockMask::SUSPENDED) {
            return Err(Error::NotPermitted("thread deletion pending"));
        }
        if mask.is_empty() || mask.contains(BlockMask::PENDING) {
            return Err(Error::InvalidArgument("suspend mask"));
        }
        let deadline = timeout.deadline(self.clock.read_raw())?;
        if mask == BlockMask::DELAYED && deadline.is_none() {
            return Err(Error::InvalidArgument("delay without timeout"));
        }
        self.suspend_inner(id, mask, deadline, None)
    }

    /// Sleep for `ticks`
    pub fn thread_delay(&mut self, id: ThreadId, ticks: Ticks) -> Result<()> {
        self.thread_suspend(id, BlockMask::DELAYED, Timeout::Relative(ticks))
    }

    /// Clear suspensive conditions
    ///
    /// Resuming a thread that is not blocked is a no-op.
    pub fn thread_resume(&mut self, id: ThreadId, mask: BlockMask) -> Result<()> {
        let t = self.thread_ref(id)?;
        match t.state {
            RunState::Blocked => {
                self.resume_inner(id, mask);
                Ok(())
            }
            RunState::Ready | RunState::Running => Ok(()),
            state => Err(Error::state("resume", state)),
        }
    }

    /// Break a timed sleep or a wait with a forced wakeup
    ///
    /// Returns whether a wait was actually broken. An explicit
    /// suspension is left in place.
    pub fn thread_cancel(&mut self, id: ThreadId) -> Result<bool> {
        let t = self.thread_mut(id)?;
        if t.state != RunState::Blocked {
            return Ok(false);
        }
        let mask = if t.block.contains(BlockMask::PENDING) {
            BlockMask::PENDING
        } else if t.block.contains(BlockMask::DELAYED) {
            BlockMask::DELAYED
        } else {
            return Ok(false);
        };
        t.info.forced_wake = true;
        t.period_waiting = false;
        self.resume_inner(id, mask);
        log::trace!("thread {:?} forcibly woken", id);
        Ok(true)
    }

    /// Delete a thread
    ///
    /// A thread whose owned objects are boosting it is only marked and
    /// woken, explicit suspension included; it is torn down when it
    /// releases its last boosting lock.
    pub fn thread_delete(&mut self, id: ThreadId) -> Result<Deletion> {
        let t = self.thread_mut(id)?;
        if t.idle {
            return Err(Error::NotPermitted("idle thread cannot be deleted"));
        }
        if t.state == RunState::Zombie {
            return Ok(Deletion::Completed);
        }
        if !t.claims.is_empty() {
            t.delete_pending = true;
            self.thread_cancel(id)?;
            // It has to run to release its boosting locks
            self.resume_inner(id, BlockMask::SUSPENDED);
            log::debug!("thread {:?} deletion deferred", id);
            return Ok(Deletion::Deferred);
        }
        self.finalize_delete(id);
        Ok(Deletion::Completed)
    }

    /// Change the base priority
    ///
    /// An inherited boost is kept: the effective priority never drops
    /// below the highest claimant.
    pub fn thread_set_priority(&mut self, id: ThreadId, prio: Priority) -> Result<()> {
        let config = self.config;
        let t = self.thread_mut(id)?;
        if t.state == RunState::Zombie {
            return Err(Error::state("set_priority", t.state));
        }
        if !t.class.accepts(prio, &config) {
            return Err(Error::InvalidArgument("priority out of range for class"));
        }
        t.bprio = prio;
        self.recompute_priority(id);
        Ok(())
    }

    /// Bring a started thread back to its initial scheduling state
    ///
    /// Any wait or suspension is cancelled, every owned object is
    /// released, and the creation class and priority are restored. A
    /// scheduler lock held by the thread is dropped.
    pub fn thread_restart(&mut self, id: ThreadId) -> Result<()> {
        let t = self.thread_ref(id)?;
        if t.idle {
            return Err(Error::NotPermitted("idle thread cannot be restarted"));
        }
        if matches!(t.state, RunState::Dormant | RunState::Zombie) {
            return Err(Error::state("restart", t.state));
        }
        if t.delete_pending {
            return Err(Error::NotPermitted("thread deletion pending"));
        }
        let (cpu, class, rrtimer) = (t.cpu, t.class, t.rrtimer);
        if t.state == RunState::Blocked {
            if let Some(t) = self.threads.get_mut(id) {
                t.info.forced_wake = true;
            }
            self.resume_inner(id, BlockMask::all());
        }
        self.release_all_ownerships(id);
        if class.is_time_sliced() {
            self.disarm_timer(rrtimer);
        }
        let t = self.thread_mut(id)?;
        t.class = t.iclass;
        t.bprio = t.iprio;
        t.period_waiting = false;
        t.overruns = 0;
        t.saved_lock_depth = 0;
        t.restarts += 1;
        let running = t.state == RunState::Running;
        let sched = &mut self.scheds[cpu];
        if sched.current == id {
            sched.lock_depth = 0;
        }
        sched.status.insert(SchedStatus::RESCHED);
        self.recompute_priority(id);
        if running {
            self.start_slice(cpu, id);
        }
        log::debug!("thread {:?} restarted", id);
        Ok(())
    }

    /// Move a thread to another scheduling class at base priority `prio`
    ///
    /// A ready thread goes to the tail of its new level. An inherited
    /// boost is kept, as with [`Kernel::thread_set_priority`].
    pub fn thread_set_class(&mut self, id: ThreadId, class: SchedClass, prio: Priority) -> Result<()> {
        let config = self.config;
        let t = self.thread_ref(id)?;
        if t.idle || class == SchedClass::Idle {
            return Err(Error::NotPermitted("idle class is reserved"));
        }
        if t.state == RunState::Zombie {
            return Err(Error::state("set_class", t.state));
        }
        if !class.accepts(prio, &config) {
            return Err(Error::InvalidArgument("priority out of range for class"));
        }
        let (cpu, old, state, rrtimer) = (t.cpu, t.class, t.state, t.rrtimer);
        if old.is_time_sliced() && !class.is_time_sliced() {
            self.disarm_timer(rrtimer);
        }
        let t = self.thread_mut(id)?;
        t.class = class;
        t.bprio = prio;
        self.recompute_priority(id);
        let cprio = self.thread_ref(id)?.cprio;
        match state {
            RunState::Ready => {
                let sched = &mut self.scheds[cpu];
                sched.ready.remove(id);
                sched.ready.enqueue(id, cprio, QueuePos::Tail);
                sched.status.insert(SchedStatus::RESCHED);
            }
            RunState::Running => {
                self.start_slice(cpu, id);
                self.scheds[cpu].status.insert(SchedStatus::RESCHED);
            }
            _ => {}
        }
        log::debug!("thread {:?} class {} -> {}, prio {}", id, old.name(), class.name(), prio.0);
        Ok(())
    }

    /// Make a thread periodic
    ///
    /// The first release happens at `start` (absolute) or one period from
    /// now. A future `start` blocks a runnable thread until then. A zero
    /// period turns periodic mode off.
    pub fn thread_set_periodic(&mut self, id: ThreadId, start: Option<Ticks>, period: Ticks) -> Result<()> {
        let t = self.thread_mut(id)?;
        if t.idle || t.state == RunState::Zombie {
            return Err(Error::state("set_periodic", t.state));
        }
        let ptimer = t.ptimer;
        if period == 0 {
            t.overruns = 0;
            t.period_waiting = false;
            self.disarm_timer(ptimer);
            return Ok(());
        }
        if period < self.config.min_interval {
            return Err(Error::InvalidArgument("period below minimum interval"));
        }
        let now = self.clock.read_raw();
        let first = match start {
            Some(date) if date <= now => return Err(Error::TooLate),
            Some(date) => date,
            None => now.saturating_add(period),
        };
        let t = self.thread_mut(id)?;
        t.overruns = 0;
        let (prio, runnable) = (t.cprio, t.is_runnable());
        self.arm_timer(ptimer, first, period, prio.0)?;
        if start.is_some() && runnable {
            if let Some(t) = self.threads.get_mut(id) {
                t.period_waiting = true;
            }
            self.suspend_inner(id, BlockMask::DELAYED, None, None)?;
        }
        log::debug!("thread {:?} periodic: first {}, period {}", id, first, period);
        Ok(())
    }

    /// Wait for the next release point
    pub fn thread_wait_period(&mut self, id: ThreadId) -> Result<PeriodWait> {
        let t = self.thread_ref(id)?;
        if !t.is_runnable() {
            return Err(Error::state("wait_period", t.state));
        }
        if !self.timer_is_running(t.ptimer) {
            return Err(Error::WouldBlock);
        }
        let t = self.thread_mut(id)?;
        if t.overruns > 0 {
            let missed = core::mem::take(&mut t.overruns);
            return Ok(PeriodWait::Overrun(missed));
        }
        t.period_waiting = true;
        self.suspend_inner(id, BlockMask::DELAYED, None, None)?;
        Ok(PeriodWait::Blocked)
    }

    /// Move a thread to another CPU, timers included
    pub fn thread_migrate(&mut self, id: ThreadId, cpu: CpuId) -> Result<()> {
        self.check_cpu(cpu)?;
        let t = self.thread_ref(id)?;
        if t.idle {
            return Err(Error::NotPermitted("idle thread is bound to its cpu"));
        }
        if matches!(t.state, RunState::Zombie | RunState::NotCreated) {
            return Err(Error::state("migrate", t.state));
        }
        let from = t.cpu;
        if from == cpu {
            return Ok(());
        }
        let is_current = self.scheds[from].current == id;
        if is_current && self.scheds[from].lock_depth > 0 {
            return Err(Error::Busy);
        }
        let (state, prio, timers) = (t.state, t.cprio, [t.rtimer, t.ptimer, t.rrtimer]);
        if state == RunState::Ready {
            self.scheds[from].ready.remove(id);
        }
        for timer in timers {
            self.migrate_timer_inner(timer, cpu)?;
        }
        let t = self.thread_mut(id)?;
        t.cpu = cpu;
        if t.is_runnable() {
            t.state = RunState::Ready;
            self.scheds[cpu].ready.enqueue(id, prio, QueuePos::Tail);
            self.scheds[cpu].status.insert(SchedStatus::RESCHED);
        }
        if is_current {
            self.scheds[from].status.insert(SchedStatus::RESCHED);
        }
        log::debug!("thread {:?} migrated cpu {} -> {}", id, from, cpu);
        Ok(())
    }

    /// Thread control block
    pub fn thread(&self, id: ThreadId) -> Result<&Thread> {
        self.thread_ref(id)
    }

    /// Run state; stale handles report [`RunState::NotCreated`]
    pub fn thread_state(&self, id: ThreadId) -> RunState {
        self.threads
            .get(id)
            .map_or(RunState::NotCreated, |t| t.state)
    }

    /// Why the last wait of a thread ended
    pub fn thread_wake_reason(&self, id: ThreadId) -> Result<WakeReason> {
        self.thread_ref(id).map(Thread::wake_reason)
    }

    /// Handles of all live threads, idle threads included
    pub fn threads(&self) -> Vec<ThreadId> {
        self.threads.handles()
    }

    /// Block a thread on `mask`
    ///
    /// The timeout is armed before anything else changes, so a full
    /// timer queue leaves the thread exactly as it was.
    pub(crate) fn suspend_inner(
        &mut self,
        id: ThreadId,
        mask: BlockMask,
        deadline: Option<Ticks>,
        wchan: Option<SynchId>,
    ) -> Result<()> {
        let t = self.thread_ref(id)?;
        let (cpu, prio, rtimer) = (t.cpu, t.cprio, t.rtimer);
        if let Some(date) = deadline {
            self.arm_timer(rtimer, date, 0, prio.0)?;
        }
        let t = self.thread_mut(id)?;
        let prev = t.state;
        if t.is_runnable() {
            t.info = WaitInfo::default();
            t.state = RunState::Blocked;
            t.wait_deadline = deadline;
        }
        t.block |= mask;
        if wchan.is_some() {
            t.wchan = wchan;
        }
        if deadline.is_some() {
            t.block |= BlockMask::DELAYED;
        }
        if prev == RunState::Ready {
            self.scheds[cpu].ready.remove(id);
        }
        if self.scheds[cpu].current == id {
            self.scheds[cpu].status.insert(SchedStatus::RESCHED);
        }
        log::trace!("thread {:?} suspended: {:?} until {:?}", id, mask, deadline);
        Ok(())
    }

    pub(crate) fn resume_inner(&mut self, id: ThreadId, mask: BlockMask) {
        let Some(t) = self.threads.get_mut(id) else {
            return;
        };
        if t.state != RunState::Blocked {
            return;
        }
        let before = t.block;
        t.block.remove(mask);
        let cleared = before & !t.block;
        // The two halves of a timed wait end together
        if cleared.contains(BlockMask::DELAYED) && t.block.contains(BlockMask::PENDING) {
            t.block.remove(BlockMask::PENDING);
        }
        if cleared.contains(BlockMask::PENDING) {
            t.block.remove(BlockMask::DELAYED);
        }
        let waited = (before & !t.block).intersects(BlockMask::DELAYED | BlockMask::PENDING);
        let forget = !t.block.contains(BlockMask::PENDING) && t.wchan.is_some();
        let (rtimer, runnable) = (t.rtimer, t.block.is_empty());
        if forget {
            self.forget_sleeper(id);
        }
        if waited {
            self.disarm_timer(rtimer);
        }
        if runnable {
            self.ready_thread(id);
        }
        log::trace!("thread {:?} resumed: {:?}", id, mask);
    }

    /// Queue a thread that just became runnable
    pub(crate) fn ready_thread(&mut self, id: ThreadId) {
        let Some(t) = self.threads.get_mut(id) else {
            return;
        };
        t.state = RunState::Ready;
        t.block = BlockMask::empty();
        let (cpu, prio, idle) = (t.cpu, t.cprio, t.idle);
        let sched = &mut self.scheds[cpu];
        // A current thread resumed before being switched out keeps its turn
        let pos = if sched.current == id {
            QueuePos::Head
        } else {
            QueuePos::Tail
        };
        if !idle {
            sched.ready.enqueue(id, prio, pos);
        }
        sched.status.insert(SchedStatus::RESCHED);
    }

    /// Set the effective priority, reordering every queue the thread is in
    pub(crate) fn renice_inner(&mut self, id: ThreadId, prio: Priority) {
        let Some(t) = self.threads.get_mut(id) else {
            return;
        };
        if t.cprio == prio {
            return;
        }
        let old = t.cprio;
        t.cprio = prio;
        let (cpu, state, wchan) = (t.cpu, t.state, t.wchan);
        if state == RunState::Ready && !t.idle {
            let sched = &mut self.scheds[cpu];
            sched.ready.remove(id);
            sched.ready.enqueue(id, prio, QueuePos::Tail);
        }
        if state == RunState::Ready || self.scheds[cpu].current == id {
            self.scheds[cpu].status.insert(SchedStatus::RESCHED);
        }
        log::trace!("thread {:?} priority {} -> {}", id, old.0, prio.0);
        if let Some(synch) = wchan {
            self.requeue_sleeper(id, synch);
        }
    }

    /// Tear a thread down now
    pub(crate) fn finalize_delete(&mut self, id: ThreadId) {
        self.run_hooks(HookKind::Delete, id);
        let Some(t) = self.threads.get(id) else {
            return;
        };
        let (cpu, state, pending) = (t.cpu, t.state, t.wchan.is_some());
        let timers = [t.rtimer, t.ptimer, t.rrtimer];
        if state == RunState::Ready {
            self.scheds[cpu].ready.remove(id);
        }
        if pending {
            self.forget_sleeper(id);
        }
        for timer in timers {
            self.disarm_timer(timer);
        }
        self.release_all_ownerships(id);
        if let Some(t) = self.threads.get_mut(id) {
            t.state = RunState::Zombie;
            t.block = BlockMask::empty();
            t.info.removed = true;
            t.claims.clear();
            t.delete_pending = false;
        }
        if self.scheds[cpu].current == id {
            self.scheds[cpu].status.insert(SchedStatus::RESCHED);
        } else {
            self.reap(id);
        }
        log::debug!("thread {:?} deleted", id);
    }

    /// Free the slot of a zombie and its timers
    pub(crate) fn reap(&mut self, id: ThreadId) {
        if let Some(t) = self.threads.remove(id) {
            for timer in [t.rtimer, t.ptimer, t.rrtimer] {
                self.disarm_timer(timer);
                self.timers.remove(timer);
            }
            log::trace!("thread {} {:?} reaped", t.name(), id);
        }
    }

    /// Resource timer expiry: the wait timed out
    pub(crate) fn on_wait_timeout(&mut self, id: ThreadId) {
        let Some(t) = self.threads.get_mut(id) else {
            return;
        };
        if t.state != RunState::Blocked || !t.block.contains(BlockMask::DELAYED) {
            return;
        }
        t.info.timed_out = true;
        self.resume_inner(id, BlockMask::DELAYED);
    }

    /// Periodic release point
    pub(crate) fn on_period(&mut self, id: ThreadId, missed: u64) {
        let Some(t) = self.threads.get_mut(id) else {
            return;
        };
        if t.period_waiting && t.block.contains(BlockMask::DELAYED) {
            t.period_waiting = false;
            t.overruns += missed;
            self.resume_inner(id, BlockMask::DELAYED);
        } else {
            t.overruns += 1 + missed;
            log::warn!("thread {} {:?} overrun ({} pending)", t.name(), id, t.overruns);
        }
    }

    /// Round-robin slice exhausted: rotate the current thread
    pub(crate) fn on_slice(&mut self, id: ThreadId) {
        let Some(t) = self.threads.get_mut(id) else {
            return;
        };
        let cpu = t.cpu;
        let sched = &mut self.scheds[cpu];
        if sched.current != id || t.state != RunState::Running || sched.lock_depth > 0 {
            return;
        }
        if t.class.requeue_position(true) == QueuePos::Tail {
            t.state = RunState::Ready;
            sched.ready.enqueue(id, t.cprio, QueuePos::Tail);
            sched.status.insert(SchedStatus::RESCHED);
            log::trace!("thread {:?} slice expired", id);
        }
    }
}
