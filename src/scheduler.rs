//! Per-CPU scheduler — ready queue and dispatch
//!
//! Fixed-priority preemptive dispatch: the highest-priority ready thread
//! runs, FIFO within a level. The running thread is never kept in the
//! ready queue; a preempted thread goes back to the head of its level so
//! it resumes before its peers.
//!
//! Operations elsewhere only raise [`SchedStatus::RESCHED`]. The switch
//! happens in [`Kernel::schedule`], which is skipped while the CPU is in
//! interrupt context or already switching, and while the scheduler lock
//! is held by a runnable thread.
//!
//! Author: Moroya Sakamoto

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use bitflags::bitflags;

use crate::class::QueuePos;
use crate::clock::Ticks;
use crate::error::{Error, Result};
use crate::hooks::HookKind;
use crate::kernel::Kernel;
use crate::spinlock::CpuId;
use crate::thread::{Priority, RunState, ThreadId};
use crate::timer::TimerId;
use crate::timerq::{QueueKind, TimerQueue};

/// Watchdog periods a thread may hold the CPU before it is killed
pub const WATCHDOG_TRIGGER: u32 = 4;

bitflags! {
    /// Scheduler status bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SchedStatus: u32 {
        /// A dispatch pass is needed
        const RESCHED = 1 << 0;
        /// A context switch is in progress
        const IN_SWITCH = 1 << 1;
    }
}

/// Priority-indexed ready queue
#[derive(Debug, Default)]
pub struct ReadyQueue {
    levels: BTreeMap<Priority, VecDeque<ThreadId>>,
    len: usize,
}

impl ReadyQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert at the head or tail of level `prio`
    pub fn enqueue(&mut self, id: ThreadId, prio: Priority, pos: QueuePos) {
        let level = self.levels.entry(prio).or_default();
        match pos {
            QueuePos::Head => level.push_front(id),
            QueuePos::Tail => level.push_back(id),
        }
        self.len += 1;
    }

    /// Remove `id` from whatever level holds it
    pub fn remove(&mut self, id: ThreadId) -> bool {
        let mut emptied = None;
        let mut found = false;
        for (prio, level) in self.levels.iter_mut() {
            if let Some(pos) = level.iter().position(|&t| t == id) {
                level.remove(pos);
                found = true;
                if level.is_empty() {
                    emptied = Some(*prio);
                }
                break;
            }
        }
        if let Some(prio) = emptied {
            self.levels.remove(&prio);
        }
        if found {
            self.len -= 1;
        }
        found
    }

    /// Next thread to run and its level
    pub fn peek(&self) -> Option<(Priority, ThreadId)> {
        let (prio, level) = self.levels.iter().next_back()?;
        level.front().map(|&id| (*prio, id))
    }

    /// Take the next thread to run
    pub fn pop(&mut self) -> Option<ThreadId> {
        let mut entry = self.levels.last_entry()?;
        let id = entry.get_mut().pop_front();
        if entry.get().is_empty() {
            entry.remove();
        }
        if id.is_some() {
            self.len -= 1;
        }
        id
    }

    /// Move the head of level `prio` to its tail
    pub fn rotate(&mut self, prio: Priority) -> bool {
        match self.levels.get_mut(&prio) {
            Some(level) if level.len() > 1 => {
                level.rotate_left(1);
                true
            }
            _ => false,
        }
    }

    /// Queued threads
    pub fn len(&self) -> usize {
        self.len
    }

    /// Nothing queued?
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Is `id` queued?
    pub fn contains(&self, id: ThreadId) -> bool {
        self.levels.values().any(|level| level.contains(&id))
    }

    /// Queued threads in dispatch order, with their level
    pub fn iter(&self) -> impl Iterator<Item = (Priority, ThreadId)> + '_ {
        self.levels
            .iter()
            .rev()
            .flat_map(|(prio, level)| level.iter().map(move |&id| (*prio, id)))
    }
}

/// Scheduler of one CPU
pub struct Scheduler {
    pub(crate) cpu: CpuId,
    pub(crate) current: ThreadId,
    pub(crate) idle: ThreadId,
    pub(crate) ready: ReadyQueue,
    pub(crate) timers: TimerQueue,
    pub(crate) status: SchedStatus,
    /// Interrupt nesting level
    pub(crate) irq_depth: u32,
    /// Scheduler lock nesting of the current thread
    pub(crate) lock_depth: u32,
    pub(crate) switches: u64,
    pub(crate) watchdog: Option<TimerId>,
    /// Consecutive watchdog periods spent outside the idle thread
    pub(crate) wd_count: u32,
}

impl Scheduler {
    pub(crate) fn new(cpu: CpuId, idle: ThreadId, queue: QueueKind) -> Self {
        Self {
            cpu,
            current: idle,
            idle,
            ready: ReadyQueue::new(),
            timers: TimerQueue::new(queue),
            status: SchedStatus::empty(),
            irq_depth: 0,
            lock_depth: 0,
            switches: 0,
            watchdog: None,
            wd_count: 0,
        }
    }

    /// CPU served
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// Current thread
    pub fn current(&self) -> ThreadId {
        self.current
    }

    /// Idle thread
    pub fn idle(&self) -> ThreadId {
        self.idle
    }

    /// Ready queue
    pub fn ready(&self) -> &ReadyQueue {
        &self.ready
    }

    /// Timer queue
    pub fn timers(&self) -> &TimerQueue {
        &self.timers
    }

    /// Status bits
    pub fn status(&self) -> SchedStatus {
        self.status
    }

    /// Scheduler lock nesting
    pub fn lock_depth(&self) -> u32 {
        self.lock_depth
    }

    /// Context switches performed
    pub fn switches(&self) -> u64 {
        self.switches
    }

    /// Runaway watchdog timer, when configured
    pub fn watchdog_timer(&self) -> Option<TimerId> {
        self.watchdog
    }

    /// Is the CPU in interrupt context?
    pub fn in_irq(&self) -> bool {
        self.irq_depth > 0
    }
}

impl Kernel {
    /// Dispatch pass on `cpu`
    ///
    /// Returns `(outgoing, incoming)` when a context switch happened.
    pub fn schedule(&mut self, cpu: CpuId) -> Option<(ThreadId, ThreadId)> {
        let sched = self.scheds.get(cpu)?;
        if sched.irq_depth > 0 || sched.status.contains(SchedStatus::IN_SWITCH) {
            return None;
        }
        let curr = sched.current;
        let runnable = self
            .threads
            .get(curr)
            .is_some_and(|t| t.state == RunState::Running && t.cpu == cpu);
        if runnable && sched.lock_depth > 0 {
            return None;
        }

        let sched = &mut self.scheds[cpu];
        sched.status.remove(SchedStatus::RESCHED);
        if runnable {
            let Some(t) = self.threads.get_mut(curr) else {
                return None;
            };
            match sched.ready.peek() {
                Some((prio, _)) if prio > t.cprio => {}
                _ => return None,
            }
            t.state = RunState::Ready;
            if !t.idle {
                sched.ready.enqueue(curr, t.cprio, t.class.requeue_position(false));
            }
        }
        let next = sched.ready.pop().unwrap_or(sched.idle);

        let state = self.threads.get(next).map(|t| t.state);
        if state != Some(RunState::Ready) {
            self.fatal(format_args!(
                "cpu {}: switching to {:?} in state {:?}",
                cpu, next, state
            ));
        }
        if next == curr {
            self.dispatch(cpu, next);
            return None;
        }
        Some(self.switch_to(cpu, curr, next))
    }

    /// Dispatch pass on every CPU with a pending reschedule
    pub fn reschedule(&mut self) -> Vec<(CpuId, ThreadId, ThreadId)> {
        let mut switched = Vec::new();
        for cpu in 0..self.scheds.len() {
            if self.scheds[cpu].status.contains(SchedStatus::RESCHED) {
                if let Some((out, next)) = self.schedule(cpu) {
                    switched.push((cpu, out, next));
                }
            }
        }
        switched
    }

    fn switch_to(&mut self, cpu: CpuId, out: ThreadId, next: ThreadId) -> (ThreadId, ThreadId) {
        let sched = &mut self.scheds[cpu];
        sched.status.insert(SchedStatus::IN_SWITCH);
        let mut zombie = false;
        let mut slice = None;
        // The outgoing thread may already live on another CPU after migration
        if let Some(t) = self.threads.get_mut(out).filter(|t| t.cpu == cpu) {
            t.saved_lock_depth = sched.lock_depth;
            zombie = t.state == RunState::Zombie;
            slice = Some(t.rrtimer);
        }
        sched.lock_depth = self.threads.get(next).map_or(0, |t| t.saved_lock_depth);
        sched.current = next;
        sched.switches += 1;
        if let Some(rrtimer) = slice {
            self.disarm_timer(rrtimer);
        }
        self.dispatch(cpu, next);
        if next != self.scheds[cpu].idle {
            self.run_hooks(HookKind::Switch, next);
        }

        self.switcher.switch(cpu, out, next);
        self.scheds[cpu].status.remove(SchedStatus::IN_SWITCH);
        if zombie {
            self.reap(out);
        }
        log::debug!("cpu {}: switch {:?} -> {:?}", cpu, out, next);
        (out, next)
    }

    /// Mark the chosen thread running and start its time slice
    fn dispatch(&mut self, cpu: CpuId, id: ThreadId) {
        let Some(t) = self.threads.get_mut(id) else {
            return;
        };
        t.state = RunState::Running;
        t.info.waken = false;
        t.wwake = None;
        t.dispatches += 1;
        self.start_slice(cpu, id);
    }

    /// Arm the round-robin slice of a running thread, if it has none
    pub(crate) fn start_slice(&mut self, cpu: CpuId, id: ThreadId) {
        let Some(t) = self.threads.get(id) else {
            return;
        };
        if !self.rr_enabled || !t.class.is_time_sliced() || self.timer_is_running(t.rrtimer) {
            return;
        }
        let date = self.clock.read_raw() + t.quantum.unwrap_or(self.config.rr_quantum);
        let (rrtimer, prio) = (t.rrtimer, t.cprio);
        if self.arm_timer(rrtimer, date, 0, prio.0).is_err() {
            log::warn!("cpu {}: no room for the time slice of {:?}", cpu, id);
        }
    }

    /// Current thread of `cpu`
    pub fn current(&self, cpu: CpuId) -> Result<ThreadId> {
        self.check_cpu(cpu)?;
        Ok(self.scheds[cpu].current)
    }

    /// Idle thread of `cpu`
    pub fn idle_thread(&self, cpu: CpuId) -> Result<ThreadId> {
        self.check_cpu(cpu)?;
        Ok(self.scheds[cpu].idle)
    }

    /// Is a dispatch pass pending on `cpu`?
    pub fn resched_pending(&self, cpu: CpuId) -> bool {
        self.scheds
            .get(cpu)
            .is_some_and(|s| s.status.contains(SchedStatus::RESCHED))
    }

    /// Ready threads of `cpu` in dispatch order
    pub fn ready_threads(&self, cpu: CpuId) -> Vec<ThreadId> {
        self.scheds
            .get(cpu)
            .map(|s| s.ready.iter().map(|(_, id)| id).collect())
            .unwrap_or_default()
    }

    /// Scheduler of `cpu`
    pub fn scheduler(&self, cpu: CpuId) -> Result<&Scheduler> {
        self.scheds
            .get(cpu)
            .ok_or(Error::InvalidArgument("unknown cpu"))
    }

    /// Forbid preemption of the current thread of `cpu`
    pub fn lock_scheduler(&mut self, cpu: CpuId) -> Result<()> {
        self.check_cpu(cpu)?;
        self.scheds[cpu].lock_depth += 1;
        Ok(())
    }

    /// Undo one [`Kernel::lock_scheduler`]; the outermost unlock runs a
    /// pending dispatch pass
    pub fn unlock_scheduler(&mut self, cpu: CpuId) -> Result<Option<(ThreadId, ThreadId)>> {
        self.check_cpu(cpu)?;
        let sched = &mut self.scheds[cpu];
        if sched.lock_depth == 0 {
            return Err(Error::NotPermitted("scheduler not locked"));
        }
        sched.lock_depth -= 1;
        if sched.lock_depth == 0 && sched.status.contains(SchedStatus::RESCHED) {
            return Ok(self.schedule(cpu));
        }
        Ok(None)
    }

    /// Enter interrupt context on `cpu`
    pub fn irq_enter(&mut self, cpu: CpuId) {
        if let Some(sched) = self.scheds.get_mut(cpu) {
            sched.irq_depth += 1;
        }
    }

    /// Leave interrupt context; the outermost exit runs a pending dispatch
    pub fn irq_exit(&mut self, cpu: CpuId) -> Option<(ThreadId, ThreadId)> {
        let sched = self.scheds.get_mut(cpu)?;
        sched.irq_depth = sched.irq_depth.saturating_sub(1);
        if sched.irq_depth == 0 && sched.status.contains(SchedStatus::RESCHED) {
            return self.schedule(cpu);
        }
        None
    }

    /// Round-robin rotation of one priority level
    ///
    /// `None` rotates the level of the current thread, sending it behind
    /// its peers.
    pub fn rotate_ready_queue(&mut self, cpu: CpuId, prio: Option<Priority>) -> Result<()> {
        self.check_cpu(cpu)?;
        let sched = &mut self.scheds[cpu];
        let curr = sched.current;
        let Some(t) = self.threads.get_mut(curr) else {
            return Err(Error::NoSuchThread);
        };
        let level = prio.unwrap_or(t.cprio);
        let rotate_current =
            t.state == RunState::Running && t.cprio == level && !t.idle && sched.lock_depth == 0;
        if rotate_current {
            t.state = RunState::Ready;
            sched.ready.enqueue(curr, level, QueuePos::Tail);
            sched.status.insert(SchedStatus::RESCHED);
        } else if sched.ready.rotate(level) {
            sched.status.insert(SchedStatus::RESCHED);
        }
        Ok(())
    }

    /// Enable time slicing of round-robin threads
    ///
    /// `Some(quantum)` also overrides the slice of every round-robin thread.
    pub fn activate_rr(&mut self, quantum: Option<Ticks>) -> Result<()> {
        if quantum == Some(0) {
            return Err(Error::InvalidArgument("round-robin quantum must be non-zero"));
        }
        self.rr_enabled = true;
        if quantum.is_some() {
            for id in self.threads.handles() {
                if let Some(t) = self.threads.get_mut(id) {
                    if t.class.is_time_sliced() {
                        t.quantum = quantum;
                    }
                }
            }
        }
        for cpu in 0..self.scheds.len() {
            let curr = self.scheds[cpu].current;
            if self.thread_state(curr) == RunState::Running {
                self.start_slice(cpu, curr);
            }
        }
        log::debug!("round-robin enabled, quantum {:?}", quantum);
        Ok(())
    }

    /// Watchdog period elapsed on `cpu`
    ///
    /// A thread other than idle that keeps the CPU for
    /// [`WATCHDOG_TRIGGER`] periods in a row is deleted.
    pub(crate) fn on_watchdog(&mut self, cpu: CpuId) {
        let Some(sched) = self.scheds.get_mut(cpu) else {
            return;
        };
        if sched.current == sched.idle {
            sched.wd_count = 0;
            return;
        }
        sched.wd_count += 1;
        if sched.wd_count < WATCHDOG_TRIGGER {
            return;
        }
        sched.wd_count = 0;
        let runaway = sched.current;
        log::warn!("cpu {}: watchdog triggered, killing runaway thread {:?}", cpu, runaway);
        if let Err(e) = self.thread_delete(runaway) {
            log::error!("cpu {}: watchdog could not delete {:?}: {}", cpu, runaway, e);
        }
    }

    /// Disable time slicing; running slices are cancelled
    pub fn deactivate_rr(&mut self) {
        self.rr_enabled = false;
        let slices: Vec<_> = self.threads.iter().map(|(_, t)| t.rrtimer).collect();
        for rrtimer in slices {
            self.disarm_timer(rrtimer);
        }
        log::debug!("round-robin disabled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Handle;
    use crate::thread::ThreadParams;

    fn started(k: &mut Kernel, name: &str, prio: i32) -> ThreadId {
        let id = k.thread_init(ThreadParams::new(name, Priority(prio))).unwrap();
        k.thread_start(id).unwrap();
        id
    }

    #[test]
    fn test_ready_queue_order() {
        let mut q = ReadyQueue::new();
        let (a, b, c) = (Handle::new(0, 0), Handle::new(1, 0), Handle::new(2, 0));
        q.enqueue(a, Priority(5), QueuePos::Tail);
        q.enqueue(b, Priority(9), QueuePos::Tail);
        q.enqueue(c, Priority(5), QueuePos::Head);
        assert_eq!(q.len(), 3);
        assert_eq!(q.peek(), Some((Priority(9), b)));
        assert_eq!(q.pop(), Some(b));
        assert_eq!(q.pop(), Some(c));
        assert!(q.remove(a));
        assert!(!q.remove(a));
        assert!(q.is_empty());
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_ready_queue_rotate() {
        let mut q = ReadyQueue::new();
        let (a, b) = (Handle::new(0, 0), Handle::new(1, 0));
        q.enqueue(a, Priority(5), QueuePos::Tail);
        q.enqueue(b, Priority(5), QueuePos::Tail);
        assert!(q.rotate(Priority(5)));
        assert_eq!(q.peek(), Some((Priority(5), b)));
        assert!(!q.rotate(Priority(6)));
    }

    #[test]
    fn test_highest_priority_runs() {
        let mut k = Kernel::testing();
        let low = started(&mut k, "low", 10);
        let high = started(&mut k, "high", 20);
        assert_eq!(k.schedule(0), Some((k.idle_thread(0).unwrap(), high)));
        assert_eq!(k.thread_state(high), RunState::Running);
        assert_eq!(k.ready_threads(0), [low]);
        // Nothing better: no switch
        assert_eq!(k.schedule(0), None);
    }

    #[test]
    fn test_preempted_thread_keeps_its_turn() {
        let mut k = Kernel::testing();
        let a = started(&mut k, "a", 10);
        let b = started(&mut k, "b", 10);
        k.schedule(0);
        assert_eq!(k.current(0).unwrap(), a);
        let urgent = started(&mut k, "urgent", 30);
        k.schedule(0);
        assert_eq!(k.current(0).unwrap(), urgent);
        assert_eq!(k.ready_threads(0), [a, b]);
        k.thread_delete(urgent).unwrap();
        k.schedule(0);
        assert_eq!(k.current(0).unwrap(), a);
    }

    #[test]
    fn test_equal_priority_does_not_preempt() {
        let mut k = Kernel::testing();
        let a = started(&mut k, "a", 10);
        k.schedule(0);
        let _b = started(&mut k, "b", 10);
        assert!(k.resched_pending(0));
        assert_eq!(k.schedule(0), None);
        assert_eq!(k.current(0).unwrap(), a);
    }

    #[test]
    fn test_lock_defers_preemption() {
        let mut k = Kernel::testing();
        let a = started(&mut k, "a", 10);
        k.schedule(0);
        k.lock_scheduler(0).unwrap();
        let b = started(&mut k, "b", 50);
        assert_eq!(k.schedule(0), None);
        assert_eq!(k.current(0).unwrap(), a);
        assert_eq!(k.unlock_scheduler(0), Ok(Some((a, b))));
        assert!(k.unlock_scheduler(0).is_err());
    }

    #[test]
    fn test_lock_depth_follows_thread() {
        let mut k = Kernel::testing();
        let a = started(&mut k, "a", 10);
        let b = started(&mut k, "b", 5);
        k.schedule(0);
        k.lock_scheduler(0).unwrap();
        // Blocking while locked still switches away
        k.thread_suspend(a, crate::thread::BlockMask::SUSPENDED, crate::thread::Timeout::Infinite)
            .unwrap();
        k.schedule(0);
        assert_eq!(k.current(0).unwrap(), b);
        assert_eq!(k.scheduler(0).unwrap().lock_depth(), 0);
        k.thread_resume(a, crate::thread::BlockMask::SUSPENDED).unwrap();
        k.schedule(0);
        assert_eq!(k.current(0).unwrap(), a);
        assert_eq!(k.scheduler(0).unwrap().lock_depth(), 1);
    }

    #[test]
    fn test_no_dispatch_in_irq() {
        let mut k = Kernel::testing();
        k.irq_enter(0);
        let a = started(&mut k, "a", 10);
        assert_eq!(k.schedule(0), None);
        assert_eq!(k.irq_exit(0), Some((k.idle_thread(0).unwrap(), a)));
    }

    #[test]
    fn test_rotate_current() {
        let mut k = Kernel::testing();
        let a = started(&mut k, "a", 10);
        let b = started(&mut k, "b", 10);
        k.schedule(0);
        k.rotate_ready_queue(0, None).unwrap();
        k.schedule(0);
        assert_eq!(k.current(0).unwrap(), b);
        assert_eq!(k.ready_threads(0), [a]);
    }

    #[test]
    fn test_rr_deactivate_stops_slices() {
        let mut k = Kernel::testing();
        let a = k
            .thread_init(ThreadParams::new("a", Priority(5)).round_robin(None))
            .unwrap();
        let b = k
            .thread_init(ThreadParams::new("b", Priority(5)).round_robin(None))
            .unwrap();
        k.thread_start(a).unwrap();
        k.thread_start(b).unwrap();
        k.schedule(0);
        k.deactivate_rr();
        k.run_for(100, 1);
        assert_eq!(k.current(0).unwrap(), a);

        k.activate_rr(Some(4)).unwrap();
        k.tick(0, 104);
        assert_eq!(k.current(0).unwrap(), b);
    }

    #[test]
    fn test_migrate_ready_thread() {
        let mut k = Kernel::new(crate::config::Config::new(2, 0)).unwrap();
        let a = started(&mut k, "a", 10);
        k.thread_migrate(a, 1).unwrap();
        assert!(k.ready_threads(0).is_empty());
        assert_eq!(k.ready_threads(1), [a]);
        assert_eq!(k.reschedule(), [(1, k.idle_thread(1).unwrap(), a)]);
        assert_eq!(k.thread(a).unwrap().cpu(), 1);
    }

    #[test]
    fn test_watchdog_kills_runaway_thread() {
        let config = crate::config::Config::testing().with_watchdog(100);
        let mut k = Kernel::new(config).unwrap();
        assert!(k.scheduler(0).unwrap().watchdog_timer().is_some());
        let hog = started(&mut k, "hog", 5);
        k.schedule(0);
        for now in [100, 200, 300] {
            k.tick(0, now);
        }
        assert_eq!(k.current(0).unwrap(), hog);

        // A trip through idle resets the count
        k.thread_delay(hog, 150).unwrap();
        k.schedule(0);
        k.tick(0, 400);
        k.tick(0, 450);
        for now in [500, 600, 700] {
            k.tick(0, now);
        }
        assert_eq!(k.thread_state(hog), RunState::Running);

        k.tick(0, 800);
        assert_eq!(k.thread_state(hog), RunState::NotCreated);
        assert_eq!(k.current(0), k.idle_thread(0));
        assert!(k.audit().is_ok());
    }

    #[test]
    fn test_unknown_cpu_queries_rejected() {
        let k = Kernel::testing();
        assert!(matches!(k.current(3), Err(Error::InvalidArgument(_))));
        assert!(matches!(k.idle_thread(3), Err(Error::InvalidArgument(_))));
        assert_eq!(k.current(0), k.idle_thread(0));
    }
}
