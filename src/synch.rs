//! Synchronization object — wait queue with optional ownership
//!
//! Plain objects are condition-like: threads sleep on them and are woken
//! one at a time or all at once. Ownership objects are mutex-like: a
//! thread acquires them, and release hands ownership straight to the
//! next waiter.
//!
//! With priority inheritance, the waiters of an owned object form a
//! claim on the owner. A thread's effective priority is the maximum of
//! its base priority and of the best waiter of every object it owns
//! that has waiters. Boosts propagate along chains of owners.
//!
//! Author: Moroya Sakamoto

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use bitflags::bitflags;

use crate::arena::{Arena, Handle};
use crate::error::{Error, Result};
use crate::kernel::Kernel;
use crate::thread::{BlockMask, Priority, Thread, ThreadId, Timeout};

/// Synchronization object handle
pub type SynchId = Handle<Synch>;

bitflags! {
    /// Object behaviour
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SynchFlags: u32 {
        /// Waiters ordered by priority instead of arrival
        const PRIO = 1 << 0;
        /// Object has an owner (acquire/release)
        const OWNER = 1 << 1;
        /// Priority inheritance; implies `PRIO | OWNER`
        const PIP = 1 << 2;
    }
}

/// Why a wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// Woken by the object (signalled, or ownership granted)
    Woken,
    /// Timeout elapsed first
    Timeout,
    /// Object destroyed
    Deleted,
    /// Wait broken from outside
    ForcedWake,
}

/// Outcome of a potentially blocking request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Caller is now blocked; the reason is known once it is woken
    Blocked,
    /// Satisfied without blocking
    Done(WakeReason),
}

/// Synchronization object
pub struct Synch {
    pub(crate) flags: SynchFlags,
    pub(crate) owner: Option<ThreadId>,
    pub(crate) waiters: VecDeque<ThreadId>,
    /// Waiters currently boost the owner
    pub(crate) claimed: bool,
}

impl Synch {
    fn new(flags: SynchFlags) -> Self {
        let flags = if flags.contains(SynchFlags::PIP) {
            flags | SynchFlags::PRIO | SynchFlags::OWNER
        } else {
            flags
        };
        Self {
            flags,
            owner: None,
            waiters: VecDeque::new(),
            claimed: false,
        }
    }

    /// Behaviour flags
    pub fn flags(&self) -> SynchFlags {
        self.flags
    }

    /// Current owner
    pub fn owner(&self) -> Option<ThreadId> {
        self.owner
    }

    /// Waiters in wakeup order
    pub fn waiters(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.waiters.iter().copied()
    }

    /// Any waiter?
    pub fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }

    /// Are the waiters boosting the owner?
    pub fn is_claimed(&self) -> bool {
        self.claimed
    }
}

/// Insert `tid` in wakeup order: by priority (after equals) or at the tail
fn enqueue_waiter(threads: &Arena<Thread>, waiters: &mut VecDeque<ThreadId>, tid: ThreadId, by_prio: bool) {
    if !by_prio {
        waiters.push_back(tid);
        return;
    }
    let prio = |id: ThreadId| threads.get(id).map_or(Priority::IDLE, Thread::priority);
    let p = prio(tid);
    let pos = waiters
        .iter()
        .position(|&w| prio(w) < p)
        .unwrap_or(waiters.len());
    waiters.insert(pos, tid);
}

impl Kernel {
    /// Create a synchronization object
    pub fn synch_init(&mut self, flags: SynchFlags) -> SynchId {
        let id = self.synchs.insert(Synch::new(flags));
        log::trace!("synch {:?} created: {:?}", id, flags);
        id
    }

    /// Destroy an object, waking every waiter with [`WakeReason::Deleted`]
    ///
    /// Returns whether a thread was woken.
    pub fn synch_destroy(&mut self, id: SynchId) -> Result<bool> {
        let woken = self.synch_flush(id, WakeReason::Deleted)?;
        if let Some(synch) = self.synchs.remove(id) {
            if let Some(owner) = synch.owner.and_then(|o| self.threads.get_mut(o)) {
                owner.owned.retain(|&s| s != id);
            }
        }
        log::debug!("synch {:?} destroyed", id);
        Ok(woken)
    }

    /// Block `tid` on a plain object
    pub fn synch_sleep_on(&mut self, id: SynchId, tid: ThreadId, timeout: Timeout) -> Result<Wait> {
        if self.synch_ref(id)?.flags.contains(SynchFlags::OWNER) {
            return Err(Error::NotPermitted("ownership objects are acquired, not slept on"));
        }
        self.check_can_wait(tid, "sleep_on")?;
        let deadline = timeout.deadline(self.clock.read_raw())?;
        self.suspend_inner(tid, BlockMask::PENDING, deadline, Some(id))?;
        let synch = self.synchs.get_mut(id).ok_or(Error::NoSuchSynch)?;
        let by_prio = synch.flags.contains(SynchFlags::PRIO);
        enqueue_waiter(&self.threads, &mut synch.waiters, tid, by_prio);
        log::trace!("thread {:?} sleeps on {:?}", tid, id);
        Ok(Wait::Blocked)
    }

    /// Wake the first waiter of a plain object
    pub fn synch_wakeup_one(&mut self, id: SynchId) -> Result<Option<ThreadId>> {
        let synch = self.synch_mut(id)?;
        if synch.flags.contains(SynchFlags::OWNER) {
            return Err(Error::NotPermitted("ownership objects hand over on release"));
        }
        let Some(tid) = synch.waiters.pop_front() else {
            return Ok(None);
        };
        if let Some(t) = self.threads.get_mut(tid) {
            t.wchan = None;
        }
        self.resume_inner(tid, BlockMask::PENDING);
        Ok(Some(tid))
    }

    /// Wake a specific waiter of a plain object
    pub fn synch_wakeup_this(&mut self, id: SynchId, tid: ThreadId) -> Result<()> {
        let synch = self.synch_mut(id)?;
        if synch.flags.contains(SynchFlags::OWNER) {
            return Err(Error::NotPermitted("ownership objects hand over on release"));
        }
        let pos = synch
            .waiters
            .iter()
            .position(|&w| w == tid)
            .ok_or(Error::InvalidArgument("thread is not waiting on this object"))?;
        synch.waiters.remove(pos);
        if let Some(t) = self.threads.get_mut(tid) {
            t.wchan = None;
        }
        self.resume_inner(tid, BlockMask::PENDING);
        Ok(())
    }

    /// Wake every waiter with `reason`; an owner's boost is dropped
    ///
    /// Returns whether a thread was woken.
    pub fn synch_flush(&mut self, id: SynchId, reason: WakeReason) -> Result<bool> {
        let synch = self.synch_mut(id)?;
        let waiters: Vec<ThreadId> = synch.waiters.drain(..).collect();
        for &tid in &waiters {
            if let Some(t) = self.threads.get_mut(tid) {
                t.wchan = None;
                match reason {
                    WakeReason::Woken => {}
                    WakeReason::Timeout => t.info.timed_out = true,
                    WakeReason::Deleted => t.info.removed = true,
                    WakeReason::ForcedWake => t.info.forced_wake = true,
                }
            }
            self.resume_inner(tid, BlockMask::PENDING);
        }
        self.update_claim(id);
        if !waiters.is_empty() {
            log::trace!("synch {:?} flushed {} waiters: {:?}", id, waiters.len(), reason);
        }
        Ok(!waiters.is_empty())
    }

    /// Acquire an ownership object on behalf of `tid`
    ///
    /// A free object is taken at once. A higher-priority requester steals
    /// an object that was handed to a thread not yet running.
    pub fn synch_acquire(&mut self, id: SynchId, tid: ThreadId, timeout: Timeout) -> Result<Wait> {
        let synch = self.synch_ref(id)?;
        if !synch.flags.contains(SynchFlags::OWNER) {
            return Err(Error::NotPermitted("plain objects have no owner"));
        }
        let (owner, flags) = (synch.owner, synch.flags);
        self.check_can_wait(tid, "acquire")?;
        let Some(owner) = owner else {
            self.grant(id, tid);
            return Ok(Wait::Done(WakeReason::Woken));
        };
        if owner == tid {
            return Err(Error::state("recursive acquire", self.thread_state(tid)));
        }
        let deadline = timeout.deadline(self.clock.read_raw())?;

        let (mine, theirs) = (self.thread_ref(tid)?, self.thread_ref(owner)?);
        if flags.contains(SynchFlags::PRIO)
            && mine.cprio > theirs.cprio
            && theirs.info.waken
            && theirs.wwake == Some(id)
        {
            self.steal(id, tid, owner);
            return Ok(Wait::Done(WakeReason::Woken));
        }

        self.suspend_inner(tid, BlockMask::PENDING, deadline, Some(id))?;
        let synch = self.synchs.get_mut(id).ok_or(Error::NoSuchSynch)?;
        enqueue_waiter(&self.threads, &mut synch.waiters, tid, flags.contains(SynchFlags::PRIO));
        self.update_claim(id);
        log::trace!("thread {:?} waits for {:?} owned by {:?}", tid, id, owner);
        Ok(Wait::Blocked)
    }

    /// Release an ownership object, handing it to the first waiter
    pub fn synch_release(&mut self, id: SynchId, tid: ThreadId) -> Result<Option<ThreadId>> {
        let synch = self.synch_ref(id)?;
        if !synch.flags.contains(SynchFlags::OWNER) {
            return Err(Error::NotPermitted("plain objects have no owner"));
        }
        if synch.owner != Some(tid) {
            return Err(Error::state("release by non-owner", self.thread_state(tid)));
        }
        let next = self.release_inner(id, tid);
        let deferred = self
            .threads
            .get(tid)
            .is_some_and(|t| t.delete_pending && t.claims.is_empty());
        if deferred {
            self.finalize_delete(tid);
        }
        Ok(next)
    }

    /// Current owner
    pub fn synch_owner(&self, id: SynchId) -> Result<Option<ThreadId>> {
        self.synch_ref(id).map(Synch::owner)
    }

    /// First waiter, without waking it
    pub fn synch_peek(&self, id: SynchId) -> Result<Option<ThreadId>> {
        Ok(self.synch_ref(id)?.waiters.front().copied())
    }

    /// Waiters in wakeup order
    pub fn synch_waiters(&self, id: SynchId) -> Result<Vec<ThreadId>> {
        Ok(self.synch_ref(id)?.waiters().collect())
    }

    /// Object by handle
    pub fn synch(&self, id: SynchId) -> Result<&Synch> {
        self.synch_ref(id)
    }

    fn check_can_wait(&self, tid: ThreadId, op: &'static str) -> Result<()> {
        let t = self.thread_ref(tid)?;
        if t.idle {
            return Err(Error::NotPermitted("idle thread cannot block"));
        }
        if !t.is_runnable() {
            return Err(Error::state(op, t.state));
        }
        Ok(())
    }

    fn grant(&mut self, id: SynchId, tid: ThreadId) {
        if let Some(synch) = self.synchs.get_mut(id) {
            synch.owner = Some(tid);
        }
        if let Some(t) = self.threads.get_mut(tid) {
            t.owned.push(id);
        }
        log::trace!("thread {:?} owns {:?}", tid, id);
    }

    /// Take ownership from a thread that was granted it but never ran
    fn steal(&mut self, id: SynchId, tid: ThreadId, robbed: ThreadId) {
        let Some(synch) = self.synchs.get_mut(id) else {
            return;
        };
        let claimed = core::mem::take(&mut synch.claimed);
        synch.owner = None;
        let mut deadline = None;
        if let Some(r) = self.threads.get_mut(robbed) {
            r.owned.retain(|&s| s != id);
            if claimed {
                r.claims.retain(|&s| s != id);
            }
            r.info.waken = false;
            r.wwake = None;
            deadline = r.wait_deadline;
        }
        self.grant(id, tid);

        let now = self.clock.read_raw();
        let requeued = !deadline.is_some_and(|d| d <= now)
            && self
                .suspend_inner(robbed, BlockMask::PENDING, deadline, Some(id))
                .is_ok();
        if requeued {
            if let Some(synch) = self.synchs.get_mut(id) {
                enqueue_waiter(&self.threads, &mut synch.waiters, robbed, true);
            }
        } else if let Some(r) = self.threads.get_mut(robbed) {
            // Its wait is over: the robbed thread leaves empty-handed
            r.info.timed_out = true;
        }
        if let Some(r) = self.threads.get_mut(robbed) {
            r.info.robbed = true;
        }
        self.update_claim(id);
        self.recompute_priority(robbed);
        log::debug!("thread {:?} stole {:?} from {:?}", tid, id, robbed);
    }

    /// Hand ownership to the next waiter; returns the new owner
    pub(crate) fn release_inner(&mut self, id: SynchId, tid: ThreadId) -> Option<ThreadId> {
        let synch = self.synchs.get_mut(id)?;
        let claimed = core::mem::take(&mut synch.claimed);
        let next = synch.waiters.pop_front();
        synch.owner = next;
        if let Some(t) = self.threads.get_mut(tid) {
            t.owned.retain(|&s| s != id);
            if claimed {
                t.claims.retain(|&s| s != id);
            }
        }
        if let Some(n) = next {
            if let Some(t) = self.threads.get_mut(n) {
                t.wchan = None;
                t.owned.push(id);
                t.wwake = Some(id);
                t.info.waken = true;
            }
            self.resume_inner(n, BlockMask::PENDING);
        }
        self.update_claim(id);
        self.recompute_priority(tid);
        log::trace!("thread {:?} released {:?} to {:?}", tid, id, next);
        next
    }

    /// Release everything a dying thread owns
    pub(crate) fn release_all_ownerships(&mut self, tid: ThreadId) {
        let owned = self
            .threads
            .get(tid)
            .map(|t| t.owned.clone())
            .unwrap_or_default();
        for id in owned {
            self.release_inner(id, tid);
        }
    }

    /// Remove a waiter whose wait ended by timeout, cancellation or deletion
    pub(crate) fn forget_sleeper(&mut self, tid: ThreadId) {
        let Some(id) = self.threads.get_mut(tid).and_then(|t| t.wchan.take()) else {
            return;
        };
        if let Some(synch) = self.synchs.get_mut(id) {
            synch.waiters.retain(|&w| w != tid);
        }
        self.update_claim(id);
    }

    /// Reposition a waiter after its priority changed
    pub(crate) fn requeue_sleeper(&mut self, tid: ThreadId, id: SynchId) {
        let Some(synch) = self.synchs.get_mut(id) else {
            return;
        };
        if synch.flags.contains(SynchFlags::PRIO) {
            synch.waiters.retain(|&w| w != tid);
            enqueue_waiter(&self.threads, &mut synch.waiters, tid, true);
        }
        self.update_claim(id);
    }

    /// Sync the owner's claim with the waiter list, then its priority
    pub(crate) fn update_claim(&mut self, id: SynchId) {
        let Some(synch) = self.synchs.get_mut(id) else {
            return;
        };
        if !synch.flags.contains(SynchFlags::PIP) {
            return;
        }
        let Some(owner) = synch.owner else {
            return;
        };
        let wanted = !synch.waiters.is_empty();
        if wanted != synch.claimed {
            synch.claimed = wanted;
            if let Some(t) = self.threads.get_mut(owner) {
                if wanted {
                    t.claims.push(id);
                } else {
                    t.claims.retain(|&s| s != id);
                }
            }
        }
        self.recompute_priority(owner);
    }

    /// Priority a claimed object lends its owner
    pub(crate) fn claim_priority(&self, id: SynchId) -> Option<Priority> {
        let synch = self.synchs.get(id)?;
        synch
            .waiters
            .iter()
            .filter_map(|&w| self.threads.get(w).map(Thread::priority))
            .max()
    }

    /// Effective priority = max(base, every claim)
    pub(crate) fn recompute_priority(&mut self, tid: ThreadId) {
        let Some(t) = self.threads.get(tid) else {
            return;
        };
        let target = t
            .claims
            .iter()
            .filter_map(|&s| self.claim_priority(s))
            .fold(t.bprio, Priority::max);
        self.renice_inner(tid, target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::thread::{Deletion, RunState, ThreadParams};
    use crate::timerq::{QueueKind, TIMER_HEAP_CAPACITY};

    fn started(k: &mut Kernel, name: &str, prio: i32) -> ThreadId {
        let id = k.thread_init(ThreadParams::new(name, Priority(prio))).unwrap();
        k.thread_start(id).unwrap();
        id
    }

    fn prio(k: &Kernel, id: ThreadId) -> i32 {
        k.thread(id).unwrap().priority().0
    }

    #[test]
    fn test_fifo_wakeup_order() {
        let mut k = Kernel::testing();
        let s = k.synch_init(SynchFlags::empty());
        let a = started(&mut k, "a", 10);
        let b = started(&mut k, "b", 30);
        k.synch_sleep_on(s, a, Timeout::Infinite).unwrap();
        k.synch_sleep_on(s, b, Timeout::Infinite).unwrap();
        assert_eq!(k.synch_wakeup_one(s), Ok(Some(a)));
        assert_eq!(k.synch_wakeup_one(s), Ok(Some(b)));
        assert_eq!(k.synch_wakeup_one(s), Ok(None));
        assert_eq!(k.thread_wake_reason(a), Ok(WakeReason::Woken));
    }

    #[test]
    fn test_priority_wakeup_order() {
        let mut k = Kernel::testing();
        let s = k.synch_init(SynchFlags::PRIO);
        let a = started(&mut k, "a", 10);
        let b = started(&mut k, "b", 30);
        let c = started(&mut k, "c", 30);
        for t in [a, b, c] {
            k.synch_sleep_on(s, t, Timeout::Infinite).unwrap();
        }
        // Equal priorities keep arrival order
        assert_eq!(k.synch_waiters(s), Ok(alloc::vec![b, c, a]));
        assert_eq!(k.synch_peek(s), Ok(Some(b)));
    }

    #[test]
    fn test_renice_reorders_waiters() {
        let mut k = Kernel::testing();
        let s = k.synch_init(SynchFlags::PRIO);
        let a = started(&mut k, "a", 10);
        let b = started(&mut k, "b", 20);
        k.synch_sleep_on(s, a, Timeout::Infinite).unwrap();
        k.synch_sleep_on(s, b, Timeout::Infinite).unwrap();
        k.thread_set_priority(a, Priority(30)).unwrap();
        assert_eq!(k.synch_waiters(s), Ok(alloc::vec![a, b]));
    }

    #[test]
    fn test_timed_sleep_expires() {
        let mut k = Kernel::testing();
        let s = k.synch_init(SynchFlags::empty());
        let a = started(&mut k, "a", 10);
        k.synch_sleep_on(s, a, Timeout::Relative(100)).unwrap();
        k.tick(0, 100);
        assert_eq!(k.thread_wake_reason(a), Ok(WakeReason::Timeout));
        assert!(!k.synch(s).unwrap().has_waiters());
        assert_eq!(k.thread(a).unwrap().wchan(), None);
    }

    #[test]
    fn test_wakeup_this() {
        let mut k = Kernel::testing();
        let s = k.synch_init(SynchFlags::empty());
        let a = started(&mut k, "a", 10);
        let b = started(&mut k, "b", 10);
        k.synch_sleep_on(s, a, Timeout::Infinite).unwrap();
        k.synch_sleep_on(s, b, Timeout::Infinite).unwrap();
        k.synch_wakeup_this(s, b).unwrap();
        assert_eq!(k.thread_state(b), RunState::Ready);
        assert_eq!(k.synch_waiters(s), Ok(alloc::vec![a]));
        assert!(k.synch_wakeup_this(s, b).is_err());
    }

    #[test]
    fn test_destroy_wakes_with_deleted() {
        let mut k = Kernel::testing();
        let s = k.synch_init(SynchFlags::empty());
        let a = started(&mut k, "a", 10);
        k.synch_sleep_on(s, a, Timeout::Relative(1_000)).unwrap();
        assert_eq!(k.synch_destroy(s), Ok(true));
        assert_eq!(k.thread_wake_reason(a), Ok(WakeReason::Deleted));
        assert!(!k.timer_is_running(k.thread(a).unwrap().resource_timer()));
        assert_eq!(k.synch_peek(s), Err(Error::NoSuchSynch));
    }

    #[test]
    fn test_nonblocking_acquire_would_block() {
        let mut k = Kernel::testing();
        let m = k.synch_init(SynchFlags::PIP);
        let a = started(&mut k, "a", 10);
        let b = started(&mut k, "b", 20);
        assert_eq!(
            k.synch_acquire(m, a, Timeout::NonBlocking),
            Ok(Wait::Done(WakeReason::Woken))
        );
        assert_eq!(k.synch_acquire(m, b, Timeout::NonBlocking), Err(Error::WouldBlock));
        assert_eq!(prio(&k, a), 10);
    }

    #[test]
    fn test_recursive_acquire_and_foreign_release() {
        let mut k = Kernel::testing();
        let m = k.synch_init(SynchFlags::OWNER);
        let a = started(&mut k, "a", 10);
        let b = started(&mut k, "b", 10);
        k.synch_acquire(m, a, Timeout::Infinite).unwrap();
        assert!(matches!(
            k.synch_acquire(m, a, Timeout::Infinite),
            Err(Error::InvalidState { .. })
        ));
        assert!(matches!(
            k.synch_release(m, b),
            Err(Error::InvalidState { .. })
        ));
        assert!(k.synch_sleep_on(m, b, Timeout::Infinite).is_err());
    }

    #[test]
    fn test_release_hands_over() {
        let mut k = Kernel::testing();
        let m = k.synch_init(SynchFlags::OWNER);
        let a = started(&mut k, "a", 10);
        let b = started(&mut k, "b", 10);
        k.synch_acquire(m, a, Timeout::Infinite).unwrap();
        assert_eq!(k.synch_acquire(m, b, Timeout::Infinite), Ok(Wait::Blocked));
        assert_eq!(k.synch_release(m, a), Ok(Some(b)));
        assert_eq!(k.synch_owner(m), Ok(Some(b)));
        assert_eq!(k.thread_state(b), RunState::Ready);
        assert!(k.thread(b).unwrap().info().waken);
        assert_eq!(k.synch_release(m, b), Ok(None));
        assert_eq!(k.synch_owner(m), Ok(None));
    }

    #[test]
    fn test_inheritance_boost_and_revert() {
        let mut k = Kernel::testing();
        let m = k.synch_init(SynchFlags::PIP);
        let low = started(&mut k, "low", 10);
        let high = started(&mut k, "high", 50);
        k.synch_acquire(m, low, Timeout::Infinite).unwrap();
        k.synch_acquire(m, high, Timeout::Infinite).unwrap();
        assert_eq!(prio(&k, low), 50);
        assert!(k.thread(low).unwrap().is_boosted());
        assert!(k.synch(m).unwrap().is_claimed());

        k.synch_release(m, low).unwrap();
        assert_eq!(prio(&k, low), 10);
        assert!(!k.thread(low).unwrap().is_boosted());
        assert_eq!(k.synch_owner(m), Ok(Some(high)));
    }

    #[test]
    fn test_base_change_keeps_boost() {
        let mut k = Kernel::testing();
        let m = k.synch_init(SynchFlags::PIP);
        let low = started(&mut k, "low", 10);
        let high = started(&mut k, "high", 50);
        k.synch_acquire(m, low, Timeout::Infinite).unwrap();
        k.synch_acquire(m, high, Timeout::Infinite).unwrap();
        k.thread_set_priority(low, Priority(20)).unwrap();
        assert_eq!(prio(&k, low), 50);
        k.thread_set_priority(low, Priority(70)).unwrap();
        assert_eq!(prio(&k, low), 70);
        k.synch_release(m, low).unwrap();
        assert_eq!(prio(&k, low), 70);
    }

    #[test]
    fn test_inheritance_chain() {
        let mut k = Kernel::testing();
        let m1 = k.synch_init(SynchFlags::PIP);
        let m2 = k.synch_init(SynchFlags::PIP);
        let low = started(&mut k, "low", 10);
        let mid = started(&mut k, "mid", 20);
        let high = started(&mut k, "high", 30);
        k.synch_acquire(m1, low, Timeout::Infinite).unwrap();
        k.synch_acquire(m2, mid, Timeout::Infinite).unwrap();
        k.synch_acquire(m1, mid, Timeout::Infinite).unwrap();
        assert_eq!(prio(&k, low), 20);
        k.synch_acquire(m2, high, Timeout::Infinite).unwrap();
        assert_eq!(prio(&k, mid), 30);
        assert_eq!(prio(&k, low), 30);

        // The top waiter gives up: the whole chain drops back
        assert_eq!(k.thread_cancel(high), Ok(true));
        assert_eq!(k.thread_wake_reason(high), Ok(WakeReason::ForcedWake));
        assert_eq!(prio(&k, mid), 20);
        assert_eq!(prio(&k, low), 20);
    }

    #[test]
    fn test_timed_out_waiter_drops_boost() {
        let mut k = Kernel::testing();
        let m = k.synch_init(SynchFlags::PIP);
        let low = started(&mut k, "low", 10);
        let high = started(&mut k, "high", 40);
        k.synch_acquire(m, low, Timeout::Infinite).unwrap();
        k.synch_acquire(m, high, Timeout::Relative(20)).unwrap();
        assert_eq!(prio(&k, low), 40);
        k.tick(0, 20);
        assert_eq!(k.thread_wake_reason(high), Ok(WakeReason::Timeout));
        assert_eq!(prio(&k, low), 10);
        assert_eq!(k.synch_owner(m), Ok(Some(low)));
    }

    #[test]
    fn test_steal_from_undispatched_owner() {
        let mut k = Kernel::testing();
        let m = k.synch_init(SynchFlags::PIP);
        let holder = started(&mut k, "holder", 10);
        let waiter = started(&mut k, "waiter", 10);
        let thief = started(&mut k, "thief", 40);
        k.synch_acquire(m, holder, Timeout::Infinite).unwrap();
        k.synch_acquire(m, waiter, Timeout::Infinite).unwrap();
        k.synch_release(m, holder).unwrap();
        assert_eq!(k.synch_owner(m), Ok(Some(waiter)));

        assert_eq!(
            k.synch_acquire(m, thief, Timeout::Infinite),
            Ok(Wait::Done(WakeReason::Woken))
        );
        assert_eq!(k.synch_owner(m), Ok(Some(thief)));
        let w = k.thread(waiter).unwrap();
        assert_eq!(w.state(), RunState::Blocked);
        assert!(w.info().robbed);
        assert_eq!(k.synch_waiters(m), Ok(alloc::vec![waiter]));
        // The robbed thread now boosts nobody but still waits
        assert_eq!(prio(&k, thief), 40);
    }

    #[test]
    fn test_no_steal_once_dispatched() {
        let mut k = Kernel::testing();
        let m = k.synch_init(SynchFlags::PIP);
        let holder = started(&mut k, "holder", 10);
        let waiter = started(&mut k, "waiter", 20);
        k.synch_acquire(m, holder, Timeout::Infinite).unwrap();
        k.synch_acquire(m, waiter, Timeout::Infinite).unwrap();
        k.synch_release(m, holder).unwrap();
        k.schedule(0);
        assert_eq!(k.current(0).unwrap(), waiter);

        let thief = started(&mut k, "thief", 40);
        assert_eq!(k.synch_acquire(m, thief, Timeout::Infinite), Ok(Wait::Blocked));
        assert_eq!(k.synch_owner(m), Ok(Some(waiter)));
        assert_eq!(prio(&k, waiter), 40);
    }

    #[test]
    fn test_deferred_delete_of_boosted_owner() {
        let mut k = Kernel::testing();
        let m = k.synch_init(SynchFlags::PIP);
        let low = started(&mut k, "low", 10);
        let high = started(&mut k, "high", 50);
        k.synch_acquire(m, low, Timeout::Infinite).unwrap();
        k.synch_acquire(m, high, Timeout::Infinite).unwrap();

        assert_eq!(k.thread_delete(low), Ok(Deletion::Deferred));
        assert!(k.thread(low).unwrap().is_delete_pending());
        assert_eq!(k.thread_state(low), RunState::Ready);

        k.synch_release(m, low).unwrap();
        assert_eq!(k.thread_state(low), RunState::NotCreated);
        assert_eq!(k.synch_owner(m), Ok(Some(high)));
    }

    #[test]
    fn test_deferred_delete_resumes_suspended_owner() {
        let mut k = Kernel::testing();
        let m = k.synch_init(SynchFlags::PIP);
        let low = started(&mut k, "low", 1);
        let high = started(&mut k, "high", 9);
        k.synch_acquire(m, low, Timeout::Infinite).unwrap();
        k.synch_acquire(m, high, Timeout::Infinite).unwrap();
        k.thread_suspend(low, BlockMask::SUSPENDED, Timeout::Infinite).unwrap();

        assert_eq!(k.thread_delete(low), Ok(Deletion::Deferred));
        assert_eq!(k.thread_state(low), RunState::Ready);
        assert!(k.thread(low).unwrap().block_mask().is_empty());
        assert!(matches!(
            k.thread_suspend(low, BlockMask::SUSPENDED, Timeout::Infinite),
            Err(Error::NotPermitted(_))
        ));
        k.schedule(0);
        assert_eq!(k.current(0), Ok(low));

        k.synch_release(m, low).unwrap();
        assert!(matches!(
            k.thread_state(low),
            RunState::Zombie | RunState::NotCreated
        ));
        assert_eq!(k.synch_owner(m), Ok(Some(high)));
        k.schedule(0);
        assert_eq!(k.current(0), Ok(high));
        assert!(k.audit().is_ok());
    }

    #[test]
    fn test_full_timer_queue_leaves_sleeper_ready() {
        let config = Config::testing().with_timer_queue(QueueKind::Heap);
        let mut k = Kernel::new(config).unwrap();
        let s = k.synch_init(SynchFlags::empty());
        for _ in 0..TIMER_HEAP_CAPACITY {
            let t = started(&mut k, "sleeper", 5);
            assert_eq!(k.synch_sleep_on(s, t, Timeout::Relative(1_000)), Ok(Wait::Blocked));
        }
        let last = started(&mut k, "last", 5);
        assert_eq!(
            k.synch_sleep_on(s, last, Timeout::Relative(1_000)),
            Err(Error::Busy)
        );
        assert_eq!(k.thread_state(last), RunState::Ready);
        assert_eq!(k.thread(last).unwrap().wchan(), None);
        assert!(!k.synch_waiters(s).unwrap().contains(&last));
        assert!(k.audit().is_ok());

        // Same for a timed acquire
        let m = k.synch_init(SynchFlags::PIP);
        let owner = started(&mut k, "owner", 1);
        k.synch_acquire(m, owner, Timeout::Infinite).unwrap();
        assert_eq!(
            k.synch_acquire(m, last, Timeout::Relative(1_000)),
            Err(Error::Busy)
        );
        assert_eq!(k.thread_state(last), RunState::Ready);
        assert!(k.synch_waiters(m).unwrap().is_empty());
        assert_eq!(k.thread(owner).unwrap().priority(), Priority(1));

        // An untimed wait needs no timer slot
        assert_eq!(k.synch_sleep_on(s, last, Timeout::Infinite), Ok(Wait::Blocked));
        assert!(k.audit().is_ok());
    }

    #[test]
    fn test_delete_releases_ownerships() {
        let mut k = Kernel::testing();
        let m = k.synch_init(SynchFlags::OWNER);
        let a = started(&mut k, "a", 10);
        k.synch_acquire(m, a, Timeout::Infinite).unwrap();
        assert_eq!(k.thread_delete(a), Ok(Deletion::Completed));
        assert_eq!(k.synch_owner(m), Ok(None));
    }

    #[test]
    fn test_delete_waiter_leaves_queue() {
        let mut k = Kernel::testing();
        let m = k.synch_init(SynchFlags::PIP);
        let low = started(&mut k, "low", 10);
        let high = started(&mut k, "high", 50);
        k.synch_acquire(m, low, Timeout::Infinite).unwrap();
        k.synch_acquire(m, high, Timeout::Infinite).unwrap();
        k.thread_delete(high).unwrap();
        assert!(k.synch_waiters(m).unwrap().is_empty());
        assert_eq!(prio(&k, low), 10);
    }
}
