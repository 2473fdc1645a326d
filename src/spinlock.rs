//! Nucleus spinlock — cross-CPU mutual exclusion with recursion detection
//!
//! A single atomic word holds either the "unlocked" sentinel or the id of
//! the owning CPU. Re-acquiring on the owning CPU yields a recursive
//! token instead of spinning, so only the outermost release unlocks.
//!
//! Interrupt masking is modelled by [`IrqStall`]: a per-CPU
//! preemption-disable barrier the tick source honours. Without the
//! `smp` feature the lock degrades to stalling alone, with no atomic
//! read-modify-write.
//!
//! Author: Moroya Sakamoto

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[cfg(feature = "debug-spin")]
use core::sync::atomic::AtomicU64;

/// CPU identifier (dense, starting at 0)
pub type CpuId = usize;

/// Upper bound on CPUs a nucleus instance may drive
pub const MAX_CPUS: usize = 64;

/// Owner word value of a free lock
const UNLOCKED: usize = usize::MAX;

/// Spin iterations after which a waiter is reported as stuck
#[cfg(feature = "debug-spin")]
pub const DEBUG_SPIN_LIMIT: u64 = 3_000_000;

/// Outcome of an acquisition
#[must_use = "the token must be handed back to release()"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockToken {
    /// Outermost acquisition: release() unlocks
    Acquired,
    /// Caller already owned the lock: release() is a no-op
    Recursive,
}

impl LockToken {
    /// Was this a nested acquisition?
    pub fn is_recursive(&self) -> bool {
        *self == LockToken::Recursive
    }
}

/// Saved state of an irqsave acquisition
#[must_use = "the saved state must be handed back to release_irqrestore()"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spl {
    /// Lock token
    pub token: LockToken,
    /// Was delivery already stalled on this CPU?
    pub was_stalled: bool,
}

/// Per-CPU interrupt delivery barrier
///
/// While a CPU is stalled its tick deliveries are latched as pending and
/// replayed by the owner of the barrier once delivery is restored.
pub struct IrqStall {
    stalled: Vec<AtomicBool>,
    pending: Vec<AtomicBool>,
}

impl IrqStall {
    /// Barrier for `cpus` CPUs, all delivering
    pub fn new(cpus: usize) -> Self {
        Self {
            stalled: (0..cpus).map(|_| AtomicBool::new(false)).collect(),
            pending: (0..cpus).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    /// Stall delivery on `cpu`, returning the previous state
    pub fn stall(&self, cpu: CpuId) -> bool {
        self.stalled[cpu].swap(true, Ordering::AcqRel)
    }

    /// Restore the state returned by [`IrqStall::stall`]
    pub fn restore(&self, cpu: CpuId, was_stalled: bool) {
        self.stalled[cpu].store(was_stalled, Ordering::Release);
    }

    /// Is delivery currently stalled on `cpu`?
    pub fn is_stalled(&self, cpu: CpuId) -> bool {
        self.stalled[cpu].load(Ordering::Acquire)
    }

    /// Latch a delivery that arrived while stalled
    pub fn latch(&self, cpu: CpuId) {
        self.pending[cpu].store(true, Ordering::Release);
    }

    /// Consume the latched delivery, if any
    pub fn take_pending(&self, cpu: CpuId) -> bool {
        self.pending[cpu].swap(false, Ordering::AcqRel)
    }

    /// Number of CPUs covered
    pub fn cpus(&self) -> usize {
        self.stalled.len()
    }
}

/// Spin statistics (debug builds of the lock)
#[cfg(feature = "debug-spin")]
#[derive(Debug, Default)]
pub struct SpinStats {
    /// Longest observed busy-wait (iterations)
    pub max_spins: AtomicU64,
    /// Number of acquisitions that had to wait
    pub contended: AtomicU64,
}

/// Cross-CPU spinlock
pub struct SpinLock {
    owner: AtomicUsize,
    #[cfg(feature = "debug-spin")]
    stats: SpinStats,
}

impl SpinLock {
    /// Create an unlocked spinlock
    pub const fn new() -> Self {
        Self {
            owner: AtomicUsize::new(UNLOCKED),
            #[cfg(feature = "debug-spin")]
            stats: SpinStats {
                max_spins: AtomicU64::new(0),
                contended: AtomicU64::new(0),
            },
        }
    }

    /// Acquire on behalf of `cpu`, spinning while another CPU owns it
    #[cfg(feature = "smp")]
    pub fn acquire(&self, cpu: CpuId) -> LockToken {
        if self.owner.load(Ordering::Relaxed) == cpu {
            return LockToken::Recursive;
        }

        let mut spins: u64 = 0;
        while self
            .owner
            .compare_exchange_weak(UNLOCKED, cpu, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // Non-locking test in the inner loop
            while self.owner.load(Ordering::Relaxed) != UNLOCKED {
                core::hint::spin_loop();
                spins += 1;
                #[cfg(feature = "debug-spin")]
                if spins == DEBUG_SPIN_LIMIT {
                    log::error!(
                        "stuck on nucleus lock: waiter cpu {}, owner cpu {}",
                        cpu,
                        self.owner.load(Ordering::Relaxed)
                    );
                }
            }
        }

        #[cfg(feature = "debug-spin")]
        self.record_spins(spins);
        #[cfg(not(feature = "debug-spin"))]
        let _ = spins;

        LockToken::Acquired
    }

    /// Uniprocessor acquisition: nothing to arbitrate
    #[cfg(not(feature = "smp"))]
    pub fn acquire(&self, _cpu: CpuId) -> LockToken {
        LockToken::Acquired
    }

    /// Acquire without spinning
    #[cfg(feature = "smp")]
    pub fn try_acquire(&self, cpu: CpuId) -> Option<LockToken> {
        if self.owner.load(Ordering::Relaxed) == cpu {
            return Some(LockToken::Recursive);
        }
        self.owner
            .compare_exchange(UNLOCKED, cpu, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| LockToken::Acquired)
    }

    /// Uniprocessor: always succeeds
    #[cfg(not(feature = "smp"))]
    pub fn try_acquire(&self, _cpu: CpuId) -> Option<LockToken> {
        Some(LockToken::Acquired)
    }

    /// Release an acquisition made by `cpu`
    pub fn release(&self, cpu: CpuId, token: LockToken) {
        if token.is_recursive() {
            return;
        }
        #[cfg(feature = "smp")]
        {
            let owner = self.owner.load(Ordering::Relaxed);
            if owner != cpu {
                log::error!("nucleus lock released by cpu {} but owned by {}", cpu, owner);
                return;
            }
            self.owner.store(UNLOCKED, Ordering::Release);
        }
        #[cfg(not(feature = "smp"))]
        let _ = cpu;
    }

    /// Stall local delivery, then acquire, as one unit
    pub fn acquire_irqsave(&self, cpu: CpuId, irqs: &IrqStall) -> Spl {
        let was_stalled = irqs.stall(cpu);
        let token = self.acquire(cpu);
        Spl { token, was_stalled }
    }

    /// Release, then restore local delivery
    pub fn release_irqrestore(&self, cpu: CpuId, irqs: &IrqStall, spl: Spl) {
        self.release(cpu, spl.token);
        irqs.restore(cpu, spl.was_stalled);
    }

    /// CPU currently owning the lock
    pub fn owner(&self) -> Option<CpuId> {
        match self.owner.load(Ordering::Relaxed) {
            UNLOCKED => None,
            cpu => Some(cpu),
        }
    }

    /// Is the lock held by any CPU?
    pub fn is_locked(&self) -> bool {
        self.owner().is_some()
    }

    /// Spin statistics
    #[cfg(feature = "debug-spin")]
    pub fn stats(&self) -> &SpinStats {
        &self.stats
    }

    #[cfg(feature = "debug-spin")]
    fn record_spins(&self, spins: u64) {
        if spins > 0 {
            self.stats.contended.fetch_add(1, Ordering::Relaxed);
            self.stats.max_spins.fetch_max(spins, Ordering::Relaxed);
        }
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::AtomicU64;

    #[test]
    fn test_acquire_release() {
        let lock = SpinLock::new();
        let token = lock.acquire(0);
        assert_eq!(token, LockToken::Acquired);
        lock.release(0, token);
    }

    #[cfg(feature = "smp")]
    #[test]
    fn test_recursive_acquire() {
        let lock = SpinLock::new();
        let outer = lock.acquire(1);
        let inner = lock.acquire(1);
        assert!(inner.is_recursive());
        lock.release(1, inner);
        // Still held after the inner release
        assert_eq!(lock.owner(), Some(1));
        lock.release(1, outer);
        assert!(!lock.is_locked());
    }

    #[cfg(feature = "smp")]
    #[test]
    fn test_try_acquire_contended() {
        let lock = SpinLock::new();
        let token = lock.acquire(0);
        assert!(lock.try_acquire(1).is_none());
        lock.release(0, token);
        let token = lock.try_acquire(1).expect("lock is free");
        assert_eq!(lock.owner(), Some(1));
        lock.release(1, token);
    }

    #[cfg(feature = "smp")]
    #[test]
    fn test_release_by_non_owner_ignored() {
        let lock = SpinLock::new();
        let token = lock.acquire(0);
        lock.release(3, LockToken::Acquired);
        assert_eq!(lock.owner(), Some(0));
        lock.release(0, token);
    }

    #[test]
    fn test_irqsave_stalls_and_restores() {
        let lock = SpinLock::new();
        let irqs = IrqStall::new(2);
        let spl = lock.acquire_irqsave(0, &irqs);
        assert!(irqs.is_stalled(0));
        assert!(!irqs.is_stalled(1));
        let nested = lock.acquire_irqsave(0, &irqs);
        assert!(nested.was_stalled);
        lock.release_irqrestore(0, &irqs, nested);
        assert!(irqs.is_stalled(0));
        lock.release_irqrestore(0, &irqs, spl);
        assert!(!irqs.is_stalled(0));
    }

    #[test]
    fn test_irq_latch() {
        let irqs = IrqStall::new(1);
        assert!(!irqs.take_pending(0));
        irqs.latch(0);
        assert!(irqs.take_pending(0));
        assert!(!irqs.take_pending(0));
    }

    #[cfg(feature = "smp")]
    #[test]
    fn test_cross_cpu_exclusion() {
        struct Shared {
            lock: SpinLock,
            // Non-atomic read-modify-write protected by the lock
            counter: AtomicU64,
        }

        let shared = Arc::new(Shared {
            lock: SpinLock::new(),
            counter: AtomicU64::new(0),
        });

        let workers: std::vec::Vec<_> = (0..4)
            .map(|cpu| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || {
                    for _ in 0..2_000 {
                        let token = shared.lock.acquire(cpu);
                        let v = shared.counter.load(Ordering::Relaxed);
                        shared.counter.store(v + 1, Ordering::Relaxed);
                        shared.lock.release(cpu, token);
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(shared.counter.load(Ordering::Relaxed), 8_000);
        assert!(!shared.lock.is_locked());
    }
}
