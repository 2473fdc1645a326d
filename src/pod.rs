//! Pod — a kernel shared between CPUs
//!
//! Every entry into the nucleus runs under the nucleus lock with tick
//! delivery stalled on the calling CPU. A tick arriving while its CPU is
//! stalled is latched and replayed when the outermost entry leaves.
//!
//! Author: Moroya Sakamoto

use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::clock::Ticks;
use crate::hooks::{FatalHandler, PanicOnFatal};
use crate::kernel::Kernel;
use crate::spinlock::{CpuId, IrqStall, SpinLock};
use crate::thread::ThreadId;

/// Kernel behind the nucleus lock
pub struct Pod {
    lock: SpinLock,
    irqs: IrqStall,
    entered: AtomicBool,
    /// Date of the latest latched tick, per CPU
    latched: Vec<AtomicU64>,
    kernel: UnsafeCell<Kernel>,
}

// SAFETY: the kernel is only reached from `with`, which holds the nucleus
// lock and refuses nested entries.
unsafe impl Sync for Pod {}

impl Pod {
    /// Share `kernel`
    pub fn new(kernel: Kernel) -> Self {
        let cpus = kernel.cpus();
        Self {
            lock: SpinLock::new(),
            irqs: IrqStall::new(cpus),
            entered: AtomicBool::new(false),
            latched: (0..cpus).map(|_| AtomicU64::new(0)).collect(),
            kernel: UnsafeCell::new(kernel),
        }
    }

    /// Number of CPUs
    pub fn cpus(&self) -> usize {
        self.irqs.cpus()
    }

    /// Run `f` inside the nucleus on behalf of `cpu`
    ///
    /// Entering again from within `f` is fatal.
    pub fn with<R>(&self, cpu: CpuId, f: impl FnOnce(&mut Kernel) -> R) -> R {
        let spl = self.lock.acquire_irqsave(cpu, &self.irqs);
        if spl.token.is_recursive() || self.entered.swap(true, Ordering::Acquire) {
            log::error!("recursive nucleus entry on cpu {}", cpu);
            PanicOnFatal.fatal(format_args!("recursive nucleus entry on cpu {}", cpu));
        }
        // SAFETY: the lock is held and `entered` was clear
        let result = f(unsafe { &mut *self.kernel.get() });
        self.entered.store(false, Ordering::Release);
        self.lock.release_irqrestore(cpu, &self.irqs, spl);
        if !spl.was_stalled {
            self.replay(cpu);
        }
        result
    }

    /// Clock interrupt of `cpu`; latched while the CPU is stalled
    pub fn tick(&self, cpu: CpuId, now: Ticks) -> Option<(ThreadId, ThreadId)> {
        if cpu >= self.cpus() {
            log::warn!("tick for unknown cpu {}", cpu);
            return None;
        }
        if self.irqs.is_stalled(cpu) {
            self.latched[cpu].fetch_max(now, Ordering::AcqRel);
            self.irqs.latch(cpu);
            log::trace!("cpu {}: tick at {} latched", cpu, now);
            return None;
        }
        self.with(cpu, |k| k.tick(cpu, now))
    }

    /// Stall tick delivery on `cpu`, returning the previous state
    pub fn stall(&self, cpu: CpuId) -> bool {
        self.irqs.stall(cpu)
    }

    /// Restore tick delivery on `cpu`, replaying a latched tick
    pub fn unstall(&self, cpu: CpuId, was_stalled: bool) {
        self.irqs.restore(cpu, was_stalled);
        if !was_stalled {
            self.replay(cpu);
        }
    }

    /// Is tick delivery stalled on `cpu`?
    pub fn is_stalled(&self, cpu: CpuId) -> bool {
        self.irqs.is_stalled(cpu)
    }

    /// Take the kernel back
    pub fn into_inner(self) -> Kernel {
        self.kernel.into_inner()
    }

    fn replay(&self, cpu: CpuId) {
        if self.irqs.take_pending(cpu) {
            let now = self.latched[cpu].load(Ordering::Acquire);
            self.with(cpu, |k| k.tick(cpu, now));
        }
    }
}
