//! rt-nucleus — real-time co-kernel core
//!
//! The part of a dual-kernel RTOS that sits below any API personality:
//! - Nucleus spinlock with recursion detection and irq stalling
//! - Master clock with derived time bases and a wallclock offset
//! - Per-CPU timer queues (sorted list or bounded binary heap)
//! - Thread state machine with suspensive conditions
//! - Wait queues with priority inheritance and ownership stealing
//! - Per-CPU fixed-priority scheduler with FIFO / round-robin classes
//! - Thread lifecycle hooks and a runaway-thread watchdog
//!
//! Handles are generation-checked, so a stale id is an error, never a
//! dangling reference.
//!
//! Author: Moroya Sakamoto

#![no_std]

extern crate alloc;

pub mod arena;
pub mod class;
pub mod clock;
pub mod config;
pub mod error;
pub mod hooks;
pub mod kernel;
pub mod pod;
pub mod scheduler;
pub mod spinlock;
pub mod synch;
pub mod thread;
pub mod timer;
pub mod timerq;

pub use arena::{Arena, Handle};
pub use class::{QueuePos, SchedClass};
pub use clock::{BaseId, Clock, Nanos, Ticks, TimeBase};
pub use config::Config;
pub use error::{Error, Result};
pub use hooks::{
    ContextSwitch, FatalHandler, HookId, HookKind, NoSwitch, PanicOnFatal, SwitchRecord,
    SwitchTrace, ThreadHook,
};
pub use kernel::{Kernel, KernelStats};
pub use pod::Pod;
pub use scheduler::{ReadyQueue, SchedStatus, Scheduler, WATCHDOG_TRIGGER};
pub use spinlock::{CpuId, IrqStall, LockToken, SpinLock, Spl};
pub use synch::{Synch, SynchFlags, SynchId, Wait, WakeReason};
pub use thread::{
    BlockMask, Deletion, PeriodWait, Priority, RunState, Thread, ThreadId, ThreadParams, Timeout,
    WaitInfo,
};
pub use timer::{Timer, TimerFn, TimerId, TimerMode, TimerStatus};
pub use timerq::{QueueKind, TimerKey, TimerQueue};
