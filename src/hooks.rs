//! Platform hooks — what the nucleus asks of the layer below it
//!
//! The nucleus never touches registers. It reports each context switch
//! to a [`ContextSwitch`] implementation and hands unrecoverable
//! conditions to a [`FatalHandler`].
//!
//! Personality layers can also watch thread lifecycles: hooks added with
//! [`Kernel::add_hook`] run when a thread starts, when it is switched in,
//! and before it is torn down. The most recently added hook runs first.
//!
//! Author: Moroya Sakamoto

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use crate::error::{Error, Result};
use crate::kernel::Kernel;
use crate::spinlock::CpuId;
use crate::thread::{Thread, ThreadId};

/// Architecture context switch
pub trait ContextSwitch: Send {
    /// Save `outgoing`, restore `incoming` on `cpu`
    fn switch(&mut self, cpu: CpuId, outgoing: ThreadId, incoming: ThreadId);
}

/// Switch hook that does nothing (simulation)
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSwitch;

impl ContextSwitch for NoSwitch {
    fn switch(&mut self, _cpu: CpuId, _outgoing: ThreadId, _incoming: ThreadId) {}
}

/// One recorded switch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchRecord {
    /// CPU that switched
    pub cpu: CpuId,
    /// Thread switched out
    pub outgoing: ThreadId,
    /// Thread switched in
    pub incoming: ThreadId,
}

/// Switch hook recording every switch; clones share the record
#[derive(Debug, Default, Clone)]
pub struct SwitchTrace {
    records: Arc<spin::Mutex<Vec<SwitchRecord>>>,
}

impl SwitchTrace {
    /// Empty trace
    pub fn new() -> Self {
        Self::default()
    }

    /// Switches so far, oldest first
    pub fn records(&self) -> Vec<SwitchRecord> {
        self.records.lock().clone()
    }

    /// Threads switched in on `cpu`, oldest first
    pub fn incoming(&self, cpu: CpuId) -> Vec<ThreadId> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.cpu == cpu)
            .map(|r| r.incoming)
            .collect()
    }

    /// Number of switches recorded
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Nothing recorded?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget recorded switches
    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl ContextSwitch for SwitchTrace {
    fn switch(&mut self, cpu: CpuId, outgoing: ThreadId, incoming: ThreadId) {
        self.records.lock().push(SwitchRecord {
            cpu,
            outgoing,
            incoming,
        });
    }
}

/// Sink for unrecoverable nucleus errors
pub trait FatalHandler: Send {
    /// Report and never return
    fn fatal(&self, msg: fmt::Arguments<'_>) -> !;
}

/// Default handler: panic with the message
#[derive(Debug, Default, Clone, Copy)]
pub struct PanicOnFatal;

impl FatalHandler for PanicOnFatal {
    fn fatal(&self, msg: fmt::Arguments<'_>) -> ! {
        panic!("nucleus fatal: {}", msg)
    }
}

/// Lifecycle event a thread hook is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// Thread left the dormant state
    Start,
    /// Thread is being switched in (idle threads excluded)
    Switch,
    /// Thread is about to be torn down
    Delete,
}

/// Handle of a registered thread hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

/// Thread lifecycle callback
pub type ThreadHook = Box<dyn FnMut(&Thread) + Send>;

#[derive(Default)]
pub(crate) struct HookTable {
    next: u64,
    /// Newest first
    hooks: Vec<(HookId, HookKind, ThreadHook)>,
}

impl HookTable {
    fn add(&mut self, kind: HookKind, hook: ThreadHook) -> HookId {
        self.next += 1;
        let id = HookId(self.next);
        self.hooks.insert(0, (id, kind, hook));
        id
    }

    fn remove(&mut self, id: HookId) -> bool {
        let before = self.hooks.len();
        self.hooks.retain(|(h, _, _)| *h != id);
        self.hooks.len() != before
    }

    fn run(&mut self, kind: HookKind, thread: &Thread) {
        for (_, k, hook) in self.hooks.iter_mut() {
            if *k == kind {
                hook(thread);
            }
        }
    }
}

impl Kernel {
    /// Attach `hook` to `kind` events of every thread
    pub fn add_hook<F>(&mut self, kind: HookKind, hook: F) -> HookId
    where
        F: FnMut(&Thread) + Send + 'static,
    {
        let id = self.hooks.add(kind, Box::new(hook));
        log::trace!("{:?} hook {:?} added", kind, id);
        id
    }

    /// Detach a hook
    pub fn remove_hook(&mut self, id: HookId) -> Result<()> {
        if !self.hooks.remove(id) {
            return Err(Error::InvalidArgument("unknown hook"));
        }
        log::trace!("hook {:?} removed", id);
        Ok(())
    }

    pub(crate) fn run_hooks(&mut self, kind: HookKind, id: ThreadId) {
        if let Some(t) = self.threads.get(id) {
            self.hooks.run(kind, t);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Handle;
    use crate::thread::{Priority, ThreadParams};

    #[test]
    fn test_trace_shared_between_clones() {
        let trace = SwitchTrace::new();
        let mut hook = trace.clone();
        hook.switch(0, Handle::new(0, 0), Handle::new(1, 0));
        hook.switch(1, Handle::new(2, 0), Handle::new(3, 0));
        assert_eq!(trace.len(), 2);
        assert_eq!(trace.incoming(0), [Handle::new(1, 0)]);
        trace.clear();
        assert!(hook.is_empty());
    }

    fn recorder(k: &mut Kernel, kind: HookKind, seen: &Arc<spin::Mutex<Vec<(HookKind, ThreadId)>>>) -> HookId {
        let seen = Arc::clone(seen);
        k.add_hook(kind, move |t| seen.lock().push((kind, t.id())))
    }

    #[test]
    fn test_thread_hooks_fire_on_lifecycle() {
        let mut k = Kernel::testing();
        let seen = Arc::new(spin::Mutex::new(Vec::new()));
        for kind in [HookKind::Start, HookKind::Switch, HookKind::Delete] {
            recorder(&mut k, kind, &seen);
        }
        let a = k.thread_init(ThreadParams::new("a", Priority(5))).unwrap();
        assert!(seen.lock().is_empty());
        k.thread_start(a).unwrap();
        k.schedule(0);
        k.thread_delete(a).unwrap();
        k.schedule(0);
        // Switching back to idle is not reported
        assert_eq!(
            *seen.lock(),
            [(HookKind::Start, a), (HookKind::Switch, a), (HookKind::Delete, a)]
        );
    }

    #[test]
    fn test_hooks_run_newest_first() {
        let mut k = Kernel::testing();
        let order = Arc::new(spin::Mutex::new(Vec::new()));
        for tag in [1, 2] {
            let order = Arc::clone(&order);
            k.add_hook(HookKind::Start, move |_| order.lock().push(tag));
        }
        let a = k.thread_init(ThreadParams::new("a", Priority(5))).unwrap();
        k.thread_start(a).unwrap();
        assert_eq!(*order.lock(), [2, 1]);
    }

    #[test]
    fn test_removed_hook_stays_silent() {
        let mut k = Kernel::testing();
        let seen = Arc::new(spin::Mutex::new(Vec::new()));
        let hook = recorder(&mut k, HookKind::Start, &seen);
        k.remove_hook(hook).unwrap();
        assert!(matches!(k.remove_hook(hook), Err(Error::InvalidArgument(_))));
        let a = k.thread_init(ThreadParams::new("a", Priority(5))).unwrap();
        k.thread_start(a).unwrap();
        assert!(seen.lock().is_empty());
    }

    #[test]
    #[should_panic(expected = "nucleus fatal: broken")]
    fn test_panic_on_fatal() {
        PanicOnFatal.fatal(format_args!("broken"));
    }
}
