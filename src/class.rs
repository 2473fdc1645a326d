//! Scheduling classes
//!
//! Closed set of policies sharing one small capability interface:
//! priority validation, time slicing, and where a preempted thread is
//! put back in its priority level.
//!
//! Author: Moroya Sakamoto

use crate::config::Config;
use crate::thread::Priority;

/// Position inside a priority level of the ready queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePos {
    /// Front of the level: next pick at this priority
    Head,
    /// Back of the level
    Tail,
}

/// Scheduling class of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedClass {
    /// Fixed priority, FIFO within a level
    Fifo,
    /// Fixed priority, time-sliced rotation within a level
    RoundRobin,
    /// Per-CPU idle thread: lowest priority, never queued
    Idle,
}

impl SchedClass {
    /// Class name
    pub const fn name(&self) -> &'static str {
        match self {
            SchedClass::Fifo => "fifo",
            SchedClass::RoundRobin => "rr",
            SchedClass::Idle => "idle",
        }
    }

    /// Does the class consume a time slice?
    pub const fn is_time_sliced(&self) -> bool {
        matches!(self, SchedClass::RoundRobin)
    }

    /// Is `prio` legal for this class?
    pub fn accepts(&self, prio: Priority, config: &Config) -> bool {
        match self {
            SchedClass::Idle => prio == Priority::IDLE,
            SchedClass::Fifo | SchedClass::RoundRobin => {
                prio >= config.min_priority && prio <= config.max_priority
            }
        }
    }

    /// Where a thread losing the CPU re-enters its level
    ///
    /// Preemption keeps the thread's place; an exhausted slice sends a
    /// round-robin thread behind its peers.
    pub const fn requeue_position(&self, slice_expired: bool) -> QueuePos {
        match self {
            SchedClass::RoundRobin if slice_expired => QueuePos::Tail,
            _ => QueuePos::Head,
        }
    }
}
