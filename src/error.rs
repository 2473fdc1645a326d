//! Error taxonomy for nucleus services
//!
//! Contention is never reported here: SpinLock callers spin, SynchObject
//! callers sleep. Timeout, deletion and forced wakeup are wait outcomes
//! (see [`crate::synch::WakeReason`]), not errors.
//!
//! Author: Moroya Sakamoto

use thiserror::Error;

use crate::thread::RunState;

/// Result alias used by every fallible nucleus service
pub type Result<T> = core::result::Result<T, Error>;

/// Failure kinds surfaced by the nucleus
///
/// Personality layers map these onto their own error vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Operation invalid for the current object state (double start,
    /// release by a non-owner, resume of a dormant thread, ...)
    #[error("{op} not allowed in state {state:?}")]
    InvalidState {
        /// Rejected operation
        op: &'static str,
        /// State the target thread was in
        state: RunState,
    },

    /// Out-of-range priority, malformed interval, unknown CPU
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Stale or unknown thread handle
    #[error("no such thread")]
    NoSuchThread,

    /// Stale or unknown synchronization object handle
    #[error("no such synchronization object")]
    NoSuchSynch,

    /// Stale or unknown timer handle
    #[error("no such timer")]
    NoSuchTimer,

    /// Non-blocking request could not be satisfied immediately
    #[error("operation would block")]
    WouldBlock,

    /// Request refused instead of waiting (scheduler locked, queue full)
    #[error("resource busy")]
    Busy,

    /// Operation forbidden on this object (idle thread, remote timer)
    #[error("operation not permitted: {0}")]
    NotPermitted(&'static str),

    /// Requested start date already elapsed
    #[error("start date already elapsed")]
    TooLate,

    /// An internal invariant does not hold
    #[error("nucleus state corrupted: {0}")]
    Corrupted(&'static str),
}

impl Error {
    /// Shorthand for [`Error::InvalidState`]
    pub(crate) const fn state(op: &'static str, state: RunState) -> Self {
        Error::InvalidState { op, state }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::string::ToString;

    #[test]
    fn test_error_display() {
        let err = Error::state("start", RunState::Ready);
        assert_eq!(err.to_string(), "start not allowed in state Ready");
        assert_eq!(
            Error::InvalidArgument("priority out of range").to_string(),
            "invalid argument: priority out of range"
        );
    }

    #[test]
    fn test_error_is_copy() {
        let err = Error::WouldBlock;
        let copy = err;
        assert_eq!(err, copy);
    }
}
