//! Status codes and the system-wide fatal stop.
//!
//! Three kinds of conditions leave this core: caller usage errors and
//! resource exhaustion come back as ordinary `Result`s; internal invariant
//! violations escalate through [`fatal`] and never return; race losers (a
//! second extraction of an already-extracted waiter) are silent no-ops and
//! appear in no taxonomy at all.

use core::sync::atomic::{AtomicUsize, Ordering};

use displaydoc::Display;
use log::error;

/// Outcome of a completed blocking operation.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum WaitStatus {
    /// still blocked, no outcome yet
    Pending,
    /// the wait was satisfied
    Success,
    /// the request could not be satisfied without waiting
    Unsatisfied,
    /// the bounded wait timed out
    Timeout,
    /// the waited-on object was deleted
    ObjectDeleted,
}

/// Errors returned from semaphore operations.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum SemError {
    /// no such semaphore
    InvalidId,
    /// no free semaphore control block
    TooMany,
    /// surrender would exceed the configured maximum count
    MaximumCountExceeded,
    /// the caller declined to wait and the count was zero
    Unsatisfied,
}

/// Errors returned from thread lifecycle operations.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum ThreadError {
    /// no such thread
    InvalidId,
    /// priority outside the configured level range
    InvalidPriority,
    /// no free thread control block
    TooMany,
    /// the thread was already started
    AlreadyStarted,
    /// the thread has not been started yet
    NotStarted,
    /// no free watchdog control block
    NoTimerSlot,
    /// a timer interval of zero ticks
    InvalidInterval,
    /// the affinity mask selects no online processor
    InvalidAffinity,
}

/// Errors returned from interrupt vector registration.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum IrqError {
    /// vector index outside the table
    InvalidVector,
    /// a handler is already registered for this vector
    VectorInUse,
}

/// Sources of unrecoverable conditions.
///
/// Every variant terminates the system through [`fatal`]; none of them is an
/// application-visible error.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum FatalSource {
    /// dispatch-enable called with the disable level already zero
    DispatchLevelUnderflow,
    /// synchronous dispatch entered with a disable level other than one
    BadDirectDispatchLevel,
    /// the static configuration table is inconsistent
    InvalidConfiguration,
    /// scheduler ready bookkeeping became inconsistent
    SchedulerInconsistency,
    /// a mandatory processor failed to start
    MandatoryProcessorFailed,
    /// a bounded poll for a remote processor exceeded its retry budget
    PollExceeded,
    /// a shutdown message was received
    Shutdown,
}

/// Reports a fatal condition and stops the system.
///
/// During bring-up there is no well-defined caller to hand a status to, so
/// the SMP layer funnels every unrecoverable condition here. The core never
/// retries; restart policy belongs to the layer above.
pub fn fatal(source: FatalSource, code: usize) -> ! {
    FATAL_COUNT.fetch_add(1, Ordering::Relaxed);
    error!("fatal stop: {} (code {:#x})", source, code);
    panic!("fatal stop: {} (code {:#x})", source, code);
}

/// How many fatal stops were initiated (at most one proceeds; the count
/// exists for post-mortem inspection from tests and debuggers).
pub fn fatal_count() -> usize {
    FATAL_COUNT.load(Ordering::Relaxed)
}

static FATAL_COUNT: AtomicUsize = AtomicUsize::new(0);
