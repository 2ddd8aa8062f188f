//! Thread control blocks.
//!
//! TCBs live in a fixed-capacity arena owned by the kernel; every other
//! subsystem references them by [`ThreadId`] (an arena index) and never owns
//! them. The per-thread scheduling metadata ([`SchedulerNode`]) is an owned
//! field of its TCB and shares its lifetime.

use core::fmt;

use arrayvec::ArrayString;

use crate::bitmap::BitmapInfo;
use crate::chain::{Link, Links};
use crate::ds;
use crate::error::{ThreadError, WaitStatus};
use crate::sem::SemId;
use crate::watchdog::WatchdogId;
use crate::{CpuId, Priority};

/// The id of a thread.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct ThreadId(pub usize);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ThreadId {{ id={} }}", self.0)
    }
}

/// Entry function of a thread with one argument word.
pub type ThreadEntry = fn(usize);

pub const MAX_NAME_LEN: usize = 16;

/// Scheduler-visible state of a thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedState {
    /// Created but not yet started.
    Dormant,
    /// Eligible to run, queued on a ready structure.
    Ready,
    /// Currently assigned a processor (executing or heir).
    Scheduled,
    /// Not eligible to run.
    Blocked,
}

/// Per-thread scheduling metadata, embedded in the TCB.
#[derive(Debug)]
pub struct SchedulerNode {
    /// Ready-queue or wait-queue linkage (a thread is never on both).
    pub(crate) link: Link,
    /// Cached bit-map masks for the current priority.
    pub(crate) bitmap: BitmapInfo,
    pub(crate) state: SchedState,
    /// Processor this thread is scheduled on, if any.
    pub(crate) cpu: Option<CpuId>,
    /// SMP transitional state: the assigned processor cannot run the
    /// thread right now and another processor was asked to help.
    pub(crate) needs_help: bool,
}

impl SchedulerNode {
    fn new(priority: Priority) -> SchedulerNode {
        SchedulerNode {
            link: Link::new(),
            bitmap: BitmapInfo::new(priority),
            state: SchedState::Dormant,
            cpu: None,
            needs_help: false,
        }
    }
}

/// Wait-related state of a thread.
#[derive(Debug)]
pub struct WaitState {
    /// Queue the thread is blocked on, if any.
    pub(crate) queued_on: Option<SemId>,
    /// Outcome of the last blocking operation.
    pub(crate) status: WaitStatus,
    /// Watchdog slot backing this thread's bounded waits.
    pub(crate) timer: WatchdogId,
}

/// A thread control block.
pub struct Tcb {
    pub(crate) name: ArrayString<MAX_NAME_LEN>,
    pub(crate) priority: Priority,
    pub(crate) preemptible: bool,
    /// Processors this thread may run on, one bit per processor.
    pub(crate) affinity: u64,
    pub(crate) entry: Option<(ThreadEntry, usize)>,
    pub(crate) sched: SchedulerNode,
    pub(crate) wait: WaitState,
    /// Idle placeholder threads never block and never enter wait queues.
    pub(crate) is_idle: bool,
    in_use: bool,
}

impl Tcb {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn is_preemptible(&self) -> bool {
        self.preemptible
    }

    pub fn state(&self) -> SchedState {
        self.sched.state
    }

    pub fn wait_status(&self) -> WaitStatus {
        self.wait.status
    }

    pub fn affinity(&self) -> u64 {
        self.affinity
    }
}

impl fmt::Debug for Tcb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Tcb {{ name={}, prio={}, state={:?} }}",
            self.name, self.priority, self.sched.state
        )
    }
}

impl Links for [Tcb] {
    fn link(&self, index: usize) -> &Link {
        &self[index].sched.link
    }
    fn link_mut(&mut self, index: usize) -> &mut Link {
        &mut self[index].sched.link
    }
}

/// Creation attributes beyond name and priority.
#[derive(Clone, Copy, Debug)]
pub struct ThreadAttributes {
    pub preemptible: bool,
    /// Processor eligibility mask; one bit per processor.
    pub affinity: u64,
}

impl Default for ThreadAttributes {
    fn default() -> Self {
        ThreadAttributes {
            preemptible: true,
            affinity: u64::MAX,
        }
    }
}

/// Fixed-capacity arena of thread control blocks.
pub struct ThreadSet {
    slots: ds::Vec<Tcb>,
    free: ds::Vec<usize>,
}

impl ThreadSet {
    pub fn with_capacity(capacity: usize) -> ThreadSet {
        let mut slots = ds::Vec::with_capacity(capacity);
        let mut free = ds::Vec::with_capacity(capacity);
        for index in 0..capacity {
            slots.push(Tcb {
                name: ArrayString::new(),
                priority: 0,
                preemptible: true,
                affinity: u64::MAX,
                entry: None,
                sched: SchedulerNode::new(0),
                wait: WaitState {
                    queued_on: None,
                    status: WaitStatus::Success,
                    timer: WatchdogId(usize::MAX),
                },
                is_idle: false,
                in_use: false,
            });
            free.push(capacity - 1 - index);
        }
        ThreadSet { slots, free }
    }

    /// Claims a TCB. `timer` is the thread's dedicated watchdog slot.
    pub(crate) fn allocate(
        &mut self,
        name: &str,
        priority: Priority,
        attrs: ThreadAttributes,
        timer: WatchdogId,
    ) -> Result<ThreadId, ThreadError> {
        let index = self.free.pop().ok_or(ThreadError::TooMany)?;
        let tcb = &mut self.slots[index];
        tcb.name.clear();
        for c in name.chars() {
            if tcb.name.try_push(c).is_err() {
                break;
            }
        }
        tcb.priority = priority;
        tcb.preemptible = attrs.preemptible;
        tcb.affinity = attrs.affinity;
        tcb.entry = None;
        tcb.sched = SchedulerNode::new(priority);
        tcb.wait = WaitState {
            queued_on: None,
            status: WaitStatus::Success,
            timer,
        };
        tcb.is_idle = false;
        tcb.in_use = true;
        Ok(ThreadId(index))
    }

    pub(crate) fn release(&mut self, tid: ThreadId) {
        debug_assert!(self.slots[tid.0].in_use);
        debug_assert!(!self.slots[tid.0].sched.link.is_queued());
        self.slots[tid.0].in_use = false;
        self.free.push(tid.0);
    }

    pub fn get(&self, tid: ThreadId) -> Result<&Tcb, ThreadError> {
        self.slots
            .get(tid.0)
            .filter(|t| t.in_use)
            .ok_or(ThreadError::InvalidId)
    }

    pub(crate) fn get_mut(&mut self, tid: ThreadId) -> Result<&mut Tcb, ThreadError> {
        self.slots
            .get_mut(tid.0)
            .filter(|t| t.in_use)
            .ok_or(ThreadError::InvalidId)
    }

    /// Arena view for chain operations.
    pub(crate) fn links(&mut self) -> &mut [Tcb] {
        self.slots.as_mut_slice()
    }

    pub(crate) fn slots(&self) -> &[Tcb] {
        self.slots.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_is_bounded_and_reusable() {
        let mut set = ThreadSet::with_capacity(2);
        let a = set
            .allocate("a", 10, ThreadAttributes::default(), WatchdogId(0))
            .unwrap();
        let _b = set
            .allocate("b", 11, ThreadAttributes::default(), WatchdogId(1))
            .unwrap();
        assert_eq!(
            set.allocate("c", 12, ThreadAttributes::default(), WatchdogId(2)),
            Err(ThreadError::TooMany)
        );
        set.release(a);
        let c = set
            .allocate("c", 12, ThreadAttributes::default(), WatchdogId(2))
            .unwrap();
        assert_eq!(set.get(c).unwrap().name(), "c");
    }

    #[test]
    fn long_names_are_truncated() {
        let mut set = ThreadSet::with_capacity(1);
        let tid = set
            .allocate(
                "a-name-well-beyond-sixteen-chars",
                1,
                ThreadAttributes::default(),
                WatchdogId(0),
            )
            .unwrap();
        assert_eq!(set.get(tid).unwrap().name().len(), MAX_NAME_LEN);
    }
}
