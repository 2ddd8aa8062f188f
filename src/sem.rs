//! Counting semaphores.
//!
//! The count only changes when no thread is waiting: a surrender with a
//! waiter present hands the unit directly to the dequeued thread instead of
//! incrementing, so a ready lower-priority thread can never slip in between
//! the release and the wakeup. Blocking, timeout arming and the final wait
//! status are coordinated by [`crate::kernel::Kernel`]; this module owns the
//! count and the wait queue.

use core::fmt;

use arrayvec::ArrayString;

use crate::ds;
use crate::error::SemError;
use crate::thread::{ThreadId, ThreadSet, MAX_NAME_LEN};
use crate::threadq::{Discipline, WaitQueue};

/// The id of a semaphore.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SemId(pub usize);

impl fmt::Display for SemId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SemId {{ id={} }}", self.0)
    }
}

/// Creation attributes of a semaphore.
#[derive(Clone, Copy, Debug)]
pub struct SemAttributes {
    pub initial_count: u32,
    /// Ceiling for the count; surrender beyond it is refused.
    pub max_count: u32,
    pub discipline: Discipline,
}

impl Default for SemAttributes {
    fn default() -> Self {
        SemAttributes {
            initial_count: 0,
            max_count: u32::MAX,
            discipline: Discipline::Fifo,
        }
    }
}

/// What a surrender did; the caller completes the wakeup if a thread was
/// handed the unit.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Surrender {
    /// No waiter; the count absorbed the unit.
    Counted,
    /// The unit went directly to this dequeued waiter.
    HandedTo(ThreadId),
}

pub struct CoreSemaphore {
    pub(crate) name: ArrayString<MAX_NAME_LEN>,
    count: u32,
    max: u32,
    pub(crate) queue: WaitQueue,
    in_use: bool,
}

impl CoreSemaphore {
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Takes one unit if any is available.
    pub(crate) fn try_seize(&mut self) -> bool {
        if self.count > 0 {
            self.count -= 1;
            true
        } else {
            false
        }
    }

    /// Returns one unit, preferring a direct hand-off to the next waiter.
    pub(crate) fn surrender(&mut self, threads: &mut ThreadSet) -> Result<Surrender, SemError> {
        if let Some(waiter) = self.queue.dequeue_first(threads) {
            return Ok(Surrender::HandedTo(waiter));
        }
        if self.count == self.max {
            return Err(SemError::MaximumCountExceeded);
        }
        self.count += 1;
        Ok(Surrender::Counted)
    }
}

impl fmt::Debug for CoreSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "CoreSemaphore {{ name={}, count={}/{} }}",
            self.name, self.count, self.max
        )
    }
}

/// Fixed-capacity arena of semaphores.
pub struct SemSet {
    slots: ds::Vec<CoreSemaphore>,
    free: ds::Vec<usize>,
}

impl SemSet {
    pub fn with_capacity(capacity: usize) -> SemSet {
        let mut slots = ds::Vec::with_capacity(capacity);
        let mut free = ds::Vec::with_capacity(capacity);
        for index in 0..capacity {
            slots.push(CoreSemaphore {
                name: ArrayString::new(),
                count: 0,
                max: 0,
                queue: WaitQueue::new(Discipline::Fifo),
                in_use: false,
            });
            free.push(capacity - 1 - index);
        }
        SemSet { slots, free }
    }

    pub(crate) fn allocate(&mut self, name: &str, attrs: SemAttributes) -> Result<SemId, SemError> {
        if attrs.initial_count > attrs.max_count {
            return Err(SemError::MaximumCountExceeded);
        }
        let index = self.free.pop().ok_or(SemError::TooMany)?;
        let sem = &mut self.slots[index];
        sem.name.clear();
        for c in name.chars() {
            if sem.name.try_push(c).is_err() {
                break;
            }
        }
        sem.count = attrs.initial_count;
        sem.max = attrs.max_count;
        sem.queue = WaitQueue::new(attrs.discipline);
        sem.in_use = true;
        Ok(SemId(index))
    }

    /// Frees the slot; the wait queue must already be empty.
    pub(crate) fn release(&mut self, id: SemId) {
        debug_assert!(self.slots[id.0].in_use);
        debug_assert!(self.slots[id.0].queue.is_empty());
        self.slots[id.0].in_use = false;
        self.free.push(id.0);
    }

    pub fn get(&self, id: SemId) -> Result<&CoreSemaphore, SemError> {
        self.slots
            .get(id.0)
            .filter(|s| s.in_use)
            .ok_or(SemError::InvalidId)
    }

    pub(crate) fn get_mut(&mut self, id: SemId) -> Result<&mut CoreSemaphore, SemError> {
        self.slots
            .get_mut(id.0)
            .filter(|s| s.in_use)
            .ok_or(SemError::InvalidId)
    }
}
