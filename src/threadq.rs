//! Thread wait queues.
//!
//! A wait queue is an ordering discipline over blocked threads. Timeout
//! expiry, object deletion and explicit unblocking all funnel through the
//! single [`WaitQueue::extract`] primitive, whose off-chain check makes the
//! removal happen at most once no matter how many of those race.

use crate::chain::{self, Chain, Links};
use crate::ds;
use crate::thread::{Tcb, ThreadId, ThreadSet};

/// How waiters are ordered for wakeup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Discipline {
    /// Strict arrival order.
    Fifo,
    /// Thread priority, FIFO within a level.
    Priority,
}

/// A queue of blocked threads with a fixed wakeup discipline.
#[derive(Debug)]
pub struct WaitQueue {
    waiters: Chain,
    discipline: Discipline,
}

impl WaitQueue {
    pub const fn new(discipline: Discipline) -> WaitQueue {
        WaitQueue {
            waiters: Chain::new(),
            discipline,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub fn discipline(&self) -> Discipline {
        self.discipline
    }

    /// Adds `tid` according to the discipline.
    ///
    /// The priority walk is O(waiter count); queues needing cheap insertion
    /// under contention use FIFO.
    pub(crate) fn enqueue(&mut self, threads: &mut ThreadSet, tid: ThreadId) {
        match self.discipline {
            Discipline::Fifo => {
                self.waiters.append(threads.links(), tid.0);
            }
            Discipline::Priority => {
                chain::insert_ordered(&mut self.waiters, threads.links(), tid.0, priority_key);
            }
        }
    }

    /// Removes and returns the next thread to wake.
    pub(crate) fn dequeue_first(&mut self, threads: &mut ThreadSet) -> Option<ThreadId> {
        self.waiters
            .pop_first(threads.links())
            .map(|(index, _)| ThreadId(index))
    }

    /// Removes `tid` if it is still enqueued. Returns whether this call won
    /// the extraction; exactly one of the racing removal paths does.
    pub(crate) fn extract(&mut self, threads: &mut ThreadSet, tid: ThreadId) -> bool {
        if !threads.links().link(tid.0).is_queued() {
            return false;
        }
        self.waiters.extract(threads.links(), tid.0);
        true
    }

    /// Empties the queue, collecting every waiter in wakeup order.
    pub(crate) fn flush_collect(&mut self, threads: &mut ThreadSet, out: &mut ds::Vec<ThreadId>) {
        while let Some(tid) = self.dequeue_first(threads) {
            out.push(tid);
        }
    }
}

fn priority_key(threads: &[Tcb], index: usize) -> u64 {
    threads[index].priority() as u64
}
