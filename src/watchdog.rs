//! Watchdog timer management over a delta chain.
//!
//! Pending watchdogs sit on one chain sorted so each node's stored delta is
//! relative to its predecessor; the prefix sum up to a node is its absolute
//! remaining ticks. A clock tick therefore decrements only the head, making
//! periodic processing O(1) amortized.
//!
//! A set is only reachable through an exclusive borrow of the kernel, so an
//! insert walk cannot be interleaved by a tick and needs no restart
//! protocol; see DESIGN.md for the single-chain ownership decision.

use core::fmt;

use log::trace;

use crate::chain::{Chain, Link, Links};
use crate::ds;
use crate::thread::ThreadId;

/// Handle to a watchdog slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchdogId(pub(crate) usize);

impl fmt::Display for WatchdogId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "WatchdogId {{ id={} }}", self.0)
    }
}

/// Lifecycle of one watchdog node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchdogState {
    /// Not on the delta chain.
    Inactive,
    /// Insert walk in progress; free to cancel.
    BeingInserted,
    /// Queued on the delta chain.
    Active,
    /// Being fired right now; not re-queueable, removal only marks.
    RemoveIt,
}

/// What firing a watchdog means to the rest of the core.
///
/// Firing reports the action to the tickle caller instead of invoking it
/// in place, so the kernel can act on thread and queue state without
/// aliasing the timer arena.
#[derive(Clone, Copy, Debug)]
pub enum WatchdogAction {
    /// A bounded wait of this thread expired.
    ThreadTimeout(ThreadId),
    /// A user routine with one argument word.
    Routine(fn(usize), usize),
}

struct Watchdog {
    link: Link,
    delta: u64,
    state: WatchdogState,
    action: WatchdogAction,
    in_use: bool,
}

impl Links for [Watchdog] {
    fn link(&self, index: usize) -> &Link {
        &self[index].link
    }
    fn link_mut(&mut self, index: usize) -> &mut Link {
        &mut self[index].link
    }
}

/// A fixed-capacity arena of watchdogs sharing one delta chain.
pub struct WatchdogSet {
    nodes: ds::Vec<Watchdog>,
    free: ds::Vec<usize>,
    pending: Chain,
}

impl WatchdogSet {
    pub fn with_capacity(capacity: usize) -> WatchdogSet {
        let mut nodes = ds::Vec::with_capacity(capacity);
        let mut free = ds::Vec::with_capacity(capacity);
        for index in 0..capacity {
            nodes.push(Watchdog {
                link: Link::new(),
                delta: 0,
                state: WatchdogState::Inactive,
                action: WatchdogAction::Routine(noop_routine, 0),
                in_use: false,
            });
            free.push(capacity - 1 - index);
        }
        WatchdogSet {
            nodes,
            free,
            pending: Chain::new(),
        }
    }

    /// Claims a slot for `action`. `None` when the arena is exhausted.
    pub fn allocate(&mut self, action: WatchdogAction) -> Option<WatchdogId> {
        let index = self.free.pop()?;
        let node = &mut self.nodes[index];
        node.in_use = true;
        node.state = WatchdogState::Inactive;
        node.action = action;
        Some(WatchdogId(index))
    }

    /// Returns a slot to the arena. The watchdog must not be pending.
    pub fn release(&mut self, id: WatchdogId) {
        let node = &mut self.nodes[id.0];
        debug_assert!(node.in_use);
        debug_assert!(node.state == WatchdogState::Inactive);
        node.in_use = false;
        self.free.push(id.0);
    }

    pub fn state(&self, id: WatchdogId) -> WatchdogState {
        self.nodes[id.0].state
    }

    pub fn is_pending(&self, id: WatchdogId) -> bool {
        self.nodes[id.0].state == WatchdogState::Active
    }

    /// Whether the slot behind `id` is currently claimed.
    pub fn is_allocated(&self, id: WatchdogId) -> bool {
        self.nodes[id.0].in_use
    }

    /// Queues `id` to fire after `ticks` clock ticks.
    ///
    /// Walks the chain accumulating the delay against successive deltas and
    /// splits the found node's delta. Equal deadlines queue behind earlier
    /// arrivals.
    pub fn insert(&mut self, id: WatchdogId, ticks: u64) {
        debug_assert!(ticks > 0, "zero-tick watchdog");
        debug_assert!(self.nodes[id.0].in_use);
        debug_assert!(self.nodes[id.0].state == WatchdogState::Inactive);
        self.nodes[id.0].state = WatchdogState::BeingInserted;

        let mut remaining = ticks;
        let mut cursor = self.pending.first();
        let mut place_before = None;
        while let Some(current) = cursor {
            let delta = self.nodes[current].delta;
            if remaining < delta {
                place_before = Some(current);
                break;
            }
            remaining -= delta;
            cursor = self.pending.next(self.nodes.as_slice(), current);
        }

        match place_before {
            Some(current) => {
                self.nodes[current].delta -= remaining;
                self.pending
                    .insert_before(self.nodes.as_mut_slice(), current, id.0);
            }
            None => {
                self.pending.append(self.nodes.as_mut_slice(), id.0);
            }
        }
        let node = &mut self.nodes[id.0];
        node.delta = remaining;
        node.state = WatchdogState::Active;
        trace!("watchdog {} armed, {} ticks", id, ticks);
    }

    /// Cancels `id`, folding its remaining delta into the successor.
    ///
    /// A node currently mid-fire (`RemoveIt`) is only marked inactive and
    /// left unlinked. Returns the absolute ticks that were still remaining,
    /// zero when nothing was pending.
    pub fn remove(&mut self, id: WatchdogId) -> u64 {
        match self.nodes[id.0].state {
            WatchdogState::Inactive => 0,
            WatchdogState::BeingInserted | WatchdogState::RemoveIt => {
                self.nodes[id.0].state = WatchdogState::Inactive;
                0
            }
            WatchdogState::Active => {
                let remaining = self.remaining(id).unwrap_or(0);
                if let Some(successor) = self.pending.next(self.nodes.as_slice(), id.0) {
                    self.nodes[successor].delta += self.nodes[id.0].delta;
                }
                self.pending.extract(self.nodes.as_mut_slice(), id.0);
                self.nodes[id.0].state = WatchdogState::Inactive;
                trace!("watchdog {} cancelled, {} ticks left", id, remaining);
                remaining
            }
        }
    }

    /// Announces one clock tick.
    ///
    /// Decrements the head delta and fires every node that reaches zero,
    /// exactly once each, reporting each fired action to `fire`. Nodes in
    /// `BeingInserted`/`Inactive` state are defensive no-ops, `RemoveIt` is
    /// skipped.
    pub fn tickle<F>(&mut self, mut fire: F)
    where
        F: FnMut(WatchdogId, WatchdogAction),
    {
        let Some(head) = self.pending.first() else {
            return;
        };
        self.nodes[head].delta = self.nodes[head].delta.saturating_sub(1);

        while let Some(head) = self.pending.first() {
            if self.nodes[head].delta != 0 {
                break;
            }
            self.pending.extract(self.nodes.as_mut_slice(), head);
            match self.nodes[head].state {
                WatchdogState::Active => {
                    self.nodes[head].state = WatchdogState::RemoveIt;
                    let action = self.nodes[head].action;
                    fire(WatchdogId(head), action);
                    // A concurrent removal during the fire leaves Inactive.
                    if self.nodes[head].state == WatchdogState::RemoveIt {
                        self.nodes[head].state = WatchdogState::Inactive;
                    }
                }
                WatchdogState::BeingInserted | WatchdogState::Inactive => {
                    self.nodes[head].state = WatchdogState::Inactive;
                }
                WatchdogState::RemoveIt => {}
            }
        }
    }

    /// Shifts the whole chain forward by `ticks`, firing everything the
    /// consumed interval covers. Used when an external clock jumps ahead.
    pub fn adjust_forward<F>(&mut self, mut ticks: u64, mut fire: F)
    where
        F: FnMut(WatchdogId, WatchdogAction),
    {
        while ticks > 0 {
            let Some(head) = self.pending.first() else {
                return;
            };
            if self.nodes[head].delta > ticks {
                self.nodes[head].delta -= ticks;
                return;
            }
            ticks -= self.nodes[head].delta;
            // Re-use the tickle path so state dispatch stays in one place.
            self.nodes[head].delta = 1;
            self.tickle(&mut fire);
        }
    }

    /// Shifts the whole chain backward by `ticks` (the clock jumped back):
    /// everything pending moves further into the future.
    pub fn adjust_backward(&mut self, ticks: u64) {
        if let Some(head) = self.pending.first() {
            self.nodes[head].delta += ticks;
        }
    }

    /// Absolute ticks until `id` fires, `None` if it is not pending.
    pub fn remaining(&self, id: WatchdogId) -> Option<u64> {
        if self.nodes[id.0].state != WatchdogState::Active {
            return None;
        }
        let mut sum = 0;
        let mut cursor = self.pending.first();
        while let Some(current) = cursor {
            sum += self.nodes[current].delta;
            if current == id.0 {
                return Some(sum);
            }
            cursor = self.pending.next(self.nodes.as_slice(), current);
        }
        debug_assert!(false, "active watchdog not on the chain");
        None
    }

    /// Sum of all stored deltas (the absolute deadline of the last node).
    pub fn total_delta(&self) -> u64 {
        let mut sum = 0;
        let mut cursor = self.pending.first();
        while let Some(current) = cursor {
            sum += self.nodes[current].delta;
            cursor = self.pending.next(self.nodes.as_slice(), current);
        }
        sum
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

fn noop_routine(_arg: usize) {}
