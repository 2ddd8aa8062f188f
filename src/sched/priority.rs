//! Deterministic priority scheduler for a single processor.
//!
//! One chain per priority level plus the two-level bit map: selection is
//! O(1), insertion at the tail of a level keeps ties FIFO by arrival.
//! Scheduled threads stay on their ready chain; blocking extracts them.

use log::trace;

use crate::bitmap::{BitmapInfo, PriorityBitmap};
use crate::chain::Chain;
use crate::ds;
use crate::error::{fatal, FatalSource};
use crate::sched::{install_heir, SchedContext, Scheduler};
use crate::thread::{SchedState, ThreadId};
use crate::{CpuId, Priority};

pub struct PriorityScheduler {
    ready: ds::Vec<Chain>,
    bitmap: PriorityBitmap,
    /// The single processor this instance governs.
    cpu: CpuId,
}

impl PriorityScheduler {
    pub fn new(priority_levels: usize) -> PriorityScheduler {
        let mut ready = ds::Vec::with_capacity(priority_levels);
        for _ in 0..priority_levels {
            ready.push(Chain::new());
        }
        PriorityScheduler {
            ready,
            bitmap: PriorityBitmap::new(),
            cpu: 0,
        }
    }

    fn enqueue_tail(&mut self, ctx: &mut SchedContext<'_>, tid: ThreadId, priority: Priority) {
        let was_empty = self.ready[priority as usize].append(ctx.threads.links(), tid.0);
        if was_empty {
            self.bitmap.add(&BitmapInfo::new(priority));
        }
    }

    fn extract(&mut self, ctx: &mut SchedContext<'_>, tid: ThreadId, priority: Priority) {
        let now_empty = self.ready[priority as usize].extract(ctx.threads.links(), tid.0);
        if now_empty {
            self.bitmap.remove(&BitmapInfo::new(priority));
        }
    }

    /// Highest-priority ready thread; the idle placeholder never blocks, so
    /// an empty ready set means the bookkeeping was corrupted.
    fn highest_ready(&self) -> ThreadId {
        let Some(priority) = self.bitmap.get_highest() else {
            fatal(FatalSource::SchedulerInconsistency, self.cpu);
        };
        match self.ready[priority as usize].first() {
            Some(first) => ThreadId(first),
            None => fatal(FatalSource::SchedulerInconsistency, priority as usize),
        }
    }
}

impl Scheduler for PriorityScheduler {
    const MANAGES_SMP: bool = false;

    fn start_idle(&mut self, ctx: &mut SchedContext<'_>, idle: ThreadId, cpu: CpuId) {
        self.cpu = cpu;
        let priority = match ctx.threads.get(idle) {
            Ok(tcb) => tcb.priority,
            Err(_) => fatal(FatalSource::SchedulerInconsistency, idle.0),
        };
        self.enqueue_tail(ctx, idle, priority);
        install_heir(ctx, cpu, idle, true);
    }

    fn block(&mut self, ctx: &mut SchedContext<'_>, tid: ThreadId) {
        let priority = match ctx.threads.get_mut(tid) {
            Ok(tcb) => {
                debug_assert!(matches!(
                    tcb.sched.state,
                    SchedState::Ready | SchedState::Scheduled
                ));
                tcb.priority
            }
            Err(_) => {
                debug_assert!(false, "blocking unknown thread");
                return;
            }
        };
        self.extract(ctx, tid, priority);
        if let Ok(tcb) = ctx.threads.get_mut(tid) {
            tcb.sched.state = SchedState::Blocked;
            tcb.sched.cpu = None;
        }

        if ctx.cpus.get(self.cpu).heir == Some(tid) {
            let heir = self.highest_ready();
            trace!("heir {} blocked, {} takes over", tid, heir);
            install_heir(ctx, self.cpu, heir, true);
        }
    }

    fn unblock(&mut self, ctx: &mut SchedContext<'_>, tid: ThreadId) {
        let priority = match ctx.threads.get_mut(tid) {
            Ok(tcb) => {
                tcb.sched.state = SchedState::Ready;
                tcb.priority
            }
            Err(_) => {
                debug_assert!(false, "unblocking unknown thread");
                return;
            }
        };
        self.enqueue_tail(ctx, tid, priority);

        // Preempt only a numerically-higher, preemptible heir.
        let heir = ctx.cpus.get(self.cpu).heir;
        let preempt = match heir.and_then(|h| ctx.threads.get(h).ok()) {
            Some(heir_tcb) => priority < heir_tcb.priority && heir_tcb.preemptible,
            None => true,
        };
        if preempt {
            install_heir(ctx, self.cpu, tid, true);
        }
    }

    fn yield_now(&mut self, ctx: &mut SchedContext<'_>, tid: ThreadId) {
        let priority = match ctx.threads.get(tid) {
            Ok(tcb) => tcb.priority,
            Err(_) => return,
        };
        self.extract(ctx, tid, priority);
        self.enqueue_tail(ctx, tid, priority);
        if let Ok(tcb) = ctx.threads.get_mut(tid) {
            if tcb.sched.state == SchedState::Scheduled {
                tcb.sched.state = SchedState::Ready;
                tcb.sched.cpu = None;
            }
        }
        let heir = self.highest_ready();
        install_heir(ctx, self.cpu, heir, true);
    }

    fn update_priority(&mut self, ctx: &mut SchedContext<'_>, tid: ThreadId, new: Priority) {
        let (old, queued) = match ctx.threads.get(tid) {
            Ok(tcb) => (
                tcb.priority,
                matches!(
                    tcb.sched.state,
                    SchedState::Ready | SchedState::Scheduled
                ),
            ),
            Err(_) => return,
        };
        if queued {
            self.extract(ctx, tid, old);
        }
        if let Ok(tcb) = ctx.threads.get_mut(tid) {
            tcb.priority = new;
            tcb.sched.bitmap = BitmapInfo::new(new);
        }
        if queued {
            self.enqueue_tail(ctx, tid, new);
            let heir = self.highest_ready();
            install_heir(ctx, self.cpu, heir, true);
        }
    }
}
