//! Scheduler core.
//!
//! A scheduler instance owns its private ready-queue state and governs one
//! or more processors. The algorithm is selected at configuration time
//! through the type parameter of [`crate::kernel::Kernel`], so the hot
//! dispatch path is statically dispatched.
//!
//! None of these operations return errors: invariants are guaranteed by the
//! caller's use of the public kernel API and re-checked only by debug
//! assertions.

pub mod priority;
pub mod smp_simple;

use crate::dispatch::{self, CpuSet};
use crate::error::{fatal, FatalSource};
use crate::platform::Platform;
use crate::thread::{SchedState, ThreadId, ThreadSet};
use crate::{CpuId, Priority};

/// Mutable view of the kernel state a scheduler operation may touch.
pub struct SchedContext<'a> {
    pub threads: &'a mut ThreadSet,
    pub cpus: &'a mut CpuSet,
    pub platform: &'a Platform,
    /// The processor this operation runs on; dispatch requests for other
    /// processors go out as doorbell interrupts.
    pub current_cpu: CpuId,
}

/// One scheduling algorithm plus its ready-queue state.
pub trait Scheduler {
    /// Whether instances of this algorithm may govern more than one
    /// processor.
    const MANAGES_SMP: bool;

    /// Installs the idle placeholder for `cpu` and makes it the heir.
    fn start_idle(&mut self, ctx: &mut SchedContext<'_>, idle: ThreadId, cpu: CpuId);

    /// Takes `tid` out of the ready set. If it was scheduled, a new heir is
    /// selected for its processor.
    fn block(&mut self, ctx: &mut SchedContext<'_>, tid: ThreadId);

    /// Puts `tid` into the ready set, preempting a lower-priority heir
    /// where the preemption rules allow it.
    fn unblock(&mut self, ctx: &mut SchedContext<'_>, tid: ThreadId);

    /// Voluntarily rotates `tid` to the tail of its priority level and
    /// re-selects.
    fn yield_now(&mut self, ctx: &mut SchedContext<'_>, tid: ThreadId);

    /// Applies a priority change to a ready or blocked thread.
    fn update_priority(&mut self, ctx: &mut SchedContext<'_>, tid: ThreadId, new: Priority);

    /// A ready thread whose processor is occupied asks another processor to
    /// run it. Returns whether help was provided.
    fn ask_for_help(&mut self, _ctx: &mut SchedContext<'_>, _tid: ThreadId) -> bool {
        false
    }

    /// Withdraws a pending help request that can no longer succeed.
    fn reconsider_help_request(&mut self, _ctx: &mut SchedContext<'_>, _tid: ThreadId) {}

    /// Adds `cpu` (with its idle placeholder) to the governed set.
    fn add_processor(&mut self, _ctx: &mut SchedContext<'_>, _idle: ThreadId, _cpu: CpuId) {
        debug_assert!(Self::MANAGES_SMP, "not an SMP scheduler");
    }

    /// Removes `cpu` from the governed set, substituting the idle
    /// placeholder for whatever ran there.
    fn remove_processor(&mut self, _ctx: &mut SchedContext<'_>, _cpu: CpuId) {
        debug_assert!(Self::MANAGES_SMP, "not an SMP scheduler");
    }
}

/// Installs `new_heir` on `cpu` and requests a dispatch.
///
/// The request is suppressed when the displaced heir is not preemptible and
/// the change is not forced; the new heir pointer still lands, so the switch
/// happens once the running thread voluntarily yields control.
pub(crate) fn install_heir(
    ctx: &mut SchedContext<'_>,
    cpu: CpuId,
    new_heir: ThreadId,
    force: bool,
) {
    let previous = ctx.cpus.get(cpu).heir;
    if previous == Some(new_heir) {
        // Re-selected; make sure a prior rotation did not leave it demoted.
        if let Ok(tcb) = ctx.threads.get_mut(new_heir) {
            tcb.sched.state = SchedState::Scheduled;
            tcb.sched.cpu = Some(cpu);
        }
        return;
    }

    if let Some(prev) = previous {
        if let Ok(tcb) = ctx.threads.get_mut(prev) {
            if tcb.sched.state == SchedState::Scheduled {
                tcb.sched.state = SchedState::Ready;
                tcb.sched.cpu = None;
            }
        }
    }
    {
        let Ok(tcb) = ctx.threads.get_mut(new_heir) else {
            fatal(FatalSource::SchedulerInconsistency, new_heir.0);
        };
        tcb.sched.state = SchedState::Scheduled;
        tcb.sched.cpu = Some(cpu);
        tcb.sched.needs_help = false;
    }

    ctx.cpus.get_mut(cpu).heir = Some(new_heir);

    let immediate = force
        || previous
            .and_then(|prev| ctx.threads.get(prev).ok())
            .map_or(true, |tcb| tcb.preemptible);
    if immediate {
        dispatch::request(ctx.cpus, ctx.platform, ctx.current_cpu, cpu);
    }
}
