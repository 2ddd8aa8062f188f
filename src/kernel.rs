//! The kernel: one owned value tying the subsystems together.
//!
//! A [`Kernel`] owns every arena (threads, semaphores, watchdogs), the
//! per-processor dispatch state and the scheduler instance; all cross-module
//! operations go through it so the borrow checker sees the disjoint pieces.
//! The scheduling algorithm is a type parameter, selected once at
//! configuration time.
//!
//! Blocking operations here follow the host-testable model: they enqueue the
//! thread and record the block, the caller observes the outcome later
//! through [`crate::thread::Tcb::wait_status`]. On a real target the context
//! switch happens inside [`Kernel::do_dispatch`] via the registered switch
//! hooks.

use core::fmt::Write as _;

use arrayvec::{ArrayString, ArrayVec};
use bit_field::BitField;
use log::{debug, info, trace};

use crate::config::Config;
use crate::dispatch::{CpuSet, SwitchHook, MAX_SWITCH_HOOKS};
use crate::error::{fatal, FatalSource, SemError, ThreadError, WaitStatus};
use crate::irq::VectorTable;
use crate::platform::Platform;
use crate::sched::{SchedContext, Scheduler};
use crate::sem::{SemAttributes, SemId, SemSet, Surrender};
use crate::smp;
use crate::thread::{
    SchedState, ThreadAttributes, ThreadEntry, ThreadId, ThreadSet, MAX_NAME_LEN,
};
use crate::watchdog::{WatchdogAction, WatchdogId, WatchdogSet};
use crate::{CpuId, Priority};

/// Number of interrupt vectors the handler table covers.
pub const VECTOR_COUNT: usize = 256;

pub struct Kernel<S: Scheduler> {
    config: Config,
    pub(crate) platform: Platform,
    pub(crate) cpus: CpuSet,
    pub(crate) threads: ThreadSet,
    semaphores: SemSet,
    watchdogs: WatchdogSet,
    scheduler: S,
    pub(crate) vectors: VectorTable,
    switch_hooks: ArrayVec<SwitchHook, MAX_SWITCH_HOOKS>,
    pub(crate) clock_vector: Option<usize>,
    pub(crate) doorbell_vector: Option<usize>,
    ticks: u64,
    /// The processor the current call chain runs on. Updated by the per-CPU
    /// entry paths; single-processor callers leave it at zero.
    current_cpu: CpuId,
}

impl<S: Scheduler> Kernel<S> {
    /// Builds the kernel from a validated configuration table.
    ///
    /// An inconsistent table is fatal; there is no partial bring-up.
    pub fn new(config: Config, platform: Platform, scheduler: S) -> Kernel<S> {
        if let Err(code) = config.validate() {
            fatal(FatalSource::InvalidConfiguration, code);
        }
        let cpus = CpuSet::new(config.processor_count());
        let threads = ThreadSet::with_capacity(config.max_threads);
        let semaphores = SemSet::with_capacity(config.max_semaphores);
        let watchdogs = WatchdogSet::with_capacity(config.watchdog_slots());
        Kernel {
            config,
            platform,
            cpus,
            threads,
            semaphores,
            watchdogs,
            scheduler,
            vectors: VectorTable::with_capacity(VECTOR_COUNT),
            switch_hooks: ArrayVec::new(),
            clock_vector: None,
            doorbell_vector: None,
            ticks: 0,
            current_cpu: 0,
        }
    }

    /// Brings the configured processors online and installs an idle
    /// placeholder on each governed one.
    pub fn initialize(&mut self) {
        let online = smp::initialize(&mut self.cpus, &self.platform, &self.config);
        info!("kernel init: {} processors online", online);

        let governed = if S::MANAGES_SMP { self.cpus.count() } else { 1 };
        for cpu in 0..governed {
            if !self.cpus.get(cpu).is_online() {
                continue;
            }
            let idle = self.spawn_idle(cpu);
            self.with_sched(cpu, |sched, ctx| sched.start_idle(ctx, idle, cpu));
            let state = self.cpus.get_mut(cpu);
            state.executing = Some(idle);
            state.dispatch_necessary = false;
        }
    }

    fn spawn_idle(&mut self, cpu: CpuId) -> ThreadId {
        let mut name = ArrayString::<MAX_NAME_LEN>::new();
        let _ = write!(name, "idle-{}", cpu);
        let priority = (self.config.priority_levels - 1) as Priority;
        let timer = match self.watchdogs.allocate(WatchdogAction::Routine(noop, 0)) {
            Some(id) => id,
            None => fatal(FatalSource::InvalidConfiguration, 4),
        };
        let idle = match self
            .threads
            .allocate(&name, priority, ThreadAttributes::default(), timer)
        {
            Ok(id) => id,
            Err(_) => fatal(FatalSource::InvalidConfiguration, 4),
        };
        if let Ok(tcb) = self.threads.get_mut(idle) {
            tcb.is_idle = true;
        }
        idle
    }

    fn with_sched<R>(
        &mut self,
        cpu: CpuId,
        f: impl FnOnce(&mut S, &mut SchedContext<'_>) -> R,
    ) -> R {
        let Kernel {
            scheduler,
            threads,
            cpus,
            platform,
            ..
        } = self;
        let mut ctx = SchedContext {
            threads,
            cpus,
            platform,
            current_cpu: cpu,
        };
        f(scheduler, &mut ctx)
    }

    /// Runs `f` with thread dispatching disabled on the current processor.
    /// Whatever handover `f` made necessary happens at the final enable.
    fn with_dispatch_disabled<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let cpu = self.current_cpu;
        self.cpus.dispatch_disable(cpu);
        let result = f(self);
        self.dispatch_enable(cpu);
        result
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Tells the kernel which processor the current call chain runs on.
    pub fn set_current_cpu(&mut self, cpu: CpuId) {
        self.current_cpu = cpu;
    }

    // ---- thread lifecycle -------------------------------------------------

    /// Creates a dormant thread.
    pub fn create_thread(
        &mut self,
        name: &str,
        priority: Priority,
        attrs: ThreadAttributes,
    ) -> Result<ThreadId, ThreadError> {
        if priority as usize >= self.config.priority_levels {
            return Err(ThreadError::InvalidPriority);
        }
        if attrs.affinity & self.online_mask() == 0 {
            return Err(ThreadError::InvalidAffinity);
        }
        // The watchdog action needs the thread id, so claim the TCB first
        // and patch the timer slot in afterwards.
        let tid = self
            .threads
            .allocate(name, priority, attrs, WatchdogId(usize::MAX))?;
        let timer = match self.watchdogs.allocate(WatchdogAction::ThreadTimeout(tid)) {
            Some(id) => id,
            None => {
                self.threads.release(tid);
                return Err(ThreadError::NoTimerSlot);
            }
        };
        if let Ok(tcb) = self.threads.get_mut(tid) {
            tcb.wait.timer = timer;
        }
        debug!("created {} ({:?})", tid, self.threads.get(tid));
        Ok(tid)
    }

    /// Makes a dormant thread ready at `entry`.
    pub fn start_thread(
        &mut self,
        tid: ThreadId,
        entry: ThreadEntry,
        arg: usize,
    ) -> Result<(), ThreadError> {
        let tcb = self.threads.get_mut(tid)?;
        if tcb.sched.state != SchedState::Dormant {
            return Err(ThreadError::AlreadyStarted);
        }
        tcb.entry = Some((entry, arg));
        tcb.wait.status = WaitStatus::Success;
        self.with_dispatch_disabled(|k| {
            let cpu = k.current_cpu;
            k.with_sched(cpu, |sched, ctx| sched.unblock(ctx, tid));
        });
        Ok(())
    }

    /// Resets a started thread to run `entry` from scratch: pending waits
    /// are abandoned and a blocked thread becomes ready again.
    pub fn restart_thread(
        &mut self,
        tid: ThreadId,
        entry: ThreadEntry,
        arg: usize,
    ) -> Result<(), ThreadError> {
        let state = self.threads.get(tid)?.sched.state;
        if state == SchedState::Dormant {
            return Err(ThreadError::NotStarted);
        }
        self.abandon_wait(tid);
        let tcb = self.threads.get_mut(tid)?;
        tcb.entry = Some((entry, arg));
        tcb.wait.status = WaitStatus::Success;
        if state == SchedState::Blocked {
            self.with_dispatch_disabled(|k| {
                let cpu = k.current_cpu;
                k.with_sched(cpu, |sched, ctx| sched.unblock(ctx, tid));
            });
        }
        Ok(())
    }

    /// Removes a thread from the system and reclaims its control blocks.
    pub fn delete_thread(&mut self, tid: ThreadId) -> Result<(), ThreadError> {
        let tcb = self.threads.get(tid)?;
        if tcb.is_idle {
            // Idle placeholders belong to the kernel.
            return Err(ThreadError::InvalidId);
        }
        let state = tcb.sched.state;
        let timer = tcb.wait.timer;
        self.abandon_wait(tid);
        if matches!(state, SchedState::Ready | SchedState::Scheduled) {
            self.with_dispatch_disabled(|k| {
                let cpu = k.current_cpu;
                k.with_sched(cpu, |sched, ctx| sched.block(ctx, tid));
            });
        }
        self.watchdogs.release(timer);
        self.threads.release(tid);
        debug!("deleted {}", tid);
        Ok(())
    }

    /// Changes the priority of a thread, reordering whatever queue it sits
    /// on. Returns the previous priority.
    pub fn set_priority(&mut self, tid: ThreadId, new: Priority) -> Result<Priority, ThreadError> {
        if new as usize >= self.config.priority_levels {
            return Err(ThreadError::InvalidPriority);
        }
        let old = self.threads.get(tid)?.priority;
        let queued_on = self.threads.get(tid)?.wait.queued_on;
        self.with_dispatch_disabled(|k| match queued_on {
            Some(sem_id) => {
                // Blocked on a semaphore: reorder the wait queue under the
                // new priority.
                let Kernel {
                    semaphores,
                    threads,
                    ..
                } = k;
                if let Ok(sem) = semaphores.get_mut(sem_id) {
                    if sem.queue.extract(threads, tid) {
                        if let Ok(tcb) = threads.get_mut(tid) {
                            tcb.priority = new;
                        }
                        sem.queue.enqueue(threads, tid);
                    }
                }
                if let Ok(tcb) = k.threads.get_mut(tid) {
                    tcb.priority = new;
                    tcb.sched.bitmap = crate::bitmap::BitmapInfo::new(new);
                }
            }
            None => {
                let cpu = k.current_cpu;
                k.with_sched(cpu, |sched, ctx| sched.update_priority(ctx, tid, new));
            }
        });
        Ok(old)
    }

    /// Restricts the processors a thread may run on.
    pub fn set_affinity(&mut self, tid: ThreadId, affinity: u64) -> Result<(), ThreadError> {
        if affinity & self.online_mask() == 0 {
            return Err(ThreadError::InvalidAffinity);
        }
        self.threads.get_mut(tid)?.affinity = affinity;
        Ok(())
    }

    /// Voluntarily gives up the processor within the priority level.
    pub fn yield_thread(&mut self, tid: ThreadId) -> Result<(), ThreadError> {
        self.threads.get(tid)?;
        self.with_dispatch_disabled(|k| {
            let cpu = k.current_cpu;
            k.with_sched(cpu, |sched, ctx| sched.yield_now(ctx, tid));
        });
        Ok(())
    }

    fn online_mask(&self) -> u64 {
        let mut mask = 0u64;
        for cpu in 0..self.cpus.count() {
            if self.cpus.get(cpu).is_online() {
                mask.set_bit(cpu, true);
            }
        }
        mask
    }

    /// Pulls `tid` off any wait queue and disarms its timer, without
    /// delivering a status. Used by restart and delete.
    fn abandon_wait(&mut self, tid: ThreadId) {
        let (timer, queued_on) = match self.threads.get(tid) {
            Ok(tcb) => (tcb.wait.timer, tcb.wait.queued_on),
            Err(_) => return,
        };
        if let Some(sem_id) = queued_on {
            let Kernel {
                semaphores,
                threads,
                ..
            } = self;
            if let Ok(sem) = semaphores.get_mut(sem_id) {
                let _ = sem.queue.extract(threads, tid);
            }
            if let Ok(tcb) = threads.get_mut(tid) {
                tcb.wait.queued_on = None;
            }
        }
        if timer.0 != usize::MAX {
            self.watchdogs.remove(timer);
        }
    }

    // ---- semaphores -------------------------------------------------------

    pub fn create_semaphore(
        &mut self,
        name: &str,
        attrs: SemAttributes,
    ) -> Result<SemId, SemError> {
        self.semaphores.allocate(name, attrs)
    }

    pub fn semaphore(&self, id: SemId) -> Result<&crate::sem::CoreSemaphore, SemError> {
        self.semaphores.get(id)
    }

    /// Obtains one unit for `tid`.
    ///
    /// Returns `Success` when a unit was immediately available and `Pending`
    /// when the thread blocked; the final outcome of a pending wait shows up
    /// in the thread's wait status once a surrender, a timeout or a deletion
    /// resolves it. With `wait` false an empty semaphore fails `Unsatisfied`
    /// instead of blocking; a timeout of zero ticks declines the wait the
    /// same way.
    pub fn semaphore_seize(
        &mut self,
        id: SemId,
        tid: ThreadId,
        wait: bool,
        timeout: Option<u64>,
    ) -> Result<WaitStatus, SemError> {
        self.with_dispatch_disabled(|k| k.seize_inner(id, tid, wait, timeout))
    }

    fn seize_inner(
        &mut self,
        id: SemId,
        tid: ThreadId,
        wait: bool,
        timeout: Option<u64>,
    ) -> Result<WaitStatus, SemError> {
        if self.threads.get(tid).is_err() {
            return Err(SemError::InvalidId);
        }
        {
            let sem = self.semaphores.get_mut(id)?;
            if sem.try_seize() {
                if let Ok(tcb) = self.threads.get_mut(tid) {
                    tcb.wait.status = WaitStatus::Success;
                }
                return Ok(WaitStatus::Success);
            }
        }
        if !wait || timeout == Some(0) {
            if let Ok(tcb) = self.threads.get_mut(tid) {
                tcb.wait.status = WaitStatus::Unsatisfied;
            }
            return Err(SemError::Unsatisfied);
        }

        // Off the ready set first: the chain link is shared between the
        // ready queues and the wait queue.
        let cpu = self.current_cpu;
        self.with_sched(cpu, |sched, ctx| sched.block(ctx, tid));
        let timer = {
            let Kernel {
                semaphores,
                threads,
                ..
            } = self;
            let sem = semaphores.get_mut(id)?;
            sem.queue.enqueue(threads, tid);
            let tcb = threads.get_mut(tid).map_err(|_| SemError::InvalidId)?;
            tcb.wait.queued_on = Some(id);
            tcb.wait.status = WaitStatus::Pending;
            tcb.wait.timer
        };
        if let Some(ticks) = timeout {
            self.watchdogs.insert(timer, ticks);
        }
        trace!("{} blocked on {}", tid, id);
        Ok(WaitStatus::Pending)
    }

    /// Releases one unit.
    ///
    /// With a waiter present the unit is handed over directly and the count
    /// stays untouched; otherwise the count absorbs it, up to the ceiling.
    pub fn semaphore_surrender(&mut self, id: SemId) -> Result<(), SemError> {
        self.with_dispatch_disabled(|k| k.surrender_inner(id))
    }

    fn surrender_inner(&mut self, id: SemId) -> Result<(), SemError> {
        let outcome = {
            let Kernel {
                semaphores,
                threads,
                ..
            } = self;
            semaphores.get_mut(id)?.surrender(threads)?
        };
        if let Surrender::HandedTo(waiter) = outcome {
            self.complete_wait(waiter, WaitStatus::Success);
            trace!("{} handed to {}", id, waiter);
        }
        Ok(())
    }

    /// Wakes every waiter with `Unsatisfied`; the count is not changed.
    pub fn semaphore_flush(&mut self, id: SemId) -> Result<(), SemError> {
        self.with_dispatch_disabled(|k| k.flush_with_status(id, WaitStatus::Unsatisfied))
    }

    /// Deletes the semaphore, waking every waiter with `ObjectDeleted`.
    pub fn semaphore_destroy(&mut self, id: SemId) -> Result<(), SemError> {
        self.with_dispatch_disabled(|k| {
            k.flush_with_status(id, WaitStatus::ObjectDeleted)?;
            k.semaphores.release(id);
            Ok(())
        })
    }

    fn flush_with_status(&mut self, id: SemId, status: WaitStatus) -> Result<(), SemError> {
        loop {
            let waiter = {
                let Kernel {
                    semaphores,
                    threads,
                    ..
                } = self;
                semaphores.get_mut(id)?.queue.dequeue_first(threads)
            };
            match waiter {
                Some(tid) => self.complete_wait(tid, status),
                None => return Ok(()),
            }
        }
    }

    /// Finishes a resolved wait: status delivery, timer disarm, unblock.
    /// The thread is already off the wait queue.
    fn complete_wait(&mut self, tid: ThreadId, status: WaitStatus) {
        let timer = match self.threads.get_mut(tid) {
            Ok(tcb) => {
                tcb.wait.queued_on = None;
                tcb.wait.status = status;
                tcb.wait.timer
            }
            Err(_) => return,
        };
        self.watchdogs.remove(timer);
        let cpu = self.current_cpu;
        self.with_sched(cpu, |sched, ctx| sched.unblock(ctx, tid));
    }

    // ---- timers and the clock --------------------------------------------

    /// Arms a free-standing timer routine `ticks` from now. The slot frees
    /// itself when the timer fires; cancelling reclaims it early.
    pub fn timer_fire_after(
        &mut self,
        ticks: u64,
        routine: fn(usize),
        arg: usize,
    ) -> Result<WatchdogId, ThreadError> {
        if ticks == 0 {
            return Err(ThreadError::InvalidInterval);
        }
        let id = self
            .watchdogs
            .allocate(WatchdogAction::Routine(routine, arg))
            .ok_or(ThreadError::NoTimerSlot)?;
        self.watchdogs.insert(id, ticks);
        Ok(id)
    }

    /// Cancels a free-standing timer; returns the ticks that were left.
    /// A timer that already fired gave its slot back, so cancelling its
    /// handle is a zero no-op.
    pub fn timer_cancel(&mut self, id: WatchdogId) -> u64 {
        if !self.watchdogs.is_allocated(id) {
            return 0;
        }
        let remaining = self.watchdogs.remove(id);
        self.watchdogs.release(id);
        remaining
    }

    /// Announces one clock tick: advances the delta chain and resolves every
    /// expired bounded wait.
    pub fn clock_tick(&mut self) {
        self.ticks += 1;
        let Kernel {
            watchdogs,
            threads,
            semaphores,
            cpus,
            platform,
            scheduler,
            current_cpu,
            ..
        } = self;
        let mut fired_routines = crate::ds::Vec::new();
        watchdogs.tickle(|id, action| match action {
            WatchdogAction::Routine(routine, arg) => {
                fired_routines.push(id);
                routine(arg)
            }
            WatchdogAction::ThreadTimeout(tid) => {
                // The surrender path and this timeout race for the waiter;
                // wait-queue extraction arbitrates, exactly one side wins.
                let Some(sem_id) = threads.get(tid).ok().and_then(|t| t.wait.queued_on) else {
                    return;
                };
                let Ok(sem) = semaphores.get_mut(sem_id) else {
                    return;
                };
                if !sem.queue.extract(threads, tid) {
                    return;
                }
                if let Ok(tcb) = threads.get_mut(tid) {
                    tcb.wait.queued_on = None;
                    tcb.wait.status = WaitStatus::Timeout;
                }
                trace!("{} timed out on {}", tid, sem_id);
                let mut ctx = SchedContext {
                    threads,
                    cpus,
                    platform,
                    current_cpu: *current_cpu,
                };
                scheduler.unblock(&mut ctx, tid);
            }
        });
        // One-shot routine slots free themselves once fired. Thread timeout
        // slots live as long as their thread and stay allocated.
        for id in fired_routines {
            watchdogs.release(id);
        }
    }

    /// Shifts pending timers when an external clock source jumps.
    pub fn clock_adjust_forward(&mut self, ticks: u64) {
        // Expiries consumed by the jump fire through the regular path.
        for _ in 0..ticks {
            self.clock_tick();
        }
    }

    pub fn clock_adjust_backward(&mut self, ticks: u64) {
        self.watchdogs.adjust_backward(ticks);
    }

    // ---- dispatch ---------------------------------------------------------

    /// Disables thread dispatching on `cpu`; nestable.
    pub fn dispatch_disable(&mut self, cpu: CpuId) -> u32 {
        self.cpus.dispatch_disable(cpu)
    }

    /// Re-enables thread dispatching; the switch deferred while disabled is
    /// performed when the level returns to zero outside interrupt context.
    pub fn dispatch_enable(&mut self, cpu: CpuId) {
        let state = self.cpus.get_mut(cpu);
        if state.dispatch_disable_level == 0 {
            fatal(FatalSource::DispatchLevelUnderflow, cpu);
        }
        state.dispatch_disable_level -= 1;
        let dispatch_now = state.dispatch_disable_level == 0
            && state.dispatch_necessary
            && state.isr_nest_level == 0;
        if dispatch_now {
            self.do_dispatch(cpu);
        }
    }

    /// Synchronous dispatch for paths that know they hold exactly one
    /// disable level (blocking operations about to switch away).
    pub fn direct_dispatch(&mut self, cpu: CpuId) {
        let state = self.cpus.get_mut(cpu);
        if state.dispatch_disable_level != 1 {
            fatal(FatalSource::BadDirectDispatchLevel, state.dispatch_disable_level as usize);
        }
        state.dispatch_disable_level = 0;
        if state.dispatch_necessary {
            self.do_dispatch(cpu);
        }
    }

    /// Performs the executing/heir handover on `cpu`, repeating while the
    /// switch itself makes further dispatches necessary.
    pub(crate) fn do_dispatch(&mut self, cpu: CpuId) {
        loop {
            let state = self.cpus.get_mut(cpu);
            if !state.dispatch_necessary {
                return;
            }
            state.dispatch_necessary = false;
            let outgoing = state.executing;
            let Some(heir) = state.heir else {
                return;
            };
            if outgoing == Some(heir) {
                continue;
            }
            state.executing = Some(heir);
            trace!("cpu {} switches {:?} -> {}", cpu, outgoing, heir);
            for hook in &self.switch_hooks {
                hook(outgoing, heir);
            }
        }
    }

    /// Registers a thread-switch extension, run on every handover. Returns
    /// whether a slot was free.
    pub fn register_switch_hook(&mut self, hook: SwitchHook) -> bool {
        self.switch_hooks.try_push(hook).is_ok()
    }

    // ---- interrupts and SMP ----------------------------------------------

    /// Routes `vector` to [`Kernel::clock_tick`].
    pub fn set_clock_vector(&mut self, vector: usize) {
        self.clock_vector = Some(vector);
    }

    /// Routes `vector` to the inter-processor message handler.
    pub fn set_doorbell_vector(&mut self, vector: usize) {
        self.doorbell_vector = Some(vector);
    }

    pub(crate) fn service_doorbell(&mut self, cpu: CpuId) {
        let _ = smp::process_message(&mut self.cpus, &self.platform, cpu);
    }

    /// Runs `handler` on every online processor in the `targets` mask and
    /// waits for completion.
    pub fn multicast(&mut self, targets: u64, handler: fn(usize), arg: usize) {
        let job = smp::multicast_begin(
            &self.cpus,
            &self.platform,
            self.current_cpu,
            targets,
            handler,
            arg,
        );
        smp::multicast_finish(&self.platform, &job);
    }

    /// Requests every other processor to halt, then stops this one.
    pub fn shutdown(&mut self) -> ! {
        smp::shutdown_others(&self.cpus, &self.platform, self.current_cpu);
        fatal(FatalSource::Shutdown, self.current_cpu)
    }

    /// Hands the boot processor to its heir and enters the platform idle
    /// loop. The system runs on interrupts from here on.
    pub fn start_multitasking(&mut self) -> ! {
        let cpu = self.current_cpu;
        self.cpus.get_mut(cpu).dispatch_necessary = true;
        self.do_dispatch(cpu);
        (self.platform.idle)(cpu)
    }

    /// Entry point for a secondary processor after low-level bring-up.
    pub fn secondary_entry(&self, cpu: CpuId) -> ! {
        smp::start_on_secondary(&self.cpus, &self.platform, cpu)
    }
}

fn noop(_arg: usize) {}

// ---- process-wide instance ------------------------------------------------

/// The kernel type the bring-up entry points use.
pub type SystemKernel = Kernel<crate::sched::smp_simple::SimpleSmpScheduler>;

static SYSTEM: spin::Once<spin::Mutex<SystemKernel>> = spin::Once::new();

/// Installs the process-wide kernel instance. Later calls return the first
/// instance unchanged.
pub fn install_system(kernel: SystemKernel) -> &'static spin::Mutex<SystemKernel> {
    SYSTEM.call_once(|| spin::Mutex::new(kernel))
}

/// The process-wide kernel, if one was installed.
pub fn system() -> Option<&'static spin::Mutex<SystemKernel>> {
    SYSTEM.get()
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::sched::priority::PriorityScheduler;
    use crate::threadq::Discipline;

    fn kernel() -> Kernel<PriorityScheduler> {
        let _r = env_logger::try_init();
        let config = Config::default();
        let levels = config.priority_levels;
        let mut kernel = Kernel::new(config, Platform::default(), PriorityScheduler::new(levels));
        kernel.initialize();
        kernel
    }

    fn entry(_arg: usize) {}

    fn spawn(kernel: &mut Kernel<PriorityScheduler>, name: &str, priority: Priority) -> ThreadId {
        let tid = kernel
            .create_thread(name, priority, ThreadAttributes::default())
            .unwrap();
        kernel.start_thread(tid, entry, 0).unwrap();
        tid
    }

    #[test]
    fn thread_lifecycle() {
        let mut k = kernel();
        let tid = k
            .create_thread("worker", 10, ThreadAttributes::default())
            .unwrap();
        assert_eq!(k.threads.get(tid).unwrap().state(), SchedState::Dormant);

        k.start_thread(tid, entry, 7).unwrap();
        assert_eq!(
            k.start_thread(tid, entry, 7),
            Err(ThreadError::AlreadyStarted)
        );
        assert_eq!(k.threads.get(tid).unwrap().state(), SchedState::Scheduled);

        k.delete_thread(tid).unwrap();
        assert!(k.threads.get(tid).is_err());
    }

    #[test]
    fn create_rejects_bad_parameters() {
        let mut k = kernel();
        let mut bad_priority = ThreadAttributes::default();
        bad_priority.affinity = u64::MAX;
        assert_eq!(
            k.create_thread("p", 255, bad_priority).err(),
            None // 255 is the last valid level of the default 256
        );
        let config = Config {
            priority_levels: 8,
            ..Default::default()
        };
        let mut small = Kernel::new(config, Platform::default(), PriorityScheduler::new(8));
        small.initialize();
        assert_eq!(
            small
                .create_thread("p", 8, ThreadAttributes::default())
                .err(),
            Some(ThreadError::InvalidPriority)
        );

        let mut offline = ThreadAttributes::default();
        offline.affinity = 1 << 5; // processor 5 is not online
        assert_eq!(
            k.create_thread("a", 10, offline).err(),
            Some(ThreadError::InvalidAffinity)
        );
    }

    #[test]
    fn restart_requires_a_started_thread() {
        let mut k = kernel();
        let tid = k
            .create_thread("w", 10, ThreadAttributes::default())
            .unwrap();
        assert_eq!(k.restart_thread(tid, entry, 0), Err(ThreadError::NotStarted));
        k.start_thread(tid, entry, 0).unwrap();
        k.restart_thread(tid, entry, 1).unwrap();
        assert_eq!(k.threads.get(tid).unwrap().state(), SchedState::Scheduled);
    }

    #[test]
    fn surrender_hands_off_directly_count_untouched() {
        let mut k = kernel();
        let sem = k.create_semaphore("s", SemAttributes::default()).unwrap();
        let waiter = spawn(&mut k, "waiter", 5);

        assert_eq!(
            k.semaphore_seize(sem, waiter, true, None),
            Ok(WaitStatus::Pending)
        );
        assert_eq!(k.threads.get(waiter).unwrap().state(), SchedState::Blocked);

        k.semaphore_surrender(sem).unwrap();
        // Hand-off: the waiter got the unit, the count never moved.
        assert_eq!(k.semaphore(sem).unwrap().count(), 0);
        assert_eq!(k.threads.get(waiter).unwrap().wait_status(), WaitStatus::Success);
        assert_eq!(k.threads.get(waiter).unwrap().state(), SchedState::Scheduled);
    }

    #[test]
    fn blocking_moves_the_shared_link_to_the_wait_queue() {
        use crate::chain::Links;

        let mut k = kernel();
        let sem = k.create_semaphore("s", SemAttributes::default()).unwrap();
        let t = spawn(&mut k, "t", 5);

        k.semaphore_seize(sem, t, true, None).unwrap();
        assert_eq!(k.threads.get(t).unwrap().state(), SchedState::Blocked);
        assert!(k.threads.links().link(t.0).is_queued());

        // Another thread on the same priority level must not collide with
        // the blocked thread's chain link.
        let other = spawn(&mut k, "other", 5);
        k.yield_thread(other).unwrap();
        assert_eq!(k.threads.get(t).unwrap().state(), SchedState::Blocked);
    }

    #[test]
    fn zero_tick_timeout_declines_to_wait() {
        let mut k = kernel();
        let sem = k.create_semaphore("s", SemAttributes::default()).unwrap();
        let t = spawn(&mut k, "t", 5);
        assert_eq!(
            k.semaphore_seize(sem, t, true, Some(0)),
            Err(SemError::Unsatisfied)
        );
        assert_eq!(k.threads.get(t).unwrap().state(), SchedState::Scheduled);
        assert_eq!(
            k.threads.get(t).unwrap().wait_status(),
            WaitStatus::Unsatisfied
        );
    }

    #[test]
    fn woken_thread_receives_the_processor() {
        let mut k = kernel();
        let sem = k.create_semaphore("s", SemAttributes::default()).unwrap();
        let t = spawn(&mut k, "t", 5);
        assert_eq!(k.cpus.get(0).executing(), Some(t));

        // Blocking hands the processor back without an explicit enable.
        k.semaphore_seize(sem, t, true, None).unwrap();
        assert_ne!(k.cpus.get(0).executing(), Some(t));

        k.semaphore_surrender(sem).unwrap();
        assert_eq!(k.cpus.get(0).executing(), Some(t));

        // An equal-priority arrival takes over on a voluntary yield.
        let t2 = spawn(&mut k, "t2", 5);
        assert_eq!(k.cpus.get(0).executing(), Some(t));
        k.yield_thread(t).unwrap();
        assert_eq!(k.cpus.get(0).executing(), Some(t2));
    }

    #[test]
    fn no_wait_seize_fails_unsatisfied() {
        let mut k = kernel();
        let sem = k.create_semaphore("s", SemAttributes::default()).unwrap();
        let t = spawn(&mut k, "t", 5);
        assert_eq!(
            k.semaphore_seize(sem, t, false, None),
            Err(SemError::Unsatisfied)
        );
        assert_eq!(k.threads.get(t).unwrap().state(), SchedState::Scheduled);
    }

    #[test]
    fn bounded_wait_times_out_exactly_once() {
        let mut k = kernel();
        let sem = k.create_semaphore("s", SemAttributes::default()).unwrap();
        let t = spawn(&mut k, "t", 5);

        k.semaphore_seize(sem, t, true, Some(10)).unwrap();
        for _ in 0..9 {
            k.clock_tick();
        }
        assert_eq!(k.threads.get(t).unwrap().wait_status(), WaitStatus::Pending);

        k.clock_tick();
        assert_eq!(k.threads.get(t).unwrap().wait_status(), WaitStatus::Timeout);
        assert_eq!(k.threads.get(t).unwrap().state(), SchedState::Scheduled);

        // Nothing pending; extra ticks change nothing.
        for _ in 0..5 {
            k.clock_tick();
        }
        assert_eq!(k.threads.get(t).unwrap().wait_status(), WaitStatus::Timeout);
    }

    #[test]
    fn surrender_at_tick_nine_beats_the_timeout() {
        let mut k = kernel();
        let sem = k.create_semaphore("s", SemAttributes::default()).unwrap();
        let t = spawn(&mut k, "t", 5);

        k.semaphore_seize(sem, t, true, Some(10)).unwrap();
        for _ in 0..9 {
            k.clock_tick();
        }
        k.semaphore_surrender(sem).unwrap();
        assert_eq!(k.threads.get(t).unwrap().wait_status(), WaitStatus::Success);

        // The disarmed timer is a no-op at tick ten and beyond.
        for _ in 0..5 {
            k.clock_tick();
        }
        assert_eq!(k.threads.get(t).unwrap().wait_status(), WaitStatus::Success);
        assert_eq!(k.semaphore(sem).unwrap().count(), 0);
    }

    #[test]
    fn destroy_wakes_waiters_with_object_deleted() {
        let mut k = kernel();
        let sem = k
            .create_semaphore(
                "s",
                SemAttributes {
                    discipline: Discipline::Priority,
                    ..Default::default()
                },
            )
            .unwrap();
        let a = spawn(&mut k, "a", 5);
        let b = spawn(&mut k, "b", 6);
        k.semaphore_seize(sem, a, true, Some(50)).unwrap();
        k.semaphore_seize(sem, b, true, None).unwrap();

        k.semaphore_destroy(sem).unwrap();
        assert_eq!(
            k.threads.get(a).unwrap().wait_status(),
            WaitStatus::ObjectDeleted
        );
        assert_eq!(
            k.threads.get(b).unwrap().wait_status(),
            WaitStatus::ObjectDeleted
        );
        assert!(k.semaphore(sem).is_err());
        // The timer disarmed with the wait.
        for _ in 0..50 {
            k.clock_tick();
        }
        assert_eq!(
            k.threads.get(a).unwrap().wait_status(),
            WaitStatus::ObjectDeleted
        );
    }

    #[test]
    fn priority_change_reorders_wait_queue() {
        let mut k = kernel();
        let sem = k
            .create_semaphore(
                "s",
                SemAttributes {
                    discipline: Discipline::Priority,
                    ..Default::default()
                },
            )
            .unwrap();
        let a = spawn(&mut k, "a", 5);
        let b = spawn(&mut k, "b", 6);
        k.semaphore_seize(sem, a, true, None).unwrap();
        k.semaphore_seize(sem, b, true, None).unwrap();

        // b overtakes a, so the next surrender goes to b.
        k.set_priority(b, 2).unwrap();
        k.semaphore_surrender(sem).unwrap();
        assert_eq!(k.threads.get(b).unwrap().wait_status(), WaitStatus::Success);
        assert_eq!(k.threads.get(a).unwrap().wait_status(), WaitStatus::Pending);
    }

    #[test]
    #[should_panic(expected = "disable level already zero")]
    fn unbalanced_enable_is_fatal() {
        let mut k = kernel();
        k.dispatch_enable(0);
    }

    #[test]
    #[should_panic(expected = "disable level other than one")]
    fn direct_dispatch_needs_exactly_one_level() {
        let mut k = kernel();
        k.dispatch_disable(0);
        k.dispatch_disable(0);
        k.direct_dispatch(0);
    }

    static SWITCHES: AtomicUsize = AtomicUsize::new(0);

    fn count_switch(_outgoing: Option<ThreadId>, _incoming: ThreadId) {
        SWITCHES.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn switch_hooks_run_on_handover() {
        let mut k = kernel();
        assert!(k.register_switch_hook(count_switch));

        let before = SWITCHES.load(Ordering::SeqCst);
        let t = spawn(&mut k, "t", 5);
        k.do_dispatch(0);
        assert_eq!(k.cpus.get(0).executing(), Some(t));
        assert_eq!(SWITCHES.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn deferred_dispatch_waits_for_enable() {
        let mut k = kernel();
        k.dispatch_disable(0);
        let t = spawn(&mut k, "t", 5);
        // Heir moved but the handover is pending.
        assert_eq!(k.cpus.get(0).heir(), Some(t));
        assert_ne!(k.cpus.get(0).executing(), Some(t));
        k.dispatch_enable(0);
        assert_eq!(k.cpus.get(0).executing(), Some(t));
    }

    static TIMER_FIRES: AtomicUsize = AtomicUsize::new(0);

    fn count_fire(arg: usize) {
        TIMER_FIRES.fetch_add(arg, Ordering::SeqCst);
    }

    #[test]
    fn free_standing_timer_fires_and_cancels() {
        let mut k = kernel();
        let armed = k.timer_fire_after(3, count_fire, 1).unwrap();
        let cancelled = k.timer_fire_after(5, count_fire, 100).unwrap();
        assert_eq!(k.timer_cancel(cancelled), 5);

        let before = TIMER_FIRES.load(Ordering::SeqCst);
        for _ in 0..3 {
            k.clock_tick();
        }
        assert_eq!(TIMER_FIRES.load(Ordering::SeqCst), before + 1);
        let _ = armed;
    }

    #[test]
    fn zero_interval_timer_is_rejected() {
        let mut k = kernel();
        assert_eq!(
            k.timer_fire_after(0, count_fire, 0).err(),
            Some(ThreadError::InvalidInterval)
        );
    }

    #[test]
    fn fired_timers_release_their_slots() {
        let mut k = kernel();
        let slots = k.config().watchdog_slots();
        // More one-shot timers than the arena holds; fired slots recycle.
        for _ in 0..2 * slots {
            k.timer_fire_after(1, count_fire, 0).unwrap();
            k.clock_tick();
        }
        // A handle that already fired is dead; cancelling it is a no-op.
        let last = k.timer_fire_after(1, count_fire, 0).unwrap();
        k.clock_tick();
        assert_eq!(k.timer_cancel(last), 0);
    }

    #[test]
    fn clock_jumps_shift_pending_timeouts() {
        let mut k = kernel();
        let sem = k.create_semaphore("s", SemAttributes::default()).unwrap();
        let t = spawn(&mut k, "t", 5);
        k.semaphore_seize(sem, t, true, Some(10)).unwrap();

        k.clock_adjust_backward(5);
        for _ in 0..10 {
            k.clock_tick();
        }
        assert_eq!(k.threads.get(t).unwrap().wait_status(), WaitStatus::Pending);
        k.clock_adjust_forward(5);
        assert_eq!(k.threads.get(t).unwrap().wait_status(), WaitStatus::Timeout);
    }
}
