//! Simple SMP scheduler.
//!
//! Keeps one priority-ordered chain of exactly `processor count` scheduled
//! nodes plus a priority-ordered ready chain. Every enqueue or extract
//! exchanges one node with the scheduled set, so insertion and removal cost
//! O(ready thread count). That linear walk is the price of the simple
//! two-chain design and the known scalability limit of this algorithm;
//! workloads that need better should select a different instance at
//! configuration time.

use log::trace;

use crate::chain::{self, Chain};
use crate::sched::{install_heir, SchedContext, Scheduler};
use crate::thread::{SchedState, Tcb, ThreadId};
use crate::{CpuId, Priority, MAX_CPUS};

pub struct SimpleSmpScheduler {
    /// Priority-ordered: one node per governed processor.
    scheduled: Chain,
    /// Priority-ordered ready threads without a processor.
    ready: Chain,
    /// Idle placeholder for each governed processor.
    idle: [Option<ThreadId>; MAX_CPUS],
}

fn priority_key(threads: &[Tcb], index: usize) -> u64 {
    threads[index].priority as u64
}

impl SimpleSmpScheduler {
    pub fn new() -> SimpleSmpScheduler {
        SimpleSmpScheduler {
            scheduled: Chain::new(),
            ready: Chain::new(),
            idle: [None; MAX_CPUS],
        }
    }

    /// Lowest-priority member of the scheduled set (the exchange victim).
    fn lowest_scheduled(&self) -> Option<ThreadId> {
        self.scheduled.last().map(ThreadId)
    }

    fn insert_ready(&mut self, ctx: &mut SchedContext<'_>, tid: ThreadId) {
        chain::insert_ordered(&mut self.ready, ctx.threads.links(), tid.0, priority_key);
        if let Ok(tcb) = ctx.threads.get_mut(tid) {
            tcb.sched.state = SchedState::Ready;
            tcb.sched.cpu = None;
        }
    }

    fn insert_scheduled(&mut self, ctx: &mut SchedContext<'_>, tid: ThreadId, cpu: CpuId) {
        chain::insert_ordered(&mut self.scheduled, ctx.threads.links(), tid.0, priority_key);
        install_heir(ctx, cpu, tid, true);
    }

    /// Displaces the lowest-priority scheduled node in favour of `tid`.
    fn exchange(&mut self, ctx: &mut SchedContext<'_>, tid: ThreadId, victim: ThreadId) {
        let cpu = match ctx.threads.get(victim).ok().and_then(|t| t.sched.cpu) {
            Some(cpu) => cpu,
            None => {
                debug_assert!(false, "scheduled node without a processor");
                return;
            }
        };
        self.scheduled.extract(ctx.threads.links(), victim.0);
        let victim_is_idle = ctx.threads.get(victim).map_or(false, |t| t.is_idle);
        if victim_is_idle {
            // Idle placeholders wait on the side, never on the ready chain.
            if let Ok(tcb) = ctx.threads.get_mut(victim) {
                tcb.sched.state = SchedState::Ready;
                tcb.sched.cpu = None;
            }
        } else {
            self.insert_ready(ctx, victim);
            // The displaced thread may ask another processor for help.
            if let Ok(tcb) = ctx.threads.get_mut(victim) {
                tcb.sched.needs_help = true;
            }
        }
        trace!("{} displaces {} on processor {}", tid, victim, cpu);
        self.insert_scheduled(ctx, tid, cpu);
    }

    /// Puts a newly eligible thread either onto a processor (displacing the
    /// lowest-priority scheduled node) or onto the ready chain.
    fn enqueue(&mut self, ctx: &mut SchedContext<'_>, tid: ThreadId) {
        let priority = match ctx.threads.get(tid) {
            Ok(tcb) => tcb.priority,
            Err(_) => {
                debug_assert!(false, "enqueue of unknown thread");
                return;
            }
        };
        let victim = self.lowest_scheduled().filter(|&v| {
            ctx.threads
                .get(v)
                .map_or(false, |t| t.priority > priority && t.preemptible)
        });
        match victim {
            Some(victim) => self.exchange(ctx, tid, victim),
            None => self.insert_ready(ctx, tid),
        }
    }

    /// Fills the processor freed by a departing scheduled thread.
    fn refill(&mut self, ctx: &mut SchedContext<'_>, cpu: CpuId) {
        let next = self.ready.pop_first(ctx.threads.links()).map(|(i, _)| i);
        let next = match next {
            Some(index) => ThreadId(index),
            None => match self.idle[cpu] {
                Some(idle) => idle,
                None => {
                    debug_assert!(false, "processor without idle placeholder");
                    return;
                }
            },
        };
        self.insert_scheduled(ctx, next, cpu);
    }
}

impl Default for SimpleSmpScheduler {
    fn default() -> Self {
        SimpleSmpScheduler::new()
    }
}

impl Scheduler for SimpleSmpScheduler {
    const MANAGES_SMP: bool = true;

    fn start_idle(&mut self, ctx: &mut SchedContext<'_>, idle: ThreadId, cpu: CpuId) {
        self.idle[cpu] = Some(idle);
        self.insert_scheduled(ctx, idle, cpu);
    }

    fn block(&mut self, ctx: &mut SchedContext<'_>, tid: ThreadId) {
        let (state, cpu) = match ctx.threads.get(tid) {
            Ok(tcb) => (tcb.sched.state, tcb.sched.cpu),
            Err(_) => {
                debug_assert!(false, "blocking unknown thread");
                return;
            }
        };
        match state {
            SchedState::Scheduled => {
                self.scheduled.extract(ctx.threads.links(), tid.0);
                if let Ok(tcb) = ctx.threads.get_mut(tid) {
                    tcb.sched.state = SchedState::Blocked;
                    tcb.sched.cpu = None;
                }
                if let Some(cpu) = cpu {
                    self.refill(ctx, cpu);
                }
            }
            SchedState::Ready => {
                self.ready.extract(ctx.threads.links(), tid.0);
                if let Ok(tcb) = ctx.threads.get_mut(tid) {
                    tcb.sched.state = SchedState::Blocked;
                    tcb.sched.needs_help = false;
                }
            }
            _ => debug_assert!(false, "blocking a thread that is not ready"),
        }
    }

    fn unblock(&mut self, ctx: &mut SchedContext<'_>, tid: ThreadId) {
        self.enqueue(ctx, tid);
    }

    fn yield_now(&mut self, ctx: &mut SchedContext<'_>, tid: ThreadId) {
        let (state, cpu) = match ctx.threads.get(tid) {
            Ok(tcb) => (tcb.sched.state, tcb.sched.cpu),
            Err(_) => return,
        };
        match state {
            SchedState::Scheduled => {
                self.scheduled.extract(ctx.threads.links(), tid.0);
                self.insert_ready(ctx, tid);
                if let Some(cpu) = cpu {
                    self.refill(ctx, cpu);
                }
            }
            SchedState::Ready => {
                // Rotate behind equal-priority arrivals.
                self.ready.extract(ctx.threads.links(), tid.0);
                self.insert_ready(ctx, tid);
            }
            _ => {}
        }
    }

    fn update_priority(&mut self, ctx: &mut SchedContext<'_>, tid: ThreadId, new: Priority) {
        let (state, cpu) = match ctx.threads.get(tid) {
            Ok(tcb) => (tcb.sched.state, tcb.sched.cpu),
            Err(_) => return,
        };
        match state {
            SchedState::Scheduled => {
                self.scheduled.extract(ctx.threads.links(), tid.0);
                set_priority(ctx, tid, new);
                if let Some(cpu) = cpu {
                    self.refill(ctx, cpu);
                }
                self.enqueue(ctx, tid);
            }
            SchedState::Ready => {
                self.ready.extract(ctx.threads.links(), tid.0);
                set_priority(ctx, tid, new);
                self.enqueue(ctx, tid);
            }
            _ => set_priority(ctx, tid, new),
        }
    }

    fn ask_for_help(&mut self, ctx: &mut SchedContext<'_>, tid: ThreadId) -> bool {
        let helpable = match ctx.threads.get(tid) {
            Ok(tcb) => tcb.sched.state == SchedState::Ready && tcb.sched.needs_help,
            Err(_) => false,
        };
        if !helpable {
            if let Ok(tcb) = ctx.threads.get_mut(tid) {
                tcb.sched.needs_help = false;
            }
            return false;
        }
        let priority = match ctx.threads.get(tid) {
            Ok(tcb) => tcb.priority,
            Err(_) => return false,
        };
        let victim = self.lowest_scheduled().filter(|&v| {
            ctx.threads
                .get(v)
                .map_or(false, |t| t.priority > priority && t.preemptible)
        });
        match victim {
            Some(victim) => {
                self.ready.extract(ctx.threads.links(), tid.0);
                self.exchange(ctx, tid, victim);
                true
            }
            None => false,
        }
    }

    fn reconsider_help_request(&mut self, ctx: &mut SchedContext<'_>, tid: ThreadId) {
        let still_useful = match ctx.threads.get(tid) {
            Ok(tcb) if tcb.sched.state == SchedState::Ready && tcb.sched.needs_help => {
                let priority = tcb.priority;
                self.lowest_scheduled().map_or(false, |v| {
                    ctx.threads.get(v).map_or(false, |t| t.priority > priority)
                })
            }
            _ => false,
        };
        if !still_useful {
            if let Ok(tcb) = ctx.threads.get_mut(tid) {
                tcb.sched.needs_help = false;
            }
        }
    }

    fn add_processor(&mut self, ctx: &mut SchedContext<'_>, idle: ThreadId, cpu: CpuId) {
        self.start_idle(ctx, idle, cpu);
    }

    fn remove_processor(&mut self, ctx: &mut SchedContext<'_>, cpu: CpuId) {
        // Find the node scheduled on the departing processor.
        let mut victim = None;
        let mut cursor = self.scheduled.first();
        while let Some(index) = cursor {
            if ctx.threads.slots()[index].sched.cpu == Some(cpu) {
                victim = Some(ThreadId(index));
                break;
            }
            cursor = self.scheduled.next(ctx.threads.links(), index);
        }
        let Some(victim) = victim else {
            debug_assert!(false, "no thread scheduled on removed processor");
            return;
        };
        self.scheduled.extract(ctx.threads.links(), victim.0);
        let was_idle = ctx.threads.get(victim).map_or(true, |t| t.is_idle);
        if let Ok(tcb) = ctx.threads.get_mut(victim) {
            tcb.sched.state = SchedState::Ready;
            tcb.sched.cpu = None;
        }
        self.idle[cpu] = None;
        ctx.cpus.get_mut(cpu).heir = None;
        if !was_idle {
            // The displaced thread competes for the remaining processors.
            self.enqueue(ctx, victim);
        }
    }
}

fn set_priority(ctx: &mut SchedContext<'_>, tid: ThreadId, new: Priority) {
    if let Ok(tcb) = ctx.threads.get_mut(tid) {
        tcb.priority = new;
        tcb.sched.bitmap = crate::bitmap::BitmapInfo::new(new);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::CpuSet;
    use crate::platform::Platform;
    use crate::thread::{ThreadAttributes, ThreadSet};
    use crate::watchdog::WatchdogId;

    struct Fixture {
        threads: ThreadSet,
        cpus: CpuSet,
        platform: Platform,
        sched: SimpleSmpScheduler,
        idles: Vec<ThreadId>,
    }

    impl Fixture {
        fn new(cpu_count: usize) -> Fixture {
            let mut threads = ThreadSet::with_capacity(16);
            let mut idles = Vec::new();
            for _ in 0..cpu_count {
                let idle = threads
                    .allocate("idle", 255, ThreadAttributes::default(), WatchdogId(0))
                    .unwrap();
                threads.get_mut(idle).unwrap().is_idle = true;
                idles.push(idle);
            }
            let mut fixture = Fixture {
                threads,
                cpus: CpuSet::new(cpu_count),
                platform: Platform::default(),
                sched: SimpleSmpScheduler::new(),
                idles: idles.clone(),
            };
            for (cpu, idle) in idles.iter().enumerate() {
                fixture.with_ctx(|sched, ctx| sched.start_idle(ctx, *idle, cpu));
            }
            fixture
        }

        fn with_ctx<R>(
            &mut self,
            f: impl FnOnce(&mut SimpleSmpScheduler, &mut SchedContext<'_>) -> R,
        ) -> R {
            let mut ctx = SchedContext {
                threads: &mut self.threads,
                cpus: &mut self.cpus,
                platform: &self.platform,
                current_cpu: 0,
            };
            f(&mut self.sched, &mut ctx)
        }

        fn spawn(&mut self, name: &str, priority: Priority) -> ThreadId {
            let tid = self
                .threads
                .allocate(name, priority, ThreadAttributes::default(), WatchdogId(0))
                .unwrap();
            self.with_ctx(|sched, ctx| sched.unblock(ctx, tid));
            tid
        }

        fn heir(&self, cpu: CpuId) -> ThreadId {
            self.cpus.get(cpu).heir.unwrap()
        }
    }

    #[test]
    fn threads_spread_across_processors() {
        let _r = env_logger::try_init();
        let mut f = Fixture::new(2);

        let a = f.spawn("a", 10);
        let b = f.spawn("b", 20);
        // Both idles displaced; each thread owns a processor.
        let heirs = [f.heir(0), f.heir(1)];
        assert!(heirs.contains(&a));
        assert!(heirs.contains(&b));
    }

    #[test]
    fn lowest_priority_scheduled_is_displaced() {
        let mut f = Fixture::new(2);
        let a = f.spawn("a", 10);
        let b = f.spawn("b", 20);
        let c = f.spawn("c", 15);

        let heirs = [f.heir(0), f.heir(1)];
        assert!(heirs.contains(&a));
        assert!(heirs.contains(&c));
        assert_eq!(f.threads.get(b).unwrap().state(), SchedState::Ready);
        // The displaced thread transitioned through the help-request state.
        assert!(f.threads.get(b).unwrap().sched.needs_help);
    }

    #[test]
    fn blocked_processor_pulls_from_ready() {
        let mut f = Fixture::new(2);
        let a = f.spawn("a", 10);
        let b = f.spawn("b", 20);
        let c = f.spawn("c", 30); // stays ready

        let a_cpu = f.threads.get(a).unwrap().sched.cpu.unwrap();
        f.with_ctx(|sched, ctx| sched.block(ctx, a));
        assert_eq!(f.heir(a_cpu), c);
        let _ = b;
    }

    #[test]
    fn blocking_last_thread_restores_idle() {
        let mut f = Fixture::new(2);
        let a = f.spawn("a", 10);
        let cpu = f.threads.get(a).unwrap().sched.cpu.unwrap();
        f.with_ctx(|sched, ctx| sched.block(ctx, a));
        assert_eq!(f.heir(cpu), f.idles[cpu]);
    }

    #[test]
    fn ask_for_help_places_displaced_thread() {
        let mut f = Fixture::new(2);
        let a = f.spawn("a", 10);
        let b = f.spawn("b", 20);
        let c = f.spawn("c", 15); // displaces b

        assert!(f.threads.get(b).unwrap().sched.needs_help);
        // No help available: all processors run higher-priority threads.
        assert!(!f.with_ctx(|sched, ctx| sched.ask_for_help(ctx, b)));

        // Once c leaves, b's request would have become satisfiable, but a
        // blocked processor pulls from ready on its own.
        f.with_ctx(|sched, ctx| sched.block(ctx, c));
        assert_eq!(f.threads.get(b).unwrap().state(), SchedState::Scheduled);
        let _ = a;
    }

    #[test]
    fn help_displaces_a_lower_priority_processor() {
        let mut f = Fixture::new(1);
        let low = f.spawn("low", 30);
        assert_eq!(f.heir(0), low);

        // A ready thread with a pending help request takes the processor
        // from a lower-priority scheduled thread.
        let urgent = f
            .threads
            .allocate("urgent", 10, ThreadAttributes::default(), WatchdogId(0))
            .unwrap();
        f.with_ctx(|sched, ctx| sched.insert_ready(ctx, urgent));
        f.threads.get_mut(urgent).unwrap().sched.needs_help = true;

        assert!(f.with_ctx(|sched, ctx| sched.ask_for_help(ctx, urgent)));
        assert_eq!(f.heir(0), urgent);
        assert_eq!(f.threads.get(low).unwrap().state(), SchedState::Ready);
    }

    #[test]
    fn reconsider_clears_stale_request() {
        let mut f = Fixture::new(1);
        let _a = f.spawn("a", 10);
        let b = f.spawn("b", 20);
        f.with_ctx(|sched, ctx| sched.reconsider_help_request(ctx, b));
        assert!(!f.threads.get(b).unwrap().sched.needs_help);
    }

    #[test]
    fn remove_processor_requeues_victim() {
        let mut f = Fixture::new(2);
        let a = f.spawn("a", 10);
        let b = f.spawn("b", 20);
        let b_cpu = f.threads.get(b).unwrap().sched.cpu.unwrap();

        f.with_ctx(|sched, ctx| sched.remove_processor(ctx, b_cpu));
        // Only one processor left; the higher-priority thread keeps it.
        assert_eq!(f.threads.get(a).unwrap().state(), SchedState::Scheduled);
        assert_eq!(f.threads.get(b).unwrap().state(), SchedState::Ready);
    }
}
