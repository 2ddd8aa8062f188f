//! Per-processor dispatch state.
//!
//! Each processor owns its executing/heir pointers and a nested
//! dispatch-disable counter; only that processor ever touches them. Remote
//! influence is expressed exclusively as a message bit plus a doorbell
//! interrupt (see [`request`]), never as direct mutation of another
//! processor's dispatch state. The actual heir handover is driven from
//! [`crate::kernel::Kernel::dispatch_enable`].

use core::sync::atomic::{AtomicBool, AtomicU32};

use arr_macro::arr;
use crossbeam_utils::CachePadded;

use crate::platform::Platform;
use crate::smp::{MulticastJob, MSG_DISPATCH};
use crate::thread::ThreadId;
use crate::{ds, CpuId, MAX_CPUS};

/// Thread-switch extension hook, run inside the dispatch window with the
/// outgoing thread (if any) and the incoming heir.
pub type SwitchHook = fn(Option<ThreadId>, ThreadId);

pub const MAX_SWITCH_HOOKS: usize = 4;

/// Control block of one processor.
pub struct Cpu {
    /// The thread currently holding this processor.
    pub(crate) executing: Option<ThreadId>,
    /// The thread selected to run next on this processor.
    pub(crate) heir: Option<ThreadId>,
    /// Nested dispatch-disable counter; a switch happens only when it
    /// returns to zero.
    pub(crate) dispatch_disable_level: u32,
    /// A heir change is waiting for the next safe dispatch point.
    pub(crate) dispatch_necessary: bool,
    /// Interrupt nesting depth; dispatch is deferred past the outermost
    /// interrupt exit.
    pub(crate) isr_nest_level: u32,
    /// Set by the SMP startup protocol once the processor joined
    /// multitasking; atomic because the boot processor polls it.
    pub(crate) online: AtomicBool,
    /// Inbound OR-combined message bits, exchanged to zero by the receiver.
    pub(crate) message: AtomicU32,
    /// Multicast jobs queued for this processor.
    pub(crate) inbox: spin::Mutex<ds::Vec<ds::Arc<MulticastJob>>>,
}

impl Cpu {
    fn new() -> Cpu {
        Cpu {
            executing: None,
            heir: None,
            dispatch_disable_level: 0,
            dispatch_necessary: false,
            isr_nest_level: 0,
            online: AtomicBool::new(false),
            message: AtomicU32::new(0),
            inbox: spin::Mutex::new(ds::Vec::new()),
        }
    }

    pub fn executing(&self) -> Option<ThreadId> {
        self.executing
    }

    pub fn heir(&self) -> Option<ThreadId> {
        self.heir
    }

    pub fn dispatch_disable_level(&self) -> u32 {
        self.dispatch_disable_level
    }

    pub fn is_online(&self) -> bool {
        self.online.load(core::sync::atomic::Ordering::Acquire)
    }
}

/// All processor control blocks, cache-line padded against false sharing.
pub struct CpuSet {
    cpus: [CachePadded<Cpu>; MAX_CPUS],
    /// Configured processor count; indices at and past it stay offline.
    count: usize,
}

const_assert_eq!(MAX_CPUS, 64); // arr! below needs the literal

impl CpuSet {
    pub(crate) fn new(count: usize) -> CpuSet {
        debug_assert!(count >= 1 && count <= MAX_CPUS);
        CpuSet {
            cpus: arr![CachePadded::new(Cpu::new()); 64],
            count,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub(crate) fn set_count(&mut self, count: usize) {
        debug_assert!(count >= 1 && count <= MAX_CPUS);
        self.count = count;
    }

    pub fn get(&self, cpu: CpuId) -> &Cpu {
        &self.cpus[cpu]
    }

    pub(crate) fn get_mut(&mut self, cpu: CpuId) -> &mut Cpu {
        &mut self.cpus[cpu]
    }

    /// Raises the dispatch-disable level of `cpu`, returning the new level.
    pub(crate) fn dispatch_disable(&mut self, cpu: CpuId) -> u32 {
        let cpu = self.get_mut(cpu);
        cpu.dispatch_disable_level += 1;
        cpu.dispatch_disable_level
    }
}

/// Requests a dispatch on `target`.
///
/// On the local processor this only marks "dispatch necessary"; the switch
/// happens at the next enable that returns the disable level to zero. For a
/// remote processor the request ORs a message bit and rings the doorbell --
/// the remote processor performs its own switch when it services the
/// interrupt.
pub(crate) fn request(cpus: &mut CpuSet, platform: &Platform, current: CpuId, target: CpuId) {
    if current == target {
        cpus.get_mut(target).dispatch_necessary = true;
    } else {
        cpus.get(target)
            .message
            .fetch_or(MSG_DISPATCH, core::sync::atomic::Ordering::AcqRel);
        (platform.send_ipi)(target);
    }
}
