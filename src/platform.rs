//! Architecture hook table.
//!
//! Everything the core needs from the machine enters through one struct of
//! plain function pointers with host-safe defaults, so the crate links both
//! into a freestanding kernel and into the host test suite. The hooks are
//! installed once at [`crate::kernel::Kernel::new`] and never change.

use core::fmt;
use core::hint::spin_loop;

use crate::CpuId;

/// Downward calls from the core to the architecture layer.
#[derive(Clone, Copy)]
pub struct Platform {
    /// Number of processors the hardware actually offers.
    pub available_processors: fn() -> usize,

    /// Issue the architecture start request for a secondary processor.
    ///
    /// For cores that poll memory rather than accept a direct start signal
    /// this writes the release address into the shared spin table; the hook
    /// owns the required cache flush and memory synchronization. Returns
    /// whether the request was issued.
    pub start_processor: fn(CpuId) -> bool,

    /// Ring the doorbell (inter-processor interrupt) of a processor.
    pub send_ipi: fn(CpuId),

    /// Per-processor exception/interrupt-controller setup, run by each
    /// secondary on entry.
    pub setup_interrupts: fn(CpuId),

    /// Release hardware SMT siblings sharing this core, if any.
    pub release_siblings: fn(CpuId),

    /// Re-enable lower-urgency interrupt nesting while a handler runs.
    pub enable_lower_vectors: fn(usize),

    /// Acknowledge a vector to the interrupt controller.
    pub ack_interrupt: fn(usize),

    /// Stop this processor for good. Never returns.
    pub halt: fn(CpuId) -> !,

    /// Enter the idle loop after joining multitasking. Never returns.
    pub idle: fn(CpuId) -> !,

    /// Back-off hint inside bounded spin waits.
    pub relax: fn(),
}

impl Default for Platform {
    fn default() -> Self {
        Platform {
            available_processors: one_processor,
            start_processor: no_start,
            send_ipi: noop_cpu,
            setup_interrupts: noop_cpu,
            release_siblings: noop_cpu,
            enable_lower_vectors: noop_vector,
            ack_interrupt: noop_vector,
            halt: halt_is_panic,
            idle: idle_is_panic,
            relax: relax_spin,
        }
    }
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Platform {{}}")
    }
}

fn one_processor() -> usize {
    1
}

fn no_start(_cpu: CpuId) -> bool {
    false
}

fn noop_cpu(_cpu: CpuId) {}

fn noop_vector(_vector: usize) {}

fn halt_is_panic(cpu: CpuId) -> ! {
    panic!("processor {} halted", cpu);
}

fn idle_is_panic(cpu: CpuId) -> ! {
    panic!("processor {} entered idle without a platform idle loop", cpu);
}

fn relax_spin() {
    spin_loop();
}
