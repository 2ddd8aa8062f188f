//! Interrupt dispatch entry point.
//!
//! The architecture layer funnels every interrupt into [`dispatch`] with its
//! vector number. Handlers run with the per-processor ISR nest level raised;
//! a thread dispatch made necessary while handlers ran is performed exactly
//! once, at the outermost interrupt exit, and only when thread dispatching
//! is not disabled.

use log::warn;

use crate::error::IrqError;
use crate::kernel::Kernel;
use crate::sched::Scheduler;
use crate::{ds, CpuId};

/// An interrupt service routine with one argument word.
pub type IrqHandler = fn(usize);

/// Vector-indexed handler table.
pub struct VectorTable {
    entries: ds::Vec<Option<(IrqHandler, usize)>>,
}

impl VectorTable {
    pub fn with_capacity(vectors: usize) -> VectorTable {
        let mut entries = ds::Vec::with_capacity(vectors);
        for _ in 0..vectors {
            entries.push(None);
        }
        VectorTable { entries }
    }

    /// Installs `handler` for `vector`. One handler per vector.
    pub fn register(
        &mut self,
        vector: usize,
        handler: IrqHandler,
        arg: usize,
    ) -> Result<(), IrqError> {
        let slot = self
            .entries
            .get_mut(vector)
            .ok_or(IrqError::InvalidVector)?;
        if slot.is_some() {
            return Err(IrqError::VectorInUse);
        }
        *slot = Some((handler, arg));
        Ok(())
    }

    pub fn deregister(&mut self, vector: usize) -> Result<(), IrqError> {
        let slot = self
            .entries
            .get_mut(vector)
            .ok_or(IrqError::InvalidVector)?;
        *slot = None;
        Ok(())
    }

    pub(crate) fn handler(&self, vector: usize) -> Option<(IrqHandler, usize)> {
        self.entries.get(vector).copied().flatten()
    }
}

/// Services one interrupt on `cpu`.
///
/// Raises the nest level, runs the registered handler (the clock vector and
/// the doorbell vector route into the kernel instead), acknowledges the
/// vector and, back at nest level zero, performs any deferred thread
/// dispatch.
pub fn dispatch<S: Scheduler>(kernel: &mut Kernel<S>, cpu: CpuId, vector: usize) {
    kernel.cpus.get_mut(cpu).isr_nest_level += 1;
    (kernel.platform.enable_lower_vectors)(vector);

    if Some(vector) == kernel.clock_vector {
        kernel.clock_tick();
    } else if Some(vector) == kernel.doorbell_vector {
        kernel.service_doorbell(cpu);
    } else {
        match kernel.vectors.handler(vector) {
            Some((handler, arg)) => handler(arg),
            None => warn!("spurious interrupt on vector {}", vector),
        }
    }

    (kernel.platform.ack_interrupt)(vector);

    let cpu_state = kernel.cpus.get_mut(cpu);
    cpu_state.isr_nest_level -= 1;
    let dispatch_now = cpu_state.isr_nest_level == 0
        && cpu_state.dispatch_necessary
        && cpu_state.dispatch_disable_level == 0;
    if dispatch_now {
        kernel.do_dispatch(cpu);
    }
}
