//! A real-time scheduling and dispatch core with SMP support.
//!
//! The crate decides which thread runs on which processor: it keeps
//! priority-ordered ready queues with O(1) selection, drives bounded waits
//! through a delta-chain timer list, performs the executing/heir handover at
//! dispatch points and coordinates state changes across processors through
//! message-passing words and inter-processor interrupts.
//!
//! Control blocks live in index-addressed arenas owned by a single
//! [`kernel::Kernel`] value; intrusive chain links store arena indices
//! instead of raw pointers. Architecture services (doorbell IPIs, secondary
//! processor start, halting) enter through the [`platform::Platform`] hook
//! table, so the whole core runs unmodified on the host for testing.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate static_assertions;

pub mod bitmap;
pub mod chain;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod irq;
pub mod kernel;
pub mod platform;
pub mod sched;
pub mod sem;
pub mod smp;
pub mod thread;
pub mod threadq;
pub mod watchdog;


#[cfg(not(test))]
pub(crate) mod ds {
    pub use alloc::sync::Arc;
    pub use alloc::vec::Vec;
}

/// Type to represent a processor id.
pub type CpuId = usize;

/// Type to represent a thread priority.
///
/// Numerically lower values are higher priorities; ties within a level are
/// broken FIFO by arrival order.
pub type Priority = u8;

/// Upper bound on processors the core can coordinate.
///
/// The actual processor count is configured at [`kernel::Kernel::new`] and
/// capped by this.
pub const MAX_CPUS: usize = 64;

const_assert!(MAX_CPUS <= 64); // affinity/target masks are one u64 word
