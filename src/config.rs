//! Static configuration.
//!
//! One table fixes every capacity at [`crate::kernel::Kernel::new`]; nothing
//! is resized afterwards. The table is validated once and an inconsistent
//! table is fatal, there is no partial bring-up.

use crate::ds;
use crate::MAX_CPUS;

/// Whether a configured processor must come online for the system to start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Assignment {
    /// Startup fails fatally without this processor.
    Mandatory,
    /// The processor is used if present and silently left out otherwise.
    Optional,
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Number of distinct priority levels, at most 256.
    pub priority_levels: usize,
    /// Clock tick rate, used to convert seconds into tick counts.
    pub ticks_per_second: u32,
    /// Thread control block arena capacity.
    pub max_threads: usize,
    /// Semaphore control block arena capacity.
    pub max_semaphores: usize,
    /// Watchdog slots beyond the one reserved per thread, for free-standing
    /// timer routines.
    pub extra_timers: usize,
    /// Per-processor scheduler assignment; the length is the configured
    /// processor count and entry 0 describes the boot processor.
    pub assignments: ds::Vec<Assignment>,
}

impl Default for Config {
    fn default() -> Self {
        let mut assignments = ds::Vec::new();
        assignments.push(Assignment::Mandatory);
        Config {
            priority_levels: 256,
            ticks_per_second: 100,
            max_threads: 32,
            max_semaphores: 16,
            extra_timers: 8,
            assignments,
        }
    }
}

impl Config {
    pub fn processor_count(&self) -> usize {
        self.assignments.len()
    }

    pub fn assignment(&self, cpu: usize) -> Assignment {
        self.assignments
            .get(cpu)
            .copied()
            .unwrap_or(Assignment::Optional)
    }

    /// Total watchdog slots: one per thread plus the free-standing timers.
    pub(crate) fn watchdog_slots(&self) -> usize {
        self.max_threads + self.extra_timers
    }

    /// Checks the table for consistency; `Err` carries a diagnostic code for
    /// the fatal report.
    pub(crate) fn validate(&self) -> Result<(), usize> {
        if self.priority_levels == 0 || self.priority_levels > 256 {
            return Err(1);
        }
        if self.assignments.is_empty() || self.assignments.len() > MAX_CPUS {
            return Err(2);
        }
        if self.assignment(0) != Assignment::Mandatory {
            return Err(3);
        }
        if self.max_threads == 0 {
            return Err(4);
        }
        if self.ticks_per_second == 0 {
            return Err(5);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_is_consistent() {
        assert_eq!(Config::default().validate(), Ok(()));
    }

    #[test]
    fn boot_processor_must_be_mandatory() {
        let config = Config {
            assignments: vec![Assignment::Optional],
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(3));
    }

    #[test]
    fn level_count_is_bounded() {
        let config = Config {
            priority_levels: 300,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(1));
        let config = Config {
            priority_levels: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(1));
    }
}
