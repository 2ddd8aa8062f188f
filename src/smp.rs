//! Inter-processor coordination.
//!
//! Processors influence each other only through a per-processor message word
//! (OR-combined bits, swapped to zero by the receiver) plus a doorbell
//! interrupt, and through multicast job queues for operations that must run
//! on the target processor itself. Startup brings secondary processors
//! online with bounded polling; a processor that never shows up is either
//! tolerated (optional) or terminal (mandatory).

use core::sync::atomic::{AtomicUsize, Ordering};

use bit_field::BitField;
use log::{debug, info, warn};

use crate::config::{Assignment, Config};
use crate::dispatch::CpuSet;
use crate::error::{fatal, FatalSource};
use crate::platform::Platform;
use crate::{ds, CpuId};

/// Halt this processor.
pub const MSG_SHUTDOWN: u32 = 1 << 0;
/// Diagnostic ping for exercising the doorbell path.
pub const MSG_TEST: u32 = 1 << 1;
/// Drain the multicast job inbox.
pub const MSG_PERFORM_JOBS: u32 = 1 << 2;
/// Re-evaluate the heir at the next dispatch point.
pub const MSG_DISPATCH: u32 = 1 << 3;

/// Iterations a spin wait on another processor may burn before the wait is
/// declared dead. Generous; these waits complete in microseconds on working
/// hardware.
pub(crate) const POLL_RETRY_BUDGET: usize = 100_000_000;

static TEST_ACKS: AtomicUsize = AtomicUsize::new(0);

/// Doorbell pings acknowledged since boot.
pub fn test_acks() -> usize {
    TEST_ACKS.load(Ordering::Relaxed)
}

/// A function to run on a set of target processors.
pub struct MulticastJob {
    handler: fn(usize),
    arg: usize,
    /// Processors that still have to run the job.
    expected: usize,
    done: AtomicUsize,
}

impl MulticastJob {
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire) == self.expected
    }
}

/// ORs `bits` into the message word of `target` and rings its doorbell.
pub(crate) fn send_message(cpus: &CpuSet, platform: &Platform, target: CpuId, bits: u32) {
    cpus.get(target).message.fetch_or(bits, Ordering::AcqRel);
    (platform.send_ipi)(target);
}

/// Sends `bits` to every online processor except the sender.
pub(crate) fn broadcast(cpus: &CpuSet, platform: &Platform, sender: CpuId, bits: u32) {
    for target in 0..cpus.count() {
        if target != sender && cpus.get(target).is_online() {
            send_message(cpus, platform, target, bits);
        }
    }
}

/// Services the message word of `cpu` inside its doorbell handler.
///
/// The word is atomically exchanged to zero, so bits posted after this point
/// raise a new interrupt rather than getting lost. Returns whether any bit
/// was pending.
pub(crate) fn process_message(cpus: &mut CpuSet, platform: &Platform, cpu: CpuId) -> bool {
    let bits = cpus.get(cpu).message.swap(0, Ordering::AcqRel);
    if bits & MSG_SHUTDOWN != 0 {
        info!("processor {} shutting down on request", cpu);
        cpus.get(cpu).online.store(false, Ordering::Release);
        (platform.halt)(cpu);
    }
    if bits & MSG_TEST != 0 {
        TEST_ACKS.fetch_add(1, Ordering::Relaxed);
    }
    if bits & MSG_PERFORM_JOBS != 0 {
        perform_jobs(cpus, cpu);
    }
    if bits & MSG_DISPATCH != 0 {
        cpus.get_mut(cpu).dispatch_necessary = true;
    }
    bits != 0
}

/// Drains the job inbox of `cpu`. The lock is released around each handler
/// so a handler may itself post jobs.
fn perform_jobs(cpus: &CpuSet, cpu: CpuId) {
    loop {
        let job = {
            let mut inbox = cpus.get(cpu).inbox.lock();
            if inbox.is_empty() {
                None
            } else {
                Some(inbox.remove(0))
            }
        };
        match job {
            Some(job) => {
                (job.handler)(job.arg);
                job.done.fetch_add(1, Ordering::AcqRel);
            }
            None => break,
        }
    }
}

/// Posts `handler` to every online processor in `targets` (a bit mask) and
/// rings their doorbells. The caller completes the operation with
/// [`multicast_finish`] once it must observe the effects.
///
/// When the sender is the only target the job runs inline and no interrupt
/// is raised.
pub(crate) fn multicast_begin(
    cpus: &CpuSet,
    platform: &Platform,
    sender: CpuId,
    targets: u64,
    handler: fn(usize),
    arg: usize,
) -> ds::Arc<MulticastJob> {
    let mut expected = 0;
    for cpu in 0..cpus.count() {
        if targets.get_bit(cpu) && cpus.get(cpu).is_online() {
            expected += 1;
        }
    }
    let job = ds::Arc::new(MulticastJob {
        handler,
        arg,
        expected,
        done: AtomicUsize::new(0),
    });
    if expected == 1 && targets.get_bit(sender) && cpus.get(sender).is_online() {
        (job.handler)(job.arg);
        job.done.fetch_add(1, Ordering::AcqRel);
        return job;
    }
    for cpu in 0..cpus.count() {
        if targets.get_bit(cpu) && cpus.get(cpu).is_online() {
            cpus.get(cpu).inbox.lock().push(ds::Arc::clone(&job));
            send_message(cpus, platform, cpu, MSG_PERFORM_JOBS);
        }
    }
    job
}

/// Spins until every target processor ran the job.
///
/// The wait is bounded; exceeding the retry budget means a target processor
/// stopped servicing doorbells, which is not survivable.
pub(crate) fn multicast_finish(platform: &Platform, job: &MulticastJob) {
    let mut retries = 0usize;
    while !job.is_done() {
        retries += 1;
        if retries > POLL_RETRY_BUDGET {
            fatal(FatalSource::PollExceeded, job.arg);
        }
        (platform.relax)();
    }
}

/// Requests a shutdown of every other online processor.
pub(crate) fn shutdown_others(cpus: &CpuSet, platform: &Platform, sender: CpuId) {
    broadcast(cpus, platform, sender, MSG_SHUTDOWN);
}

/// Brings the configured secondary processors online.
///
/// Runs once on the boot processor before multitasking starts. Returns the
/// number of processors that joined (the boot processor included). A
/// processor assigned [`Assignment::Mandatory`] that is absent from the
/// hardware, refuses its start request or never reports online terminates
/// the system; an optional one is logged and left out.
pub(crate) fn initialize(cpus: &mut CpuSet, platform: &Platform, config: &Config) -> usize {
    let available = (platform.available_processors)();
    let configured = config.processor_count();
    cpus.set_count(configured.min(available.max(1)));
    debug!(
        "smp init: {} configured, {} available",
        configured, available
    );

    cpus.get(0).online.store(true, Ordering::Release);
    let mut online = 1;

    for cpu in 1..configured {
        let mandatory = config.assignment(cpu) == Assignment::Mandatory;
        if cpu >= available {
            if mandatory {
                fatal(FatalSource::MandatoryProcessorFailed, cpu);
            }
            warn!("optional processor {} not present, skipping", cpu);
            continue;
        }
        if !(platform.start_processor)(cpu) {
            if mandatory {
                fatal(FatalSource::MandatoryProcessorFailed, cpu);
            }
            warn!("optional processor {} refused to start, skipping", cpu);
            continue;
        }
        if wait_for_online(cpus, platform, cpu) {
            online += 1;
        } else if mandatory {
            fatal(FatalSource::MandatoryProcessorFailed, cpu);
        } else {
            warn!("optional processor {} never came online, skipping", cpu);
        }
    }
    info!("smp init: {} of {} processors online", online, configured);
    online
}

fn wait_for_online(cpus: &CpuSet, platform: &Platform, cpu: CpuId) -> bool {
    let mut retries = 0usize;
    while !cpus.get(cpu).is_online() {
        retries += 1;
        if retries > POLL_RETRY_BUDGET {
            return false;
        }
        (platform.relax)();
    }
    true
}

/// Entry point of a secondary processor once its low-level bring-up is done.
///
/// Marks the processor online (releasing the boot processor's poll), then
/// drops into the platform idle loop; from here on the processor is driven
/// entirely by doorbell interrupts.
pub(crate) fn start_on_secondary(cpus: &CpuSet, platform: &Platform, cpu: CpuId) -> ! {
    (platform.setup_interrupts)(cpu);
    (platform.release_siblings)(cpu);
    cpus.get(cpu).online.store(true, Ordering::Release);
    (platform.idle)(cpu)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_word_is_exchanged_to_zero() {
        let _r = env_logger::try_init();
        let mut cpus = CpuSet::new(1);
        let platform = Platform::default();

        send_message(&cpus, &platform, 0, MSG_DISPATCH | MSG_TEST);
        let before = test_acks();
        assert!(process_message(&mut cpus, &platform, 0));
        assert_eq!(test_acks(), before + 1);
        assert!(cpus.get(0).message.load(Ordering::Acquire) == 0);
        assert!(cpus.get_mut(0).dispatch_necessary);

        // Nothing pending on the second service.
        cpus.get_mut(0).dispatch_necessary = false;
        assert!(!process_message(&mut cpus, &platform, 0));
        assert!(!cpus.get_mut(0).dispatch_necessary);
    }

    #[test]
    #[should_panic(expected = "processor 0 halted")]
    fn shutdown_message_halts_the_receiver() {
        let mut cpus = CpuSet::new(1);
        let platform = Platform::default();
        cpus.get(0).online.store(true, Ordering::Release);
        send_message(&cpus, &platform, 0, MSG_SHUTDOWN);
        let _ = process_message(&mut cpus, &platform, 0);
    }

    static JOB_RUNS: AtomicUsize = AtomicUsize::new(0);

    fn record_run(arg: usize) {
        JOB_RUNS.fetch_add(arg, Ordering::SeqCst);
    }

    #[test]
    fn multicast_runs_on_targets_and_completes() {
        let mut cpus = CpuSet::new(2);
        let platform = Platform::default();
        cpus.get(0).online.store(true, Ordering::Release);
        cpus.get(1).online.store(true, Ordering::Release);

        let job = multicast_begin(&cpus, &platform, 0, 0b10, record_run, 7);
        assert!(!job.is_done());

        let before = JOB_RUNS.load(Ordering::SeqCst);
        assert!(process_message(&mut cpus, &platform, 1));
        assert_eq!(JOB_RUNS.load(Ordering::SeqCst), before + 7);

        // Target already ran the job, so the finish does not spin.
        multicast_finish(&platform, &job);
    }

    #[test]
    fn offline_targets_are_not_counted() {
        let cpus = CpuSet::new(2);
        let platform = Platform::default();
        cpus.get(0).online.store(true, Ordering::Release);
        // Processor 1 offline: the job completes without it.
        let job = multicast_begin(&cpus, &platform, 0, 0b10, record_run, 0);
        assert!(job.is_done());
    }

    static INLINE_RUNS: AtomicUsize = AtomicUsize::new(0);

    fn record_inline(arg: usize) {
        INLINE_RUNS.fetch_add(arg, Ordering::SeqCst);
    }

    #[test]
    fn self_only_multicast_runs_inline() {
        let cpus = CpuSet::new(1);
        let platform = Platform::default();
        cpus.get(0).online.store(true, Ordering::Release);
        let job = multicast_begin(&cpus, &platform, 0, 0b1, record_inline, 3);
        assert!(job.is_done());
        assert_eq!(INLINE_RUNS.load(Ordering::SeqCst), 3);
        assert!(cpus.get(0).inbox.lock().is_empty());
    }

    #[test]
    fn single_processor_initialize() {
        let mut cpus = CpuSet::new(1);
        let platform = Platform::default();
        let config = Config::default();
        assert_eq!(initialize(&mut cpus, &platform, &config), 1);
        assert!(cpus.get(0).is_online());
    }

    #[test]
    #[should_panic(expected = "mandatory processor failed to start")]
    fn missing_mandatory_processor_is_fatal() {
        let mut cpus = CpuSet::new(2);
        let platform = Platform::default(); // one processor available
        let config = Config {
            assignments: vec![Assignment::Mandatory, Assignment::Mandatory],
            ..Default::default()
        };
        let _ = initialize(&mut cpus, &platform, &config);
    }
}
