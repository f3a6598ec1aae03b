//! # Engine Observer
//!
//! Statistics and debug output are kept out of the scheduler's hot path: the
//! scheduler reports events to an injected [`EngineObserver`], and
//! [`DebugObserver`] turns them into counters and log lines.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bitflags::bitflags;

use crate::error::Error;
use crate::merged::MergedOp;
use crate::message::Completion;
use crate::types::{IrqOutcome, OpId};

/// Receives scheduler events; every method defaults to doing nothing
pub trait EngineObserver: Send + Sync {
    /// A message was compiled
    fn on_compile(&self, _op: &MergedOp) {}

    /// An operation's pre-transforms ran
    fn on_prepare(&self, _id: OpId, _op: &MergedOp) {}

    /// An operation was queued; `was_running` tells whether the engine was
    /// already busy
    fn on_submit(&self, _id: OpId, _was_running: bool, _optimized: bool) {}

    /// An operation was released
    fn on_release(&self, _id: OpId, _completion: &Completion) {}

    /// A completion interrupt was handled
    fn on_interrupt(&self, _outcome: IrqOutcome) {}

    /// An error the caller may never see (interrupt context)
    fn on_fault(&self, _error: Error) {}
}

bitflags! {
    /// What [`DebugObserver`] logs
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DebugFlags: u32 {
        /// Dump operations as they are submitted
        const ASYNC    = 1 << 0;
        /// Dump operations as they are compiled for reuse
        const OPTIMIZE = 1 << 1;
        /// Log every completion interrupt
        const IRQ      = 1 << 2;
    }
}

// =============================================================================
// STATISTICS
// =============================================================================

/// Lock-free engine counters
#[derive(Debug, Default)]
pub struct EngineStats {
    messages: AtomicU64,
    optimized_messages: AtomicU64,
    dma_started: AtomicU64,
    dma_still_running: AtomicU64,
    last_was_running: AtomicBool,
    released: AtomicU64,
    spurious: AtomicU64,
    faults: AtomicU64,
    timeouts: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Messages submitted
    pub messages: u64,
    /// Of those, messages that were compiled once and reused
    pub optimized_messages: u64,
    /// Submissions that had to start the engine
    pub dma_started: u64,
    /// Submissions spliced onto a running engine
    pub dma_still_running: u64,
    /// Whether the last submission found the engine running
    pub last_was_running: bool,
    /// Operations released
    pub released: u64,
    /// Interrupts with nothing queued
    pub spurious: u64,
    /// Faults reported from interrupt context
    pub faults: u64,
    /// Operations failed by the timeout fallback
    pub timeouts: u64,
}

impl EngineStats {
    /// Create zeroed counters
    pub const fn new() -> Self {
        Self {
            messages: AtomicU64::new(0),
            optimized_messages: AtomicU64::new(0),
            dma_started: AtomicU64::new(0),
            dma_still_running: AtomicU64::new(0),
            last_was_running: AtomicBool::new(false),
            released: AtomicU64::new(0),
            spurious: AtomicU64::new(0),
            faults: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    /// Copy the counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages: self.messages.load(Ordering::Relaxed),
            optimized_messages: self.optimized_messages.load(Ordering::Relaxed),
            dma_started: self.dma_started.load(Ordering::Relaxed),
            dma_still_running: self.dma_still_running.load(Ordering::Relaxed),
            last_was_running: self.last_was_running.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            spurious: self.spurious.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }

    /// Zero the counters
    pub fn reset(&self) {
        for counter in [
            &self.messages,
            &self.optimized_messages,
            &self.dma_started,
            &self.dma_still_running,
            &self.released,
            &self.spurious,
            &self.faults,
            &self.timeouts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.last_was_running.store(false, Ordering::Relaxed);
    }
}

// =============================================================================
// DEBUG OBSERVER
// =============================================================================

/// Counts events and logs them according to [`DebugFlags`]
#[derive(Debug, Default)]
pub struct DebugObserver {
    flags: DebugFlags,
    stats: EngineStats,
}

impl DebugObserver {
    /// Create an observer with the given log switches
    pub const fn new(flags: DebugFlags) -> Self {
        Self {
            flags,
            stats: EngineStats::new(),
        }
    }

    /// Counters
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Log switches
    pub fn flags(&self) -> DebugFlags {
        self.flags
    }
}

impl EngineObserver for DebugObserver {
    fn on_compile(&self, op: &MergedOp) {
        if op.is_optimized() && self.flags.contains(DebugFlags::OPTIMIZE) {
            log::debug!("optimized message compiled");
            op.dump();
        }
    }

    fn on_prepare(&self, id: OpId, op: &MergedOp) {
        if self.flags.contains(DebugFlags::ASYNC) {
            log::debug!("{} prepared", id);
            op.dump();
        }
    }

    fn on_submit(&self, id: OpId, was_running: bool, optimized: bool) {
        self.stats.messages.fetch_add(1, Ordering::Relaxed);
        if optimized {
            self.stats.optimized_messages.fetch_add(1, Ordering::Relaxed);
        }
        if was_running {
            self.stats.dma_still_running.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.dma_started.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.last_was_running.store(was_running, Ordering::Relaxed);
        if self.flags.contains(DebugFlags::ASYNC) {
            log::debug!("{} queued, engine was running: {}", id, was_running);
        }
    }

    fn on_release(&self, id: OpId, completion: &Completion) {
        self.stats.released.fetch_add(1, Ordering::Relaxed);
        if completion.status == Err(Error::HardwareTimeout) {
            self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
        }
        if self.flags.contains(DebugFlags::IRQ) {
            log::debug!("{} released: {:?}", id, completion.status);
        }
    }

    fn on_interrupt(&self, outcome: IrqOutcome) {
        if outcome == IrqOutcome::Spurious {
            self.stats.spurious.fetch_add(1, Ordering::Relaxed);
        }
        if self.flags.contains(DebugFlags::IRQ) {
            log::debug!("completion interrupt: {:?}", outcome);
        }
    }

    fn on_fault(&self, error: Error) {
        self.stats.faults.fetch_add(1, Ordering::Relaxed);
        log::error!("engine fault: {}", error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_counters() {
        let observer = DebugObserver::new(DebugFlags::empty());
        let id = OpId::new(0, 1);
        observer.on_submit(id, false, false);
        observer.on_submit(id, true, true);
        observer.on_interrupt(IrqOutcome::Spurious);
        observer.on_interrupt(IrqOutcome::Released(1));

        let snap = observer.stats().snapshot();
        assert_eq!(snap.messages, 2);
        assert_eq!(snap.optimized_messages, 1);
        assert_eq!(snap.dma_started, 1);
        assert_eq!(snap.dma_still_running, 1);
        assert!(snap.last_was_running);
        assert_eq!(snap.spurious, 1);

        observer.stats().reset();
        assert_eq!(observer.stats().snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_timeout_counted_on_release() {
        let observer = DebugObserver::new(DebugFlags::IRQ);
        let id = OpId::new(3, 1);
        observer.on_release(
            id,
            &Completion {
                id,
                status: Err(Error::HardwareTimeout),
                actual_length: 0,
            },
        );
        let snap = observer.stats().snapshot();
        assert_eq!(snap.released, 1);
        assert_eq!(snap.timeouts, 1);
    }
}
