//! # Submission Queue and Scheduler
//!
//! Compiled operations live in a generation-checked table and are addressed
//! by [`OpId`]. Submitting an operation appends it to a strict FIFO queue and
//! splices its chain onto the tail of the previously queued operation while
//! the DMA engine may still be running. If the engine is idle it is started
//! at the first queued operation whose data phase has not run.
//!
//! ## Missed splices
//!
//! The controller latches a whole control block, link word included, when it
//! loads it. A splice written after the previous tail was loaded is therefore
//! not followed. Submission detects that case while the channel sits on the
//! previous tail and patches the latched link with the channel paused; if the
//! channel already stopped, the operation is started directly.
//!
//! ## Deferred starts
//!
//! When the engine is still busy with blocks no queued operation owns, the
//! start is owed rather than lost. The next interrupt or [`Scheduler::poll`]
//! after the engine drains starts the queue.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::mem;

use dmachain_hal::{fence, BusAddr, DmaChannel, DmaCs, DmaReg, IrqMutex};

use crate::cache::FragmentCaches;
use crate::error::{Error, Fault, Result};
use crate::merged::MergedOp;
use crate::observer::EngineObserver;
use crate::types::OpId;

/// Polls of a finishing channel before a start is deferred
const IDLE_SPIN_LIMIT: usize = 1000;

// =============================================================================
// OPERATION TABLE
// =============================================================================

pub(crate) enum Slot {
    Vacant,
    /// Compiled, not queued (optimized or not yet submitted)
    Idle(Box<MergedOp>),
    /// Taken out by the scheduler or completion engine
    Busy,
    /// On the submission queue
    Queued(Box<MergedOp>),
}

impl Slot {
    fn state(&self) -> &'static str {
        match self {
            Self::Vacant => "vacant",
            Self::Idle(_) => "idle",
            Self::Busy => "busy",
            Self::Queued(_) => "queued",
        }
    }
}

struct Entry {
    generation: u32,
    slot: Slot,
}

#[derive(Default)]
pub(crate) struct OpTable {
    entries: Vec<Entry>,
    free: Vec<u32>,
}

impl OpTable {
    fn insert(&mut self, op: Box<MergedOp>) -> Result<OpId> {
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.slot = Slot::Idle(op);
            return Ok(OpId::new(index, entry.generation));
        }
        let index = u32::try_from(self.entries.len()).map_err(|_| Error::AllocationFailure)?;
        self.entries.push(Entry {
            generation: 1,
            slot: Slot::Idle(op),
        });
        Ok(OpId::new(index, 1))
    }

    fn entry(&self, id: OpId) -> Result<&Entry> {
        match self.entries.get(id.index() as usize) {
            Some(entry) if entry.generation == id.generation() && !matches!(entry.slot, Slot::Vacant) => {
                Ok(entry)
            }
            _ => Err(Error::ConsistencyFault(Fault::StaleOperation)),
        }
    }

    fn entry_mut(&mut self, id: OpId) -> Result<&mut Entry> {
        match self.entries.get_mut(id.index() as usize) {
            Some(entry) if entry.generation == id.generation() && !matches!(entry.slot, Slot::Vacant) => {
                Ok(entry)
            }
            _ => Err(Error::ConsistencyFault(Fault::StaleOperation)),
        }
    }

    /// The operation, if it is not currently taken out
    pub(crate) fn get(&self, id: OpId) -> Result<&MergedOp> {
        match &self.entry(id)?.slot {
            Slot::Idle(op) | Slot::Queued(op) => Ok(op),
            _ => Err(Error::InvalidState),
        }
    }

    /// A queued operation
    pub(crate) fn queued(&self, id: OpId) -> Result<&MergedOp> {
        match &self.entry(id)?.slot {
            Slot::Queued(op) => Ok(op),
            _ => Err(Error::InvalidState),
        }
    }

    pub(crate) fn take_idle(&mut self, id: OpId) -> Result<Box<MergedOp>> {
        self.take(id, |slot| matches!(slot, Slot::Idle(_)))
    }

    pub(crate) fn take_queued(&mut self, id: OpId) -> Result<Box<MergedOp>> {
        self.take(id, |slot| matches!(slot, Slot::Queued(_)))
    }

    fn take(&mut self, id: OpId, wanted: fn(&Slot) -> bool) -> Result<Box<MergedOp>> {
        let entry = self.entry_mut(id)?;
        if !wanted(&entry.slot) {
            return Err(Error::InvalidState);
        }
        match mem::replace(&mut entry.slot, Slot::Busy) {
            Slot::Idle(op) | Slot::Queued(op) => Ok(op),
            other => {
                entry.slot = other;
                Err(Error::InvalidState)
            }
        }
    }

    /// Put a taken operation back
    pub(crate) fn restore(&mut self, id: OpId, slot: Slot) -> Result<()> {
        let entry = self.entry_mut(id)?;
        if !matches!(entry.slot, Slot::Busy) {
            return Err(Error::InvalidState);
        }
        entry.slot = slot;
        Ok(())
    }

    /// Retire a taken operation; its id becomes stale
    pub(crate) fn retire(&mut self, id: OpId) -> Result<()> {
        let entry = self.entry_mut(id)?;
        if !matches!(entry.slot, Slot::Busy) {
            return Err(Error::InvalidState);
        }
        entry.slot = Slot::Vacant;
        entry.generation = entry.generation.wrapping_add(1).max(1);
        self.free.push(id.index());
        Ok(())
    }

    fn live(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| !matches!(entry.slot, Slot::Vacant))
            .count()
    }
}

/// Queue and table, guarded together
#[derive(Default)]
pub(crate) struct QueueState {
    pub(crate) queue: VecDeque<OpId>,
    pub(crate) table: OpTable,
    /// A start is owed once the engine drains
    pub(crate) deferred: bool,
}

// =============================================================================
// SCHEDULER
// =============================================================================

/// Owns compiled operations and feeds them to the DMA engine
pub struct Scheduler {
    pub(crate) caches: Arc<FragmentCaches>,
    pub(crate) data: Arc<dyn DmaChannel>,
    pub(crate) irq: Arc<dyn DmaChannel>,
    pub(crate) observer: Arc<dyn EngineObserver>,
    pub(crate) state: IrqMutex<QueueState>,
}

impl Scheduler {
    /// Create a scheduler driving `data`, with completion interrupts raised
    /// on `irq`
    pub fn new(
        caches: Arc<FragmentCaches>,
        data: Arc<dyn DmaChannel>,
        irq: Arc<dyn DmaChannel>,
        observer: Arc<dyn EngineObserver>,
    ) -> Self {
        Self {
            caches,
            data,
            irq,
            observer,
            state: IrqMutex::new(QueueState::default()),
        }
    }

    /// Fragment caches operations are built from
    pub fn caches(&self) -> &Arc<FragmentCaches> {
        &self.caches
    }

    /// Take ownership of a compiled operation
    pub fn register(&self, op: MergedOp) -> Result<OpId> {
        if !op.is_sealed() {
            return Err(Error::InvalidState);
        }
        self.observer.on_compile(&op);
        let boxed = Box::new(op);
        self.state.lock().table.insert(boxed)
    }

    /// Queue an idle operation for execution.
    ///
    /// Pre-transforms run before the chain becomes reachable by hardware.
    pub fn submit(&self, id: OpId) -> Result<()> {
        let mut op = self.state.lock().table.take_idle(id)?;

        let head = match op.prepare() {
            Ok(head) => head,
            Err(err) => {
                log::error!("{}: prepare failed: {}", id, err);
                self.put_back(&mut self.state.lock(), id, op);
                return Err(err);
            }
        };
        self.observer.on_prepare(id, &op);
        let optimized = op.is_optimized();

        let was_running = {
            let mut state = self.state.lock();

            let previous = match state.queue.back().copied() {
                Some(prev) => {
                    let spliced = state.table.queued(prev).and_then(|p| {
                        let tail = p.tail_link()?;
                        tail.link_to(head)?;
                        Ok(tail.bus())
                    });
                    match spliced {
                        Ok(tail) => Some(tail),
                        Err(err) => {
                            log::error!("{}: cannot splice after {}: {}", id, prev, err);
                            self.put_back(&mut state, id, op);
                            return Err(err);
                        }
                    }
                }
                None => None,
            };

            state.table.restore(id, Slot::Queued(op))?;
            state.queue.push_back(id);

            let was_running = self.data.is_active();
            let needs_kick = match previous {
                _ if !was_running => true,
                Some(tail) if !state.deferred => !self.repair_missed_splice(tail, head),
                // Running blocks no queued operation owns
                _ => {
                    let idle = self.wait_idle();
                    state.deferred = !idle;
                    idle
                }
            };
            if needs_kick {
                self.kick(&mut state);
            }
            was_running
        };

        self.observer.on_submit(id, was_running, optimized);
        Ok(())
    }

    fn put_back(&self, state: &mut QueueState, id: OpId, op: Box<MergedOp>) {
        if let Err(err) = state.table.restore(id, Slot::Idle(op)) {
            self.observer.on_fault(err);
        }
    }

    /// Patch the latched link of a channel sitting on `tail`. Returns false
    /// when the channel has already stopped and needs a fresh start.
    fn repair_missed_splice(&self, tail: BusAddr, head: BusAddr) -> bool {
        if self.data.read(DmaReg::ConblkAd) != tail.raw() {
            // Either upstream of the tail, or already finished
            return self.data.is_active();
        }

        // Pause, then check what the controller actually latched
        let config = self.data.status() - DmaCs::ACTIVE - DmaCs::END - DmaCs::INT;
        self.data.write(DmaReg::Cs, config.bits());
        fence::dma_write_barrier();
        let status = self.data.status();
        if !status.contains(DmaCs::PAUSED) {
            return false;
        }
        if self.data.read(DmaReg::ConblkAd) == tail.raw() && self.data.read(DmaReg::NextConbk) == 0 {
            log::trace!("splice onto {} missed by the engine, relinking", tail);
            self.data.write(DmaReg::NextConbk, head.raw());
            fence::dma_write_barrier();
        }
        self.data.write(DmaReg::Cs, (config | DmaCs::ACTIVE).bits());
        true
    }

    fn wait_idle(&self) -> bool {
        for _ in 0..IDLE_SPIN_LIMIT {
            if !self.data.is_active() {
                return true;
            }
            core::hint::spin_loop();
        }
        log::warn!("{}: still running, start deferred", self.data.name());
        false
    }

    /// Start the engine at the first queued operation whose data phase has
    /// not run. Caller holds the queue lock and has seen the engine idle.
    pub(crate) fn kick(&self, state: &mut QueueState) -> bool {
        let pending = state.queue.iter().find_map(|&id| match state.table.queued(id) {
            Ok(op) if !op.data_done() => Some((id, op.head_bus())),
            _ => None,
        });
        let Some((id, head)) = pending else {
            return false;
        };
        match head {
            Ok(head) => {
                log::trace!("starting {} at {}", id, head);
                self.data.start(head);
                state.deferred = false;
                true
            }
            Err(err) => {
                self.observer.on_fault(err);
                false
            }
        }
    }

    /// Start a deferred queue once the engine has drained. Returns whether
    /// the engine was started.
    ///
    /// Call from the host's timer or timeout path; the completion interrupt
    /// does the same for queues it sees.
    pub fn poll(&self) -> bool {
        let mut state = self.state.lock();
        if !state.deferred || self.data.is_active() {
            return false;
        }
        if state.queue.is_empty() {
            state.deferred = false;
            return false;
        }
        self.kick(&mut state)
    }

    /// Whether a start is owed to the queue
    pub fn is_deferred(&self) -> bool {
        self.state.lock().deferred
    }

    /// Drop an idle operation, returning its fragments to their caches
    pub fn release(&self, id: OpId) -> Result<()> {
        let op = {
            let mut state = self.state.lock();
            let op = state.table.take_idle(id)?;
            state.table.retire(id)?;
            op
        };
        (*op).abandon(&self.caches);
        Ok(())
    }

    /// Mark an idle operation as kept for resubmission (or not)
    pub fn set_optimized(&self, id: OpId, optimized: bool) -> Result<()> {
        let mut state = self.state.lock();
        let mut op = state.table.take_idle(id)?;
        op.set_optimized(optimized);
        state.table.restore(id, Slot::Idle(op))
    }

    /// Run `f` on an operation that is not currently taken out
    pub fn with_op<R>(&self, id: OpId, f: impl FnOnce(&MergedOp) -> R) -> Result<R> {
        let state = self.state.lock();
        state.table.get(id).map(f)
    }

    /// Control-block bus addresses of an operation, head to tail
    pub fn chain_of(&self, id: OpId) -> Result<Vec<BusAddr>> {
        self.with_op(id, |op| op.chain())?
    }

    /// Number of queued operations
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Operation ids in queue order
    pub fn queue_snapshot(&self) -> Vec<OpId> {
        self.state.lock().queue.iter().copied().collect()
    }

    /// Stop both channels and fail every queued operation
    pub fn shutdown(&self) {
        self.data.reset();
        self.irq.reset();
        self.state.lock().deferred = false;
        loop {
            let next = {
                let mut state = self.state.lock();
                let Some(id) = state.queue.pop_front() else {
                    break;
                };
                state.table.take_queued(id).map(|op| (id, op))
            };
            match next {
                Ok((id, op)) => self.complete(id, op, Err(Error::Shutdown)),
                Err(err) => self.observer.on_fault(err),
            }
        }
    }

    /// Log queue, operations and channel registers at debug level
    pub fn dump(&self) {
        {
            let state = self.state.lock();
            log::debug!(
                "scheduler: {} queued, {} operations{}",
                state.queue.len(),
                state.table.live(),
                if state.deferred { ", start deferred" } else { "" }
            );
            for &id in &state.queue {
                match state.table.entry(id) {
                    Ok(entry) => {
                        log::debug!("  {} ({})", id, entry.slot.state());
                        if let Slot::Queued(op) = &entry.slot {
                            op.dump();
                        }
                    }
                    Err(err) => log::debug!("  {}: {}", id, err),
                }
            }
        }
        self.data.dump();
        self.irq.dump();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("data", &self.data.name())
            .field("irq", &self.irq.name())
            .field("queued", &self.queued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merged::build_shell;
    use crate::message::{Message, SpiDevice};
    use dmachain_hal::{DmaPool, PoolConfig};

    fn op(pool: &Arc<DmaPool>) -> Box<MergedOp> {
        let mut op = MergedOp::new(build_shell(pool).unwrap(), Message::new(SpiDevice::default()));
        op.append_marker().unwrap();
        op.seal().unwrap();
        Box::new(op)
    }

    fn pool() -> Arc<DmaPool> {
        Arc::new(DmaPool::new(PoolConfig::control_blocks(BusAddr::new(0xC000_0000), 16)).unwrap())
    }

    #[test]
    fn test_table_slot_transitions() {
        let pool = pool();
        let mut table = OpTable::default();
        let id = table.insert(op(&pool)).unwrap();

        assert!(table.queued(id).is_err());
        let taken = table.take_idle(id).unwrap();
        assert_eq!(table.get(id).unwrap_err(), Error::InvalidState);
        assert_eq!(table.take_idle(id).unwrap_err(), Error::InvalidState);

        table.restore(id, Slot::Queued(taken)).unwrap();
        assert!(table.queued(id).is_ok());
        assert_eq!(table.live(), 1);
    }

    #[test]
    fn test_retired_ids_go_stale() {
        let pool = pool();
        let mut table = OpTable::default();
        let first = table.insert(op(&pool)).unwrap();
        drop(table.take_idle(first).unwrap());
        table.retire(first).unwrap();

        let second = table.insert(op(&pool)).unwrap();
        assert_eq!(second.index(), first.index());
        assert_ne!(second.generation(), first.generation());
        assert_eq!(
            table.get(first).unwrap_err(),
            Error::ConsistencyFault(Fault::StaleOperation)
        );
        assert!(table.get(second).is_ok());
    }
}
