//! # Completion Engine
//!
//! Runs in interrupt context when the completion channel raises its
//! interrupt. It walks the submission queue front to back and releases every
//! operation whose completion marker proves it finished, stopping at the
//! first one that has not. One interrupt may therefore release several
//! operations, including earlier ones that never asked for an interrupt.

use alloc::boxed::Box;

use dmachain_hal::{DmaCs, DmaReg};

use crate::error::{Error, Result};
use crate::merged::MergedOp;
use crate::message::Completion;
use crate::scheduler::{Scheduler, Slot};
use crate::types::{IrqOutcome, OpId};

impl Scheduler {
    /// Completion interrupt entry point
    pub fn handle_interrupt(&self) -> IrqOutcome {
        self.rearm_irq_channel();

        let was_empty = self.state.lock().queue.is_empty();
        let released = self.release_completed();
        self.restart_if_idle();

        let outcome = if released > 0 {
            IrqOutcome::Released(released)
        } else if was_empty {
            log::trace!("completion interrupt with an empty queue");
            IrqOutcome::Spurious
        } else {
            IrqOutcome::Pending
        };
        self.observer.on_interrupt(outcome);
        outcome
    }

    /// Acknowledge the completion channel's interrupt once it has no block
    /// loaded. A trigger that raced the acknowledgement is started again.
    fn rearm_irq_channel(&self) {
        if self.irq.read(DmaReg::ConblkAd) != 0 {
            return;
        }
        let cs = self.irq.status();
        if cs.contains(DmaCs::INT) {
            self.irq.write(DmaReg::Cs, (cs | DmaCs::INT | DmaCs::ACTIVE).bits());
        }
    }

    /// Neither channel has anything left to execute
    fn engine_settled(&self) -> bool {
        !self.data.is_active() && !self.irq.is_active() && self.irq.read(DmaReg::ConblkAd) == 0
    }

    fn is_finished(&self, op: &MergedOp) -> bool {
        // A lost completion trigger leaves only the data marker behind
        op.is_complete() || (op.data_done() && self.engine_settled())
    }

    fn release_completed(&self) -> usize {
        let mut released = 0;
        loop {
            let next = {
                let mut state = self.state.lock();
                let Some(&id) = state.queue.front() else {
                    break;
                };
                match state.table.queued(id) {
                    Ok(op) if !self.is_finished(op) => break,
                    Ok(_) => {}
                    Err(err) => {
                        // Not ours any more; drop it so the walk can go on
                        state.queue.pop_front();
                        drop(state);
                        self.observer.on_fault(err);
                        continue;
                    }
                }
                state.queue.pop_front();
                state.table.take_queued(id).map(|op| (id, op))
            };
            match next {
                Ok((id, op)) => {
                    self.complete(id, op, Ok(()));
                    released += 1;
                }
                Err(err) => self.observer.on_fault(err),
            }
        }
        released
    }

    /// Start the engine again if it stopped with work still queued
    pub(crate) fn restart_if_idle(&self) {
        let mut state = self.state.lock();
        if self.data.is_active() {
            return;
        }
        if state.queue.is_empty() {
            state.deferred = false;
        } else {
            self.kick(&mut state);
        }
    }

    /// Finish a dequeued operation: post-transforms, fragments back to their
    /// caches unless it is kept for reuse, then the callback.
    pub(crate) fn complete(&self, id: OpId, mut op: Box<MergedOp>, result: Result<()>) {
        let status = op.finish(result);
        let completion = Completion {
            id,
            status: status.result,
            actual_length: status.actual_length,
        };

        if op.is_optimized() {
            // The callback runs before the operation can be submitted again
            op.message_mut().notify(completion);
            if let Err(err) = self.state.lock().table.restore(id, Slot::Idle(op)) {
                self.observer.on_fault(err);
            }
        } else {
            if let Err(err) = self.state.lock().table.retire(id) {
                self.observer.on_fault(err);
            }
            let (fragments, mut message) = (*op).into_parts();
            for fragment in fragments {
                if let Err(err) = self.caches.give_back(fragment) {
                    self.observer.on_fault(err);
                }
            }
            message.notify(completion);
        }
        self.observer.on_release(id, &completion);
    }

    /// Collaborator fallback for an operation the hardware never finished.
    ///
    /// Both channels are reset, the operation is unlinked from its
    /// neighbours and completed with [`Error::HardwareTimeout`], and the
    /// engine restarts at the next pending operation.
    pub fn release_on_timeout(&self, id: OpId) -> Result<()> {
        let op = {
            let mut state = self.state.lock();
            let position = state
                .queue
                .iter()
                .position(|&queued| queued == id)
                .ok_or(Error::InvalidState)?;
            // Validates the handle before anything is touched
            state.table.queued(id)?;

            self.data.reset();
            self.irq.reset();

            let next_head = match state.queue.get(position + 1) {
                Some(&next) => Some(state.table.queued(next)?.head_bus()?),
                None => None,
            };
            if let Some(prev) = position.checked_sub(1).and_then(|p| state.queue.get(p).copied()) {
                let tail = state.table.queued(prev)?.tail_link()?;
                match next_head {
                    Some(head) => tail.link_to(head)?,
                    None => tail.terminate()?,
                }
            }

            state.queue.remove(position);
            state.table.take_queued(id)?
        };

        log::warn!("{}: released after hardware timeout", id);
        self.complete(id, op, Err(Error::HardwareTimeout));
        self.restart_if_idle();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{FragmentCaches, FragmentFactory};
    use crate::compiler::{compile, FragmentSet};
    use crate::error::Fault;
    use crate::fragment::Fragment;
    use crate::link::{self, DmaLink};
    use crate::merged::{shell_factory, trigger_factory};
    use crate::message::{Message, SpiDevice, Transfer};
    use crate::observer::{DebugFlags, DebugObserver};
    use crate::transform::{Transform, TransformCtx};
    use crate::types::AllocContext;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use dmachain_hal::sim::SimDma;
    use dmachain_hal::{BusAddr, ControlBlock, DmaChannel, DmaPool, PoolConfig, TransferInfo};

    const DMA_BASE: BusAddr = BusAddr::new(0x7E00_7000);
    const PERIPH: BusAddr = BusAddr::new(0x7E20_4000);
    const DATA: usize = 0;
    const IRQ: usize = 1;

    struct Rig {
        sim: Arc<SimDma>,
        set: FragmentSet,
        observer: Arc<DebugObserver>,
        scheduler: Scheduler,
    }

    type Log = Arc<spin::Mutex<Vec<Completion>>>;

    fn count_len(_t: &Transform, ctx: &mut TransformCtx<'_>) -> Result<()> {
        ctx.status.actual_length += ctx.require_transfer()?.len;
        Ok(())
    }

    fn tagged(pool: &Arc<DmaPool>, desc: &'static str, tag: u32) -> FragmentFactory {
        let pool = Arc::clone(pool);
        Box::new(move |_| {
            let block = ControlBlock::copy(TransferInfo::WAIT_RESP.bits(), BusAddr::null(), PERIPH, 4)
                .with_pad(tag, 0);
            let link = DmaLink::with_block(&pool, desc, block)?;
            link::source_from_payload(&link)?;
            let mut fragment = Fragment::new(desc);
            fragment.push_link(link);
            if tag == 2 {
                fragment.add_transform(Transform::post("count", count_len));
            }
            Ok(fragment)
        })
    }

    fn rig() -> Rig {
        let sim = SimDma::new(DMA_BASE, 2);
        let pool = Arc::new(
            DmaPool::new(PoolConfig::control_blocks(BusAddr::new(0xC000_0000), 128)).unwrap(),
        );
        sim.attach_pool(Arc::clone(&pool));
        sim.map_registers("periph", PERIPH, 0x20);
        let data = Arc::new(sim.channel(DATA, "data"));
        let irq = Arc::new(sim.channel(IRQ, "irq"));

        let mut caches = FragmentCaches::new();
        let set = FragmentSet {
            merged: caches.register("merged", 2, shell_factory(Arc::clone(&pool))).unwrap(),
            setup: caches.register("setup", 1, tagged(&pool, "setup", 1)).unwrap(),
            transfer: caches.register("transfer", 1, tagged(&pool, "transfer", 2)).unwrap(),
            cs_deselect: caches.register("cs_deselect", 1, tagged(&pool, "cs_deselect", 3)).unwrap(),
            delay: caches.register("delay", 0, tagged(&pool, "delay", 4)).unwrap(),
            trigger_irq: caches
                .register("trigger_irq", 1, trigger_factory(Arc::clone(&pool), irq.bus_base()))
                .unwrap(),
        };
        let observer = Arc::new(DebugObserver::new(DebugFlags::all()));
        let scheduler = Scheduler::new(Arc::new(caches), data, irq, observer.clone());
        Rig {
            sim,
            set,
            observer,
            scheduler,
        }
    }

    impl Rig {
        fn op(&self, message: Message) -> OpId {
            let op = compile(self.scheduler.caches(), &self.set, message, AllocContext::Blocking).unwrap();
            self.scheduler.register(op).unwrap()
        }

        fn run(&self) {
            self.sim.run_until_idle(256);
        }

        fn assert_caches_drained(&self) {
            for stats in self.scheduler.caches().stats() {
                assert_eq!(stats.active, 0, "{} still lent out", stats.name);
                assert!(stats.is_consistent());
            }
        }
    }

    fn message(len: u32) -> Message {
        Message::new(SpiDevice::default()).with_transfer(Transfer::new(len, 1_000_000))
    }

    fn recorder() -> (Log, impl FnMut(Completion) + Send + 'static) {
        let log: Log = Arc::new(spin::Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        (log, move |completion| sink.lock().push(completion))
    }

    #[test]
    fn test_spliced_operations_run_back_to_back() {
        let rig = rig();
        let a = rig.op(message(4));
        let b = rig.op(message(8));
        let mut expected = rig.scheduler.chain_of(a).unwrap();
        expected.extend(rig.scheduler.chain_of(b).unwrap());

        rig.scheduler.submit(a).unwrap();
        rig.scheduler.submit(b).unwrap();
        assert_eq!(rig.scheduler.queued(), 2);
        rig.run();

        assert_eq!(rig.sim.trace_for(DATA), expected);
        assert_eq!(rig.scheduler.handle_interrupt(), IrqOutcome::Released(2));
        assert_eq!(rig.scheduler.queued(), 0);
        rig.assert_caches_drained();

        let stats = rig.observer.stats().snapshot();
        assert_eq!(stats.dma_started, 1);
        assert_eq!(stats.dma_still_running, 1);
        assert_eq!(stats.released, 2);
    }

    #[test]
    fn test_missed_splice_is_repaired() {
        let rig = rig();
        let a = rig.op(message(4));
        let b = rig.op(message(8));
        let chain_a = rig.scheduler.chain_of(a).unwrap();
        let chain_b = rig.scheduler.chain_of(b).unwrap();
        let tail_a = *chain_a.last().unwrap();

        rig.scheduler.submit(a).unwrap();
        while rig.sim.loaded_block(DATA) != Some(tail_a) {
            assert!(rig.sim.step());
        }
        // `a`'s tail is latched with an empty link
        rig.scheduler.submit(b).unwrap();
        rig.run();

        let mut expected = chain_a;
        expected.extend(chain_b);
        assert_eq!(rig.sim.trace_for(DATA), expected);
        assert_eq!(rig.scheduler.handle_interrupt(), IrqOutcome::Released(2));
    }

    #[test]
    fn test_idle_engine_starts_at_first_pending_operation() {
        let rig = rig();
        let a = rig.op(message(4));
        let b = rig.op(message(8));
        let mut expected = rig.scheduler.chain_of(a).unwrap();
        expected.extend(rig.scheduler.chain_of(b).unwrap());

        rig.scheduler.submit(a).unwrap();
        rig.run();
        // `a` is still queued, its data phase is done
        rig.scheduler.submit(b).unwrap();
        rig.run();

        assert_eq!(rig.sim.trace_for(DATA), expected);
        assert_eq!(rig.observer.stats().snapshot().dma_started, 2);
        assert_eq!(rig.scheduler.handle_interrupt(), IrqOutcome::Released(2));
    }

    #[test]
    fn test_callbacks_fire_in_submission_order() {
        let rig = rig();
        let (log, _) = recorder();
        let ids: Vec<OpId> = [4u32, 8, 2]
            .iter()
            .map(|&len| {
                let sink = Arc::clone(&log);
                rig.op(message(len).on_complete(move |c| sink.lock().push(c)))
            })
            .collect();

        for &id in &ids {
            rig.scheduler.submit(id).unwrap();
        }
        assert_eq!(rig.scheduler.handle_interrupt(), IrqOutcome::Pending);
        rig.run();
        assert!(rig.sim.irq_pending(IRQ));

        assert_eq!(rig.scheduler.handle_interrupt(), IrqOutcome::Released(3));
        assert!(!rig.sim.irq_pending(IRQ));
        let log = log.lock();
        let order: Vec<OpId> = log.iter().map(|c| c.id).collect();
        assert_eq!(order, ids);
        let lengths: Vec<u32> = log.iter().map(|c| c.actual_length).collect();
        assert_eq!(lengths, alloc::vec![4, 8, 2]);
        assert!(log.iter().all(|c| c.status.is_ok()));
        rig.assert_caches_drained();
    }

    #[test]
    fn test_spurious_interrupt() {
        let rig = rig();
        assert_eq!(rig.scheduler.handle_interrupt(), IrqOutcome::Spurious);
        assert_eq!(rig.observer.stats().snapshot().spurious, 1);
    }

    #[test]
    fn test_optimized_operation_is_reused() {
        let rig = rig();
        let (log, callback) = recorder();
        let a = rig.op(message(4).on_complete(callback));
        rig.scheduler.set_optimized(a, true).unwrap();
        let chain = rig.scheduler.chain_of(a).unwrap();

        for round in 1..=2 {
            rig.scheduler.submit(a).unwrap();
            rig.run();
            assert_eq!(rig.scheduler.handle_interrupt(), IrqOutcome::Released(1));
            assert_eq!(log.lock().len(), round);
            assert_eq!(rig.scheduler.chain_of(a).unwrap(), chain);
        }
        assert_eq!(rig.observer.stats().snapshot().optimized_messages, 2);

        rig.scheduler.release(a).unwrap();
        assert_eq!(
            rig.scheduler.release(a),
            Err(Error::ConsistencyFault(Fault::StaleOperation))
        );
        rig.assert_caches_drained();
    }

    #[test]
    fn test_state_checks() {
        let rig = rig();
        let a = rig.op(message(4));
        rig.scheduler.submit(a).unwrap();
        assert_eq!(rig.scheduler.submit(a), Err(Error::InvalidState));
        assert_eq!(rig.scheduler.release(a), Err(Error::InvalidState));

        rig.run();
        assert_eq!(rig.scheduler.handle_interrupt(), IrqOutcome::Released(1));
        assert_eq!(
            rig.scheduler.submit(a),
            Err(Error::ConsistencyFault(Fault::StaleOperation))
        );
    }

    #[test]
    fn test_timeout_unlinks_operation() {
        let rig = rig();
        let (log, callback) = recorder();
        let a = rig.op(message(4));
        let b = rig.op(message(8).on_complete(callback));
        let c = rig.op(message(2));
        let mut expected = rig.scheduler.chain_of(a).unwrap();
        expected.extend(rig.scheduler.chain_of(c).unwrap());

        for id in [a, b, c] {
            rig.scheduler.submit(id).unwrap();
        }
        rig.scheduler.release_on_timeout(b).unwrap();
        assert_eq!(log.lock()[0].status, Err(Error::HardwareTimeout));
        assert_eq!(rig.scheduler.queue_snapshot(), alloc::vec![a, c]);

        rig.run();
        assert_eq!(rig.sim.trace_for(DATA), expected);
        assert_eq!(rig.scheduler.handle_interrupt(), IrqOutcome::Released(2));
        assert_eq!(rig.observer.stats().snapshot().timeouts, 1);
        rig.assert_caches_drained();
    }

    #[test]
    fn test_timeout_of_head_and_last_operations() {
        let rig = rig();
        let (log, callback) = recorder();
        let a = rig.op(message(4));
        let b = rig.op(message(8));
        let c = rig.op(message(2).on_complete(callback));
        let chain_b = rig.scheduler.chain_of(b).unwrap();

        for id in [a, b, c] {
            rig.scheduler.submit(id).unwrap();
        }
        assert!(rig.sim.step());
        rig.scheduler.release_on_timeout(a).unwrap();
        rig.scheduler.release_on_timeout(c).unwrap();
        assert_eq!(rig.scheduler.queue_snapshot(), alloc::vec![b]);
        assert_eq!(log.lock()[0].status, Err(Error::HardwareTimeout));

        rig.sim.clear_trace();
        rig.run();
        assert_eq!(rig.sim.trace_for(DATA), chain_b);
        assert_eq!(rig.scheduler.handle_interrupt(), IrqOutcome::Released(1));
        assert_eq!(rig.observer.stats().snapshot().timeouts, 2);
        rig.assert_caches_drained();
    }

    #[test]
    fn test_start_behind_foreign_chain_is_deferred() {
        let rig = rig();
        let stray_pool = Arc::new(
            DmaPool::new(PoolConfig::control_blocks(BusAddr::new(0xC800_0000), 1)).unwrap(),
        );
        rig.sim.attach_pool(Arc::clone(&stray_pool));
        let block = ControlBlock::copy(TransferInfo::WAIT_RESP.bits(), BusAddr::null(), PERIPH, 4);
        let stray = DmaLink::with_block(&stray_pool, "stray", block).unwrap();
        link::source_from_payload(&stray).unwrap();
        rig.sim.channel(DATA, "stray").start(stray.bus());

        let a = rig.op(message(4));
        let b = rig.op(message(8));
        let mut expected = rig.scheduler.chain_of(a).unwrap();
        expected.extend(rig.scheduler.chain_of(b).unwrap());

        rig.scheduler.submit(a).unwrap();
        assert!(rig.scheduler.is_deferred());
        assert_eq!(rig.sim.loaded_block(DATA), Some(stray.bus()));
        // Spliced onto `a`, which the engine is not running
        rig.scheduler.submit(b).unwrap();
        assert!(rig.scheduler.is_deferred());
        assert!(!rig.scheduler.poll());

        rig.run();
        assert_eq!(rig.sim.trace_for(DATA), alloc::vec![stray.bus()]);
        assert_eq!(rig.scheduler.queued(), 2);
        assert!(rig.scheduler.poll());
        assert!(!rig.scheduler.is_deferred());

        rig.sim.clear_trace();
        rig.run();
        assert_eq!(rig.sim.trace_for(DATA), expected);
        assert_eq!(rig.scheduler.handle_interrupt(), IrqOutcome::Released(2));
        assert!(!rig.scheduler.poll());
        rig.assert_caches_drained();
    }

    #[test]
    fn test_lost_trigger_released_once_engine_settles() {
        let rig = rig();
        let (log, callback) = recorder();
        let a = rig.op(message(4).on_complete(callback));
        let start_irq = *rig.scheduler.chain_of(a).unwrap().last().unwrap();

        rig.scheduler.submit(a).unwrap();
        while rig.sim.loaded_block(DATA) != Some(start_irq) {
            assert!(rig.sim.step());
        }
        rig.sim.channel(IRQ, "irq").reset();
        rig.run();

        assert!(!rig.sim.irq_pending(IRQ));
        assert_eq!(rig.scheduler.handle_interrupt(), IrqOutcome::Released(1));
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn test_shutdown_fails_queued_operations() {
        let rig = rig();
        let (log, _) = recorder();
        for len in [4, 8] {
            let sink = Arc::clone(&log);
            let id = rig.op(message(len).on_complete(move |c| sink.lock().push(c)));
            rig.scheduler.submit(id).unwrap();
        }

        rig.scheduler.shutdown();
        assert_eq!(rig.scheduler.queued(), 0);
        assert!(!rig.sim.any_active());
        let log = log.lock();
        assert_eq!(log.len(), 2);
        assert!(log.iter().all(|c| c.status == Err(Error::Shutdown)));
        rig.assert_caches_drained();
    }
}
