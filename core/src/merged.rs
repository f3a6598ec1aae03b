//! # Merged Operations
//!
//! A merged operation is one message compiled into a single control-block
//! chain: a shell fragment (owning the completion marker) followed by the
//! fragments merged for each transfer.
//!
//! ## Completion marker
//!
//! The shell owns a marker block whose first two words start at zero before
//! every submission:
//!
//! | word          | set by                                 | meaning               |
//! |---------------|----------------------------------------|-----------------------|
//! | `COMPLETE`    | last block to execute for the op       | safe to release       |
//! | `DATA_DONE`   | marker-write block on the data channel | data chain has passed |
//!
//! Without a callback the marker-write block is the chain tail and sets both
//! words. With a callback it sets only `DATA_DONE`; the interrupt block run by
//! the completion channel sets `COMPLETE` afterwards. In both cases the block
//! that sets `COMPLETE` runs after the chain tail has been loaded by the
//! controller, so relinking that tail is safe once `COMPLETE` is observed.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use dmachain_hal::cb::{word, ControlBlock, TransferInfo};
use dmachain_hal::{BusAddr, DmaCs, DmaPool, DmaReg};
use static_assertions::const_assert;

use crate::cache::{FragmentCaches, FragmentFactory};
use crate::error::{Error, Result};
use crate::fragment::Fragment;
use crate::link::{self, DmaLink};
use crate::message::Message;
use crate::transform::{Operand, Stage, Transform, TransformCtx};
use crate::types::{AllocContext, CacheId};

/// Shell link holding the completion marker words
pub const MARKER_LINK: usize = 0;
/// Shell link that writes the marker on the data channel
pub const MARKER_WRITE_LINK: usize = 1;
/// Non-zero value written into marker words
pub const MARKER_MAGIC: u32 = 0x444d_4143;

/// Marker word indices
pub mod marker {
    /// Set once the operation may be released
    pub const COMPLETE: usize = 0;
    /// Set once the data channel has passed the operation
    pub const DATA_DONE: usize = 1;
}

const_assert!(marker::DATA_DONE == marker::COMPLETE + 1);

// =============================================================================
// STATUS
// =============================================================================

/// Per-submission status, reset before every submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpStatus {
    /// Outcome
    pub result: Result<()>,
    /// Bytes accounted by post-transforms
    pub actual_length: u32,
}

impl Default for OpStatus {
    fn default() -> Self {
        Self {
            result: Ok(()),
            actual_length: 0,
        }
    }
}

// =============================================================================
// SHELL
// =============================================================================

/// Build the shell fragment every merged operation starts from
pub fn build_shell(pool: &Arc<DmaPool>) -> Result<Fragment> {
    let mut shell = Fragment::new("merged");

    let storage = DmaLink::allocate(pool, "completion marker")?;
    let marker_bus = storage.bus();
    let write = DmaLink::with_block(
        pool,
        "marker write",
        ControlBlock::copy(
            (TransferInfo::WAIT_RESP | TransferInfo::SRC_INC | TransferInfo::DEST_INC).bits(),
            BusAddr::null(),
            marker_bus,
            8,
        )
        .with_pad(MARKER_MAGIC, MARKER_MAGIC),
    )?;
    link::source_from_payload(&write)?;

    shell.push_link(storage);
    shell.push_link(write);
    shell.set_head(MARKER_WRITE_LINK)?;
    shell.set_tail(MARKER_WRITE_LINK)?;

    shell.add_transform(Transform::write_u32(
        Stage::Pre,
        Operand::word(MARKER_LINK, marker::COMPLETE),
        0,
    ));
    shell.add_transform(Transform::write_u32(
        Stage::Pre,
        Operand::word(MARKER_LINK, marker::DATA_DONE),
        0,
    ));
    Ok(shell)
}

/// Cache factory producing shells
pub fn shell_factory(pool: Arc<DmaPool>) -> FragmentFactory {
    Box::new(move |_alloc: AllocContext| build_shell(&pool))
}

// =============================================================================
// COMPLETION TRIGGER
// =============================================================================

/// Trigger link that points the completion channel at its block
pub const TRIGGER_ADDR_LINK: usize = 0;
/// Trigger link that starts the completion channel
pub const TRIGGER_START_LINK: usize = 1;
/// Standalone block executed by the completion channel
pub const TRIGGER_IRQ_LINK: usize = 2;

/// Build the fragment that raises the completion interrupt.
///
/// The data channel runs the two kick blocks, which load and start the block
/// at [`TRIGGER_IRQ_LINK`] on the completion channel whose register window
/// is at `irq_channel`. That block marks the operation complete and
/// interrupts.
pub fn build_trigger(pool: &Arc<DmaPool>, irq_channel: BusAddr) -> Result<Fragment> {
    let mut trigger = Fragment::new("trigger_irq");

    let irq = DmaLink::with_block(
        pool,
        "irq: mark complete",
        ControlBlock::copy(
            (TransferInfo::INTEN | TransferInfo::WAIT_RESP).bits(),
            BusAddr::null(),
            BusAddr::null(),
            4,
        )
        .with_pad(MARKER_MAGIC, 0),
    )?;
    let kick_addr = DmaLink::with_block(
        pool,
        "irq: load block",
        ControlBlock::copy(
            TransferInfo::WAIT_RESP.bits(),
            BusAddr::null(),
            irq_channel + DmaReg::ConblkAd.offset(),
            4,
        )
        .with_pad(irq.bus().raw(), 0),
    )?;
    let kick_start = DmaLink::with_block(
        pool,
        "irq: start",
        ControlBlock::copy(
            TransferInfo::WAIT_RESP.bits(),
            BusAddr::null(),
            irq_channel + DmaReg::Cs.offset(),
            4,
        )
        .with_pad(DmaCs::ACTIVE.bits(), 0),
    )?;
    for link in [&irq, &kick_addr, &kick_start] {
        link::source_from_payload(link)?;
    }

    trigger.push_link(kick_addr);
    trigger.push_link(kick_start);
    trigger.push_link(irq);
    trigger.chain(TRIGGER_ADDR_LINK, TRIGGER_START_LINK)?;
    trigger.set_head(TRIGGER_ADDR_LINK)?;
    trigger.set_tail(TRIGGER_START_LINK)?;

    trigger.add_transform(
        Transform::pre("marker_target", marker_target)
            .with_dst(Operand::word(TRIGGER_IRQ_LINK, word::DEST_AD)),
    );
    Ok(trigger)
}

/// Cache factory producing completion triggers
pub fn trigger_factory(pool: Arc<DmaPool>, irq_channel: BusAddr) -> FragmentFactory {
    Box::new(move |_alloc: AllocContext| build_trigger(&pool, irq_channel))
}

/// Point `dst` at the operation's `COMPLETE` marker word
pub fn marker_target(t: &Transform, ctx: &mut TransformCtx<'_>) -> Result<()> {
    t.dst.store(ctx, ctx.marker.word(marker::COMPLETE).raw())
}

// =============================================================================
// MERGED OPERATION
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LinkRef {
    fragment: usize,
    link: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TransformRef {
    fragment: usize,
    index: usize,
    transfer: Option<usize>,
}

/// One message compiled into a control-block chain
pub struct MergedOp {
    message: Message,
    /// `fragments[0]` is the shell
    fragments: Vec<Fragment>,
    order: Vec<TransformRef>,
    head: Option<LinkRef>,
    tail: Option<LinkRef>,
    status: OpStatus,
    optimized: bool,
    sealed: bool,
}

impl MergedOp {
    /// Start an operation from a shell fragment
    pub fn new(shell: Fragment, message: Message) -> Self {
        let order = (0..shell.transforms().len())
            .map(|index| TransformRef {
                fragment: 0,
                index,
                transfer: None,
            })
            .collect();
        Self {
            message,
            fragments: alloc::vec![shell],
            order,
            head: None,
            tail: None,
            status: OpStatus::default(),
            optimized: false,
            sealed: false,
        }
    }

    /// Append a fragment: link the current tail to its head, adopt its tail
    /// and queue its transforms. `transfer` binds them to a descriptor.
    ///
    /// The fragment is owned by the operation even when linking fails, so
    /// [`MergedOp::abandon`] returns it with the rest.
    pub fn merge(&mut self, mut fragment: Fragment, transfer: Option<usize>) -> Result<()> {
        if self.sealed {
            return Err(Error::InvalidState);
        }
        fragment.set_default_links();
        let index = self.fragments.len();
        self.fragments.push(fragment);
        self.append_segment(index)?;

        let count = self.fragments[index].transforms().len();
        self.order.extend((0..count).map(|i| TransformRef {
            fragment: index,
            index: i,
            transfer,
        }));
        Ok(())
    }

    /// Append the shell's marker-write block to the chain.
    ///
    /// With a callback the block only records that the data chain passed;
    /// otherwise it is the last block and marks the operation complete.
    pub fn append_marker(&mut self) -> Result<()> {
        if self.sealed {
            return Err(Error::InvalidState);
        }
        let with_callback = self.message.has_callback();
        let shell = &self.fragments[0];
        let marker_bus = shell.link(MARKER_LINK)?.bus();
        let write = shell.link(MARKER_WRITE_LINK)?;
        if with_callback {
            write.write(word::DEST_AD, marker_bus.word(marker::DATA_DONE).raw())?;
            write.write(word::TXFR_LEN, 4)?;
        } else {
            write.write(word::DEST_AD, marker_bus.word(marker::COMPLETE).raw())?;
            write.write(word::TXFR_LEN, 8)?;
        }
        self.append_segment(0)
    }

    /// Freeze the chain; no more merges
    pub fn seal(&mut self) -> Result<()> {
        if self.head.is_none() || self.tail.is_none() {
            return Err(Error::MergeFailure);
        }
        self.sealed = true;
        Ok(())
    }

    fn append_segment(&mut self, index: usize) -> Result<()> {
        let fragment = &self.fragments[index];
        let (Some(head), Some(tail)) = (fragment.head(), fragment.tail()) else {
            log::error!("merge: fragment {} has no blocks", fragment.desc());
            return Err(Error::MergeFailure);
        };
        let head_bus = fragment.link(head)?.bus();

        match self.tail {
            Some(prev) => self.link_at(prev)?.link_to(head_bus)?,
            None => {
                self.head = Some(LinkRef {
                    fragment: index,
                    link: head,
                })
            }
        }
        self.tail = Some(LinkRef {
            fragment: index,
            link: tail,
        });
        Ok(())
    }

    fn link_at(&self, at: LinkRef) -> Result<&DmaLink> {
        self.fragments
            .get(at.fragment)
            .ok_or(Error::InvalidParameter)?
            .link(at.link)
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Make the operation ready to publish: reset status, terminate the tail
    /// and run pre-transforms. Returns the chain head.
    pub fn prepare(&mut self) -> Result<BusAddr> {
        if !self.sealed {
            return Err(Error::InvalidState);
        }
        self.status = OpStatus::default();
        self.tail_link()?.terminate()?;
        self.run_stage(Stage::Pre)?;
        self.head_bus()
    }

    /// Run post-transforms and record the outcome
    pub fn finish(&mut self, result: Result<()>) -> OpStatus {
        self.status.result = result;
        if result.is_ok() {
            if let Err(err) = self.run_stage(Stage::Post) {
                log::error!("post-transform failed: {}", err);
                self.status.result = Err(err);
            }
        }
        self.status
    }

    fn run_stage(&mut self, stage: Stage) -> Result<()> {
        let Self {
            message,
            fragments,
            order,
            status,
            ..
        } = self;
        let marker = fragments[0].link(MARKER_LINK)?.bus();

        for entry in order.iter() {
            let fragment = &fragments[entry.fragment];
            let transform = &fragment.transforms()[entry.index];
            if transform.stage != stage {
                continue;
            }
            let transfer = match entry.transfer {
                Some(i) => Some(
                    message
                        .transfers()
                        .get(i)
                        .ok_or(Error::Transform("descriptor index out of range"))?,
                ),
                None => None,
            };
            let mut ctx = TransformCtx {
                links: fragment.links(),
                message,
                transfer,
                marker,
                status: &mut *status,
            };
            transform.apply(&mut ctx)?;
        }
        Ok(())
    }

    /// Whether the marker proves the operation finished
    pub fn is_complete(&self) -> bool {
        self.marker_word(marker::COMPLETE) != 0
    }

    /// Whether the data channel has passed this operation
    pub fn data_done(&self) -> bool {
        self.marker_word(marker::DATA_DONE) != 0 || self.is_complete()
    }

    fn marker_word(&self, index: usize) -> u32 {
        self.fragments[0]
            .link(MARKER_LINK)
            .and_then(|link| link.read(index))
            .unwrap_or(0)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Bus address of the first block
    pub fn head_bus(&self) -> Result<BusAddr> {
        let head = self.head.ok_or(Error::MergeFailure)?;
        Ok(self.link_at(head)?.bus())
    }

    /// Last block; its link word is what the next operation splices onto
    pub fn tail_link(&self) -> Result<&DmaLink> {
        let tail = self.tail.ok_or(Error::MergeFailure)?;
        self.link_at(tail)
    }

    /// Bus address of the completion marker
    pub fn marker_bus(&self) -> Result<BusAddr> {
        Ok(self.fragments[0].link(MARKER_LINK)?.bus())
    }

    /// The compiled message
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// The compiled message, mutably
    pub fn message_mut(&mut self) -> &mut Message {
        &mut self.message
    }

    /// Status of the last submission
    pub fn status(&self) -> OpStatus {
        self.status
    }

    /// Whether the operation is kept for resubmission
    pub fn is_optimized(&self) -> bool {
        self.optimized
    }

    /// Mark the operation as kept for resubmission
    pub fn set_optimized(&mut self, optimized: bool) {
        self.optimized = optimized;
    }

    /// Whether the chain is frozen
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// The shell fragment
    pub fn shell(&self) -> &Fragment {
        &self.fragments[0]
    }

    /// Fragments merged after the shell, in merge order
    pub fn parts(&self) -> &[Fragment] {
        &self.fragments[1..]
    }

    /// Number of merged fragments that came from `cache`
    pub fn count_from(&self, cache: CacheId) -> usize {
        self.parts()
            .iter()
            .filter(|fragment| fragment.cache() == Some(cache))
            .count()
    }

    /// Every block bus address from head to tail, following link words
    pub fn chain(&self) -> Result<Vec<BusAddr>> {
        let tail = self.tail_link()?.bus();
        let total: usize = self.fragments.iter().map(|f| f.links().len()).sum();
        let mut chain = Vec::new();
        let mut current = self.head_bus()?;
        for _ in 0..total {
            chain.push(current);
            if current == tail {
                return Ok(chain);
            }
            current = self
                .fragments
                .iter()
                .flat_map(|f| f.links())
                .find(|link| link.bus() == current)
                .ok_or(Error::MergeFailure)?
                .next()?;
        }
        Err(Error::MergeFailure)
    }

    /// Split into fragments and message
    pub fn into_parts(self) -> (Vec<Fragment>, Message) {
        (self.fragments, self.message)
    }

    /// Return every fragment to its cache, dropping the message
    pub fn abandon(self, caches: &FragmentCaches) {
        let (fragments, _message) = self.into_parts();
        for fragment in fragments {
            if let Err(err) = caches.give_back(fragment) {
                log::error!("abandon: fragment not returned: {}", err);
            }
        }
    }

    /// Log the whole operation at debug level
    pub fn dump(&self) {
        log::debug!(
            "merged op: {} fragments, {} transforms, optimized={}, complete={}",
            self.fragments.len(),
            self.order.len(),
            self.optimized,
            self.is_complete()
        );
        match self.chain() {
            Ok(chain) => log::debug!("  chain: {:?}", chain),
            Err(err) => log::debug!("  chain unreadable: {}", err),
        }
        for fragment in &self.fragments {
            fragment.dump();
        }
    }
}

impl fmt::Debug for MergedOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergedOp")
            .field("fragments", &self.fragments.len())
            .field("transforms", &self.order.len())
            .field("optimized", &self.optimized)
            .field("sealed", &self.sealed)
            .field("status", &self.status)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{SpiDevice, Transfer};
    use dmachain_hal::PoolConfig;

    fn pool() -> Arc<DmaPool> {
        Arc::new(DmaPool::new(PoolConfig::control_blocks(BusAddr::new(0xC000_0000), 16)).unwrap())
    }

    fn count_len(_t: &Transform, ctx: &mut TransformCtx<'_>) -> Result<()> {
        ctx.status.actual_length += ctx.require_transfer()?.len;
        Ok(())
    }

    fn part(pool: &Arc<DmaPool>, blocks: usize) -> Fragment {
        let mut fragment = Fragment::new("part");
        for _ in 0..blocks {
            fragment.push_link(DmaLink::allocate(pool, "cb").unwrap());
        }
        fragment.chain_all().unwrap();
        fragment.add_transform(Transform::post("count", count_len));
        fragment
    }

    fn message() -> Message {
        Message::new(SpiDevice::default())
            .with_transfer(Transfer::new(4, 1_000_000))
            .with_transfer(Transfer::new(6, 1_000_000))
    }

    #[test]
    fn test_merge_links_tail_to_head() {
        let pool = pool();
        let mut op = MergedOp::new(build_shell(&pool).unwrap(), message());
        op.merge(part(&pool, 2), Some(0)).unwrap();
        op.merge(part(&pool, 1), Some(1)).unwrap();
        op.append_marker().unwrap();
        op.seal().unwrap();

        let parts = op.parts();
        let expected = alloc::vec![
            parts[0].links()[0].bus(),
            parts[0].links()[1].bus(),
            parts[1].links()[0].bus(),
            op.shell().links()[MARKER_WRITE_LINK].bus(),
        ];
        assert_eq!(op.chain().unwrap(), expected);
        assert_eq!(op.head_bus().unwrap(), expected[0]);
        assert_eq!(op.tail_link().unwrap().bus(), expected[3]);
    }

    #[test]
    fn test_marker_write_targets_depend_on_callback() {
        let pool = pool();
        let mut lazy = MergedOp::new(build_shell(&pool).unwrap(), message());
        lazy.append_marker().unwrap();
        let block = lazy.shell().links()[MARKER_WRITE_LINK].control_block().unwrap();
        assert_eq!(block.dest_ad, lazy.marker_bus().unwrap().raw());
        assert_eq!(block.txfr_len, 8);

        let mut signalled = MergedOp::new(build_shell(&pool).unwrap(), message().on_complete(|_| {}));
        signalled.append_marker().unwrap();
        let block = signalled.shell().links()[MARKER_WRITE_LINK].control_block().unwrap();
        assert_eq!(block.dest_ad, signalled.marker_bus().unwrap().word(1).raw());
        assert_eq!(block.txfr_len, 4);
    }

    #[test]
    fn test_prepare_clears_marker_and_finish_runs_post() {
        let pool = pool();
        let mut op = MergedOp::new(build_shell(&pool).unwrap(), message());
        op.merge(part(&pool, 1), Some(0)).unwrap();
        op.merge(part(&pool, 1), Some(1)).unwrap();
        op.append_marker().unwrap();
        op.seal().unwrap();

        let marker = op.shell().links()[MARKER_LINK].bus();
        assert!(pool.write_bus(marker, MARKER_MAGIC));
        assert!(op.is_complete());

        let head = op.prepare().unwrap();
        assert_eq!(head, op.parts()[0].links()[0].bus());
        assert!(!op.is_complete());
        assert!(!op.data_done());

        let status = op.finish(Ok(()));
        assert_eq!(status.actual_length, 10);
        assert_eq!(status.result, Ok(()));
    }

    #[test]
    fn test_trigger_targets_marker() {
        let pool = pool();
        let irq_channel = BusAddr::new(0x7E00_7100);
        let mut op = MergedOp::new(build_shell(&pool).unwrap(), message().on_complete(|_| {}));
        op.merge(build_trigger(&pool, irq_channel).unwrap(), None).unwrap();
        op.append_marker().unwrap();
        op.seal().unwrap();
        op.prepare().unwrap();

        let trigger = &op.parts()[0];
        assert_eq!(trigger.walk().unwrap().len(), 2);
        let irq = trigger.links()[TRIGGER_IRQ_LINK].control_block().unwrap();
        assert_eq!(irq.dest_ad, op.marker_bus().unwrap().raw());
        assert!(irq.info().contains(TransferInfo::INTEN));
        let kick = trigger.links()[TRIGGER_ADDR_LINK].control_block().unwrap();
        assert_eq!(kick.dest_ad, irq_channel.raw() + 0x04);
        assert_eq!(kick.pad[0], trigger.links()[TRIGGER_IRQ_LINK].bus().raw());
    }

    #[test]
    fn test_merge_rejects_empty_fragment_but_keeps_it() {
        let pool = pool();
        let mut op = MergedOp::new(build_shell(&pool).unwrap(), message());
        assert_eq!(op.merge(Fragment::new("empty"), None), Err(Error::MergeFailure));
        assert_eq!(op.parts().len(), 1);
        assert_eq!(op.prepare(), Err(Error::InvalidState));
    }
}
