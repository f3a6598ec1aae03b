//! # Operation Compiler
//!
//! Turns a [`Message`] into a [`MergedOp`] by fetching one cached fragment
//! per step and merging them in execution order:
//!
//! 1. setup, when the transfer is the first or changes clock/word parameters
//! 2. data transfer, when the transfer moves bytes
//! 3. chip-select release (on `cs_change` or the last transfer), otherwise a
//!    delay when one is requested
//!
//! The shell's marker write follows, then the completion trigger when the
//! message carries a callback. Any failure returns every fragment fetched so
//! far to its cache.

use alloc::vec::Vec;

use crate::cache::FragmentCaches;
use crate::error::{Error, Result};
use crate::merged::MergedOp;
use crate::message::{Message, Transfer};
use crate::types::{AllocContext, CacheId};

/// Cache ids of every fragment kind an operation is built from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentSet {
    /// Shell with the completion marker
    pub merged: CacheId,
    /// Controller reprogramming
    pub setup: CacheId,
    /// Data phase
    pub transfer: CacheId,
    /// Chip-select release
    pub cs_deselect: CacheId,
    /// Inter-transfer delay
    pub delay: CacheId,
    /// Completion interrupt trigger
    pub trigger_irq: CacheId,
}

/// Compile `message` into a sealed operation ready for submission
pub fn compile(
    caches: &FragmentCaches,
    set: &FragmentSet,
    message: Message,
    alloc: AllocContext,
) -> Result<MergedOp> {
    if message.transfers().is_empty() {
        return Err(Error::InvalidParameter);
    }

    let shell = caches.fetch(set.merged, alloc)?;
    let mut op = MergedOp::new(shell, message);

    match build(caches, set, &mut op, alloc) {
        Ok(()) => Ok(op),
        Err(err) => {
            log::error!("compile failed: {}", err);
            op.dump();
            op.abandon(caches);
            Err(err)
        }
    }
}

fn build(
    caches: &FragmentCaches,
    set: &FragmentSet,
    op: &mut MergedOp,
    alloc: AllocContext,
) -> Result<()> {
    let transfers: Vec<Transfer> = op.message().transfers().to_vec();
    let last = transfers.len() - 1;
    let mut previous: Option<&Transfer> = None;

    for (index, transfer) in transfers.iter().enumerate() {
        let needs_setup = previous.map_or(true, |prev| transfer.needs_setup_after(prev));
        if needs_setup {
            op.merge(caches.fetch(set.setup, alloc)?, Some(index))?;
        }

        if transfer.len != 0 {
            op.merge(caches.fetch(set.transfer, alloc)?, Some(index))?;
        }

        if transfer.cs_change || index == last {
            op.merge(caches.fetch(set.cs_deselect, alloc)?, Some(index))?;
        } else if transfer.delay_usecs != 0 {
            op.merge(caches.fetch(set.delay, alloc)?, Some(index))?;
        }

        previous = Some(transfer);
    }

    op.append_marker()?;

    if op.message().has_callback() {
        op.merge(caches.fetch(set.trigger_irq, alloc)?, None)?;
    }

    op.seal()
}
