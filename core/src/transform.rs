//! # Transforms
//!
//! A transform patches a fragment's control blocks (or the operation's
//! status) for one specific use. Pre-transforms run before the chain is
//! published to hardware, post-transforms after completion is proven.
//!
//! Operands are typed: a literal value, a word of one of the owning
//! fragment's blocks, or the bus address of such a word.

use core::fmt;

use dmachain_hal::BusAddr;

use crate::error::{Error, Result};
use crate::link::DmaLink;
use crate::merged::OpStatus;
use crate::message::{Message, Transfer};

// =============================================================================
// OPERANDS
// =============================================================================

/// Source / destination of a transform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Operand {
    /// Unused
    #[default]
    None,
    /// Literal value
    Value(u32),
    /// Word `word` of the owning fragment's link `link`
    Word {
        /// Link index inside the fragment
        link: usize,
        /// Word index inside the block
        word: usize,
    },
    /// Bus address of word `word` of link `link`
    Bus {
        /// Link index inside the fragment
        link: usize,
        /// Word index inside the block
        word: usize,
    },
}

impl Operand {
    /// Shorthand for [`Operand::Word`]
    pub const fn word(link: usize, word: usize) -> Self {
        Self::Word { link, word }
    }

    /// Current value of the operand
    pub fn load(&self, ctx: &TransformCtx<'_>) -> Result<u32> {
        match *self {
            Self::None => Err(Error::Transform("missing operand")),
            Self::Value(value) => Ok(value),
            Self::Word { link, word } => ctx.link(link)?.read(word),
            Self::Bus { link, word } => Ok(ctx.link(link)?.word_bus(word).raw()),
        }
    }

    /// Store `value` into the operand (only words are writable)
    pub fn store(&self, ctx: &TransformCtx<'_>, value: u32) -> Result<()> {
        match *self {
            Self::Word { link, word } => ctx.link(link)?.write(word, value),
            _ => Err(Error::Transform("operand is not writable")),
        }
    }
}

// =============================================================================
// CONTEXT
// =============================================================================

/// Everything a transform may look at or change
pub struct TransformCtx<'a> {
    /// Blocks of the fragment that owns the transform
    pub links: &'a [DmaLink],
    /// The message being executed
    pub message: &'a Message,
    /// The descriptor the fragment was merged for, if any
    pub transfer: Option<&'a Transfer>,
    /// Bus address of the operation's completion marker
    pub marker: BusAddr,
    /// Mutable operation status
    pub status: &'a mut OpStatus,
}

impl<'a> TransformCtx<'a> {
    /// Link `index` of the owning fragment
    pub fn link(&self, index: usize) -> Result<&'a DmaLink> {
        self.links
            .get(index)
            .ok_or(Error::Transform("link index out of range"))
    }

    /// The descriptor, or an error for fragments merged without one
    pub fn require_transfer(&self) -> Result<&'a Transfer> {
        self.transfer.ok_or(Error::Transform("no transfer bound"))
    }
}

impl fmt::Debug for TransformCtx<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformCtx")
            .field("links", &self.links.len())
            .field("transfer", &self.transfer)
            .field("marker", &self.marker)
            .finish()
    }
}

// =============================================================================
// TRANSFORM
// =============================================================================

/// When a transform runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Before the chain is handed to hardware
    Pre,
    /// After the completion marker proves the chain ran
    Post,
}

/// Transform function
pub type TransformFn = fn(&Transform, &mut TransformCtx<'_>) -> Result<()>;

/// A deferred patch attached to a fragment
#[derive(Debug, Clone, Copy)]
pub struct Transform {
    /// Pre or post execution
    pub stage: Stage,
    /// What to run
    pub function: TransformFn,
    /// Name for dumps
    pub name: &'static str,
    /// Source operand
    pub src: Operand,
    /// Destination operand
    pub dst: Operand,
    /// Extra operand
    pub extra: Operand,
}

impl Transform {
    /// A transform with no operands
    pub const fn new(stage: Stage, name: &'static str, function: TransformFn) -> Self {
        Self {
            stage,
            function,
            name,
            src: Operand::None,
            dst: Operand::None,
            extra: Operand::None,
        }
    }

    /// Pre-transform with no operands
    pub const fn pre(name: &'static str, function: TransformFn) -> Self {
        Self::new(Stage::Pre, name, function)
    }

    /// Post-transform with no operands
    pub const fn post(name: &'static str, function: TransformFn) -> Self {
        Self::new(Stage::Post, name, function)
    }

    /// Set the source operand
    pub const fn with_src(mut self, src: Operand) -> Self {
        self.src = src;
        self
    }

    /// Set the destination operand
    pub const fn with_dst(mut self, dst: Operand) -> Self {
        self.dst = dst;
        self
    }

    /// Set the extra operand
    pub const fn with_extra(mut self, extra: Operand) -> Self {
        self.extra = extra;
        self
    }

    /// Store a constant into a block word
    pub const fn write_u32(stage: Stage, dst: Operand, value: u32) -> Self {
        Self::new(stage, "write_u32", write_u32)
            .with_src(Operand::Value(value))
            .with_dst(dst)
    }

    /// Copy one block word (or word address) into another
    pub const fn copy_u32(stage: Stage, src: Operand, dst: Operand) -> Self {
        Self::new(stage, "copy_u32", copy_u32).with_src(src).with_dst(dst)
    }

    /// Run the transform
    #[inline]
    pub fn apply(&self, ctx: &mut TransformCtx<'_>) -> Result<()> {
        (self.function)(self, ctx)
    }
}

// =============================================================================
// BUILT-IN FUNCTIONS
// =============================================================================

/// `dst = src` where `src` is a literal
pub fn write_u32(t: &Transform, ctx: &mut TransformCtx<'_>) -> Result<()> {
    let Operand::Value(value) = t.src else {
        return Err(Error::Transform("write_u32 needs a literal source"));
    };
    t.dst.store(ctx, value)
}

/// `dst = *src` where `src` is a block word or a word address
pub fn copy_u32(t: &Transform, ctx: &mut TransformCtx<'_>) -> Result<()> {
    if matches!(t.src, Operand::Value(_) | Operand::None) {
        return Err(Error::Transform("copy_u32 needs a word source"));
    }
    let value = t.src.load(ctx)?;
    t.dst.store(ctx, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SpiDevice;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use dmachain_hal::{DmaPool, PoolConfig};

    fn links(count: usize) -> Vec<DmaLink> {
        let pool = Arc::new(
            DmaPool::new(PoolConfig::control_blocks(BusAddr::new(0xC000_0000), 4)).unwrap(),
        );
        (0..count).map(|_| DmaLink::allocate(&pool, "t").unwrap()).collect()
    }

    #[test]
    fn test_write_and_copy() {
        let links = links(2);
        let message = Message::new(SpiDevice::default());
        let mut status = OpStatus::default();
        let mut ctx = TransformCtx {
            links: &links,
            message: &message,
            transfer: None,
            marker: BusAddr::null(),
            status: &mut status,
        };

        Transform::write_u32(Stage::Pre, Operand::word(0, 3), 64).apply(&mut ctx).unwrap();
        Transform::copy_u32(Stage::Pre, Operand::word(0, 3), Operand::word(1, 3))
            .apply(&mut ctx)
            .unwrap();
        Transform::copy_u32(Stage::Pre, Operand::Bus { link: 1, word: 6 }, Operand::word(1, 1))
            .apply(&mut ctx)
            .unwrap();

        assert_eq!(links[1].read(3).unwrap(), 64);
        assert_eq!(links[1].read(1).unwrap(), links[1].word_bus(6).raw());
    }

    #[test]
    fn test_bad_operands_are_errors() {
        let links = links(1);
        let message = Message::new(SpiDevice::default());
        let mut status = OpStatus::default();
        let mut ctx = TransformCtx {
            links: &links,
            message: &message,
            transfer: None,
            marker: BusAddr::null(),
            status: &mut status,
        };

        let to_literal = Transform::write_u32(Stage::Pre, Operand::Value(1), 2);
        assert!(matches!(to_literal.apply(&mut ctx), Err(Error::Transform(_))));
        let out_of_range = Transform::write_u32(Stage::Pre, Operand::word(4, 0), 2);
        assert!(matches!(out_of_range.apply(&mut ctx), Err(Error::Transform(_))));
        assert!(ctx.require_transfer().is_err());
    }
}
