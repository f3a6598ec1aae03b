//! # Engine Types
//!
//! Identifiers and small value types shared by every engine module.

use core::fmt;

// =============================================================================
// ALLOCATION CONTEXT
// =============================================================================

/// Whether the caller may block while memory is found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocContext {
    /// Process context; may sleep, caches may grow ahead of demand
    Blocking,
    /// Interrupt or atomic context; never blocks
    Atomic,
}

impl AllocContext {
    /// Check if blocking is allowed
    #[inline]
    pub const fn may_block(self) -> bool {
        matches!(self, Self::Blocking)
    }
}

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Identifies a fragment cache inside a [`crate::FragmentCaches`] registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheId(u16);

impl CacheId {
    pub(crate) const fn new(index: u16) -> Self {
        Self(index)
    }

    /// Registry index
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Identifies a fragment within its cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FragmentId(u32);

impl FragmentId {
    /// Id of a fragment not (yet) owned by a cache
    pub const UNOWNED: Self = Self(0);

    pub(crate) const fn new(serial: u32) -> Self {
        Self(serial)
    }

    /// Raw serial
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// Handle to a compiled operation held by the scheduler.
///
/// The generation makes handles of released operations detectably stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId {
    index: u32,
    generation: u32,
}

impl OpId {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index
    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Slot generation
    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}.{}", self.index, self.generation)
    }
}

// =============================================================================
// INTERRUPT OUTCOME
// =============================================================================

/// Result of one completion-interrupt pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqOutcome {
    /// This many operations were released
    Released(usize),
    /// Operations are queued but the head is not finished yet
    Pending,
    /// Nothing was queued
    Spurious,
}

impl IrqOutcome {
    /// Number of operations released
    pub const fn released(self) -> usize {
        match self {
            Self::Released(count) => count,
            _ => 0,
        }
    }
}
