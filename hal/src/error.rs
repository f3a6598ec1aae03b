//! # HAL Errors

use core::fmt;

/// HAL result type alias
pub type Result<T> = core::result::Result<T, HalError>;

/// Errors raised by the DMA pool and channel layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum HalError {
    /// No free block left in the pool
    PoolExhausted,
    /// Handle does not name a block of this pool
    InvalidBlock,
    /// Block was already free
    DoubleFree,
    /// Word index outside the block
    OutOfBounds,
    /// Address or size violates the required alignment
    Misaligned,
    /// Pool or channel configuration is unusable
    InvalidConfig,
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PoolExhausted => write!(f, "DMA pool exhausted"),
            Self::InvalidBlock => write!(f, "invalid DMA block handle"),
            Self::DoubleFree => write!(f, "DMA block freed twice"),
            Self::OutOfBounds => write!(f, "word index out of block bounds"),
            Self::Misaligned => write!(f, "misaligned DMA address or size"),
            Self::InvalidConfig => write!(f, "invalid DMA configuration"),
        }
    }
}
