//! # DMA Chain Core
//!
//! The chained command-block engine: operations are compiled from cached,
//! prebuilt control-block fragments, spliced onto the running DMA chain and
//! released in FIFO order once the hardware proves they finished.
//!
//! ## Components
//!
//! - **Link**: one control block in pool memory ([`DmaLink`])
//! - **Transform**: deferred patch of a fragment ([`Transform`])
//! - **Fragment**: prebuilt block chain plus transforms ([`Fragment`])
//! - **Fragment Cache**: per-kind pool of idle fragments ([`FragmentCache`])
//! - **Merged Operation**: one message as one chain ([`MergedOp`])
//! - **Compiler**: message to merged operation ([`compile`])
//! - **Scheduler**: submission queue with live splicing ([`Scheduler`])
//! - **Completion Engine**: interrupt-driven release
//!   ([`Scheduler::handle_interrupt`])
//!
//! ## Contexts
//!
//! ```text
//! submit context                     interrupt context
//! ──────────────                     ─────────────────
//! compile ──► register ──► submit    handle_interrupt
//!                            │          │
//!                            ▼          ▼
//!                    ┌────────────────────────┐
//!                    │ IrqMutex<QueueState>   │
//!                    └────────────────────────┘
//! ```
//!
//! Critical sections only move queue entries and link words; transforms,
//! fragment returns and callbacks run outside the lock.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod cache;
pub mod compiler;
pub mod completion;
pub mod error;
pub mod fragment;
pub mod link;
pub mod merged;
pub mod message;
pub mod observer;
pub mod scheduler;
pub mod transform;
pub mod types;

pub use cache::{CacheStats, FragmentCache, FragmentCaches, FragmentFactory};
pub use compiler::{compile, FragmentSet};
pub use error::{Error, Fault, Result};
pub use fragment::Fragment;
pub use link::DmaLink;
pub use merged::{build_shell, build_trigger, shell_factory, trigger_factory, MergedOp, OpStatus};
pub use message::{Completion, CompletionFn, Message, SpiDevice, Transfer};
pub use observer::{DebugFlags, DebugObserver, EngineObserver, EngineStats, StatsSnapshot};
pub use scheduler::Scheduler;
pub use transform::{Operand, Stage, Transform, TransformCtx, TransformFn};
pub use types::{AllocContext, CacheId, FragmentId, IrqOutcome, OpId};
