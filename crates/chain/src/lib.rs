//! Chains and logs.
//!
//! A [`Chain`] is a doubly-linked list of fixed-capacity entry blocks that
//! live as ordinary blocks inside a [`tessera_source::BlockStore`], so every
//! chain mutation is staged and committed like any other block change. A
//! [`Log`] is a typed chain of action/checkpoint entries whose data blocks
//! carry cryptographic back-links to their predecessors.

mod blocks;
mod chain;
mod error;
mod log;

pub use crate::log::{
    log_chain_options, ActionEntry, CheckpointEntry, Log, LogCursor, LogEntry, LogRead,
};
pub use blocks::DEFAULT_ENTRIES_PER_BLOCK;
pub use chain::{AddPlan, BlockAddedHook, Chain, ChainCursor, ChainOptions, Path};
pub use error::ChainError;
