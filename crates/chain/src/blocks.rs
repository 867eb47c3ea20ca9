//! Attribute schema of chain header and data blocks.
//!
//! Chain blocks are ordinary blocks; these helpers read and build their
//! well-known attributes.

use serde_json::{json, Value};
use tessera_model::{Block, BlockHeader, BlockId};

use crate::ChainError;

pub const DEFAULT_ENTRIES_PER_BLOCK: usize = 32;

pub(crate) const HEAD_ID: &str = "headId";
pub(crate) const TAIL_ID: &str = "tailId";
pub(crate) const ENTRIES: &str = "entries";
pub(crate) const PRIOR_ID: &str = "priorId";
pub(crate) const NEXT_ID: &str = "nextId";
pub(crate) const PRIOR_HASH: &str = "priorHash";

/// A header block pointing at the single initial data block.
pub(crate) fn new_header_block(header: BlockHeader, head_and_tail: &BlockId) -> Block {
    Block::with_attrs(
        header,
        [
            (HEAD_ID.to_owned(), json!(head_and_tail.as_str())),
            (TAIL_ID.to_owned(), json!(head_and_tail.as_str())),
        ],
    )
}

/// A data block holding `entries`, linked back to `prior_id`.
///
/// `prior_hash` is filled in by the chain's block-added hook, if any.
pub(crate) fn new_data_block(header: BlockHeader, entries: Vec<Value>, prior_id: Option<&BlockId>) -> Block {
    Block::with_attrs(
        header,
        [
            (ENTRIES.to_owned(), Value::Array(entries)),
            (
                PRIOR_ID.to_owned(),
                prior_id.map(|id| json!(id.as_str())).unwrap_or(Value::Null),
            ),
            (NEXT_ID.to_owned(), Value::Null),
            (PRIOR_HASH.to_owned(), Value::Null),
        ],
    )
}

pub(crate) fn req_id(block: &Block, attr: &str) -> Result<BlockId, ChainError> {
    opt_id(block, attr)?.ok_or_else(|| ChainError::corrupt(block.id(), format!("missing `{attr}`")))
}

pub(crate) fn opt_id(block: &Block, attr: &str) -> Result<Option<BlockId>, ChainError> {
    match block.attr(attr) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(id)) => Ok(Some(BlockId::new(id.clone()))),
        Some(_) => Err(ChainError::corrupt(block.id(), format!("`{attr}` is not an id"))),
    }
}

pub(crate) fn opt_string(block: &Block, attr: &str) -> Result<Option<String>, ChainError> {
    match block.attr(attr) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ChainError::corrupt(block.id(), format!("`{attr}` is not a string"))),
    }
}

pub(crate) fn entries_array(block: &Block) -> Result<&Vec<Value>, ChainError> {
    match block.attr(ENTRIES) {
        Some(Value::Array(entries)) => Ok(entries),
        _ => Err(ChainError::corrupt(block.id(), "missing `entries` sequence")),
    }
}
