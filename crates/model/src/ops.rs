use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::block::Block;

/// A splice-style mutation of one block attribute.
///
/// If `inserted` is a JSON array, `delete_count` elements of the `entity`
/// attribute are replaced with the array's elements starting at `index`.
/// For any other value, `inserted` is assigned to the attribute and
/// `index`/`delete_count` are ignored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockOperation {
    pub entity: String,
    pub index: usize,
    pub delete_count: usize,
    pub inserted: Value,
}

impl BlockOperation {
    /// Splice `inserted` into the sequence attribute `entity`.
    pub fn splice(
        entity: impl Into<String>,
        index: usize,
        delete_count: usize,
        inserted: Vec<Value>,
    ) -> Self {
        Self {
            entity: entity.into(),
            index,
            delete_count,
            inserted: Value::Array(inserted),
        }
    }

    /// Assign `value` to the scalar attribute `entity`.
    pub fn assign(entity: impl Into<String>, value: Value) -> Self {
        Self {
            entity: entity.into(),
            index: 0,
            delete_count: 0,
            inserted: value,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum OperationError {
    #[error("block has no attribute `{entity}`")]
    MissingAttribute { entity: String },
    #[error("attribute `{entity}` is not a sequence")]
    NotASequence { entity: String },
    #[error("attribute `{entity}` is a sequence; assign would replace it wholesale")]
    NotAScalar { entity: String },
    #[error("update applied to an absent block")]
    MissingBlock,
}

/// Apply `op` to `block` in place.
///
/// Inserted values are deep-copied; the operation never aliases state into
/// the block. Operations must target existing attributes of the matching
/// kind, anything else is a programming error surfaced as [`OperationError`].
pub fn apply_operation(block: &mut Block, op: &BlockOperation) -> Result<(), OperationError> {
    let attr = block
        .attrs
        .get_mut(&op.entity)
        .ok_or_else(|| OperationError::MissingAttribute {
            entity: op.entity.clone(),
        })?;

    match &op.inserted {
        Value::Array(inserted) => {
            let Value::Array(target) = attr else {
                return Err(OperationError::NotASequence {
                    entity: op.entity.clone(),
                });
            };
            let start = op.index.min(target.len());
            let end = start.saturating_add(op.delete_count).min(target.len());
            target.splice(start..end, inserted.iter().cloned());
        }
        inserted => {
            if attr.is_array() {
                return Err(OperationError::NotAScalar {
                    entity: op.entity.clone(),
                });
            }
            *attr = inserted.clone();
        }
    }
    Ok(())
}

/// [`apply_operation`] on a copy, returning the new block.
pub fn with_operation(block: &Block, op: &BlockOperation) -> Result<Block, OperationError> {
    let mut block = block.clone();
    apply_operation(&mut block, op)?;
    Ok(block)
}
