use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{
    block::Block,
    ids::BlockId,
    ops::{apply_operation, BlockOperation, OperationError},
};

/// Aggregate mutations over a set of blocks.
///
/// Per block, the effective order is insert, then updates, then delete; a
/// block listed in `deletes` is absent no matter what else mentions it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Transforms {
    pub inserts: BTreeMap<BlockId, Block>,
    pub updates: BTreeMap<BlockId, Vec<BlockOperation>>,
    pub deletes: BTreeSet<BlockId>,
}

impl Transforms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// The projection of a [`Transforms`] onto a single block.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insert: Option<Block>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updates: Vec<BlockOperation>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub delete: bool,
}

impl Transform {
    pub fn is_empty(&self) -> bool {
        self.insert.is_none() && self.updates.is_empty() && !self.delete
    }
}

/// The union of the insert, update and delete domains of `transforms`.
pub fn block_ids_for_transforms(transforms: &Transforms) -> BTreeSet<BlockId> {
    transforms
        .inserts
        .keys()
        .chain(transforms.updates.keys())
        .chain(transforms.deletes.iter())
        .cloned()
        .collect()
}

/// Merge `later` into `into` by per-field union: later inserts win, updates
/// concatenate in order, deletes accumulate.
pub fn merge_transforms(into: &mut Transforms, later: Transforms) {
    into.inserts.extend(later.inserts);
    for (block_id, ops) in later.updates {
        into.updates.entry(block_id).or_default().extend(ops);
    }
    into.deletes.extend(later.deletes);
}

/// Project `transforms` onto `block_id`.
pub fn transform_for_block_id(transforms: &Transforms, block_id: &BlockId) -> Transform {
    Transform {
        insert: transforms.inserts.get(block_id).cloned(),
        updates: transforms.updates.get(block_id).cloned().unwrap_or_default(),
        delete: transforms.deletes.contains(block_id),
    }
}

/// Lift a single-block `transform` back into an aggregate keyed by `block_id`.
pub fn transforms_from_transform(transform: Transform, block_id: BlockId) -> Transforms {
    let mut transforms = Transforms::new();
    if let Some(block) = transform.insert {
        transforms.inserts.insert(block_id.clone(), block);
    }
    if !transform.updates.is_empty() {
        transforms.updates.insert(block_id.clone(), transform.updates);
    }
    if transform.delete {
        transforms.deletes.insert(block_id);
    }
    transforms
}

/// Apply a single-block `transform` to `base`, in insert → updates → delete
/// order. Returns the resulting block, or `None` for a deleted block.
pub fn apply_transform(
    base: Option<Block>,
    transform: &Transform,
) -> Result<Option<Block>, OperationError> {
    let mut block = transform.insert.clone().or(base);
    if !transform.updates.is_empty() {
        let block = block.as_mut().ok_or(OperationError::MissingBlock)?;
        for op in &transform.updates {
            apply_operation(block, op)?;
        }
    }
    Ok(if transform.delete { None } else { block })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::{BlockHeader, BlockType, CollectionId};

    use super::*;

    fn block(id: &str, value: i64) -> Block {
        Block::with_attrs(
            BlockHeader {
                id: BlockId::new(id),
                block_type: BlockType::new("T"),
                collection_id: CollectionId::new("C"),
            },
            [("value".to_owned(), json!(value))],
        )
    }

    fn sample() -> Transforms {
        let mut t = Transforms::new();
        t.inserts.insert(BlockId::new("a"), block("a", 1));
        t.updates
            .insert(BlockId::new("b"), vec![BlockOperation::assign("value", json!(2))]);
        t.deletes.insert(BlockId::new("c"));
        t
    }

    #[test]
    fn block_ids_cover_all_three_domains() {
        let ids = block_ids_for_transforms(&sample());
        assert_eq!(
            ids,
            [BlockId::new("a"), BlockId::new("b"), BlockId::new("c")].into()
        );
    }

    #[test]
    fn projection_roundtrips() {
        let t = sample();
        for id in block_ids_for_transforms(&t) {
            let single = transform_for_block_id(&t, &id);
            let lifted = transforms_from_transform(single.clone(), id.clone());
            assert_eq!(transform_for_block_id(&lifted, &id), single);
        }
    }

    #[test]
    fn merge_later_wins_for_inserts_and_concatenates_updates() {
        let mut t = sample();
        let mut u = Transforms::new();
        u.inserts.insert(BlockId::new("a"), block("a", 9));
        u.updates
            .insert(BlockId::new("b"), vec![BlockOperation::assign("value", json!(3))]);
        merge_transforms(&mut t, u);

        assert_eq!(t.inserts[&BlockId::new("a")].attr("value"), Some(&json!(9)));
        assert_eq!(t.updates[&BlockId::new("b")].len(), 2);
        assert!(t.deletes.contains(&BlockId::new("c")));
    }

    #[test]
    fn delete_wins_over_insert_and_updates() {
        let transform = Transform {
            insert: Some(block("a", 1)),
            updates: vec![BlockOperation::assign("value", json!(2))],
            delete: true,
        };
        assert_eq!(apply_transform(None, &transform).unwrap(), None);
    }

    #[test]
    fn apply_runs_insert_then_updates() {
        let transform = Transform {
            insert: Some(block("a", 1)),
            updates: vec![BlockOperation::assign("value", json!(2))],
            delete: false,
        };
        let out = apply_transform(None, &transform).unwrap().unwrap();
        assert_eq!(out.attr("value"), Some(&json!(2)));
    }

    #[test]
    fn updates_without_a_block_are_an_error() {
        let transform = Transform {
            insert: None,
            updates: vec![BlockOperation::assign("value", json!(2))],
            delete: false,
        };
        assert_eq!(
            apply_transform(None, &transform),
            Err(OperationError::MissingBlock)
        );
    }

    #[test]
    fn empty_transform_serializes_to_an_empty_object() {
        assert_eq!(
            serde_json::to_value(Transform::default()).unwrap(),
            json!({})
        );
    }

    // Applying a merged pair of transforms equals applying them one after
    // the other, for components that do not collide under the
    // insert → update → delete ordering.
    #[test]
    fn merged_application_equals_sequential_application() {
        let id = BlockId::new("a");
        let first = Transform {
            insert: Some(block("a", 0)),
            updates: vec![BlockOperation::assign("value", json!(1))],
            delete: false,
        };
        let second = Transform {
            insert: None,
            updates: vec![
                BlockOperation::assign("value", json!(2)),
                BlockOperation::assign("value", json!(3)),
            ],
            delete: false,
        };

        let mut merged = transforms_from_transform(first.clone(), id.clone());
        merge_transforms(&mut merged, transforms_from_transform(second.clone(), id.clone()));

        let sequential = apply_transform(apply_transform(None, &first).unwrap(), &second).unwrap();
        let at_once = apply_transform(None, &transform_for_block_id(&merged, &id)).unwrap();
        assert_eq!(sequential, at_once);
        assert_eq!(at_once.unwrap().attr("value"), Some(&json!(3)));
    }
}
