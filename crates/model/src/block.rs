use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{BlockId, CollectionId};

/// The kind of a block, e.g. a chain header vs. a chain data block.
///
/// Short opaque strings; applications register their own.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockType(String);

impl BlockType {
    pub fn new(t: impl Into<String>) -> Self {
        Self(t.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BlockType {
    fn from(t: &str) -> Self {
        Self(t.to_owned())
    }
}

/// The immutable part of a block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    pub id: BlockId,
    #[serde(rename = "type")]
    pub block_type: BlockType,
    pub collection_id: CollectionId,
}

/// A block: an immutable [`BlockHeader`] plus arbitrary JSON attributes.
///
/// Attributes are only ever mutated through [`crate::BlockOperation`]s; the
/// header is fixed at insert time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    #[serde(flatten)]
    pub attrs: Map<String, Value>,
}

impl Block {
    /// A block with the given header and no attributes.
    pub fn new(header: BlockHeader) -> Self {
        Self {
            header,
            attrs: Map::new(),
        }
    }

    /// A block with the given header and initial attributes.
    pub fn with_attrs(header: BlockHeader, attrs: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self {
            header,
            attrs: attrs.into_iter().collect(),
        }
    }

    pub fn id(&self) -> &BlockId {
        &self.header.id
    }

    pub fn attr(&self, name: &str) -> Option<&Value> {
        self.attrs.get(name)
    }
}
