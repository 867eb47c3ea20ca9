use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tessera_model::{Block, BlockType, CollectionId};
use tessera_source::BlockStore;

use crate::CollectionError;

/// A unit of logical work against a collection: a short type tag dispatched
/// to a registered handler, and an arbitrary payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub data: Value,
}

impl Action {
    pub fn new(action_type: impl Into<String>, data: Value) -> Self {
        Self {
            action_type: action_type.into(),
            data,
        }
    }
}

/// Applies one action's block mutations through the store it is given.
///
/// Handlers run inside an atomic staging area: either every mutation of an
/// `act` call lands, or none do.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, action: &Action, store: &dyn BlockStore) -> Result<(), CollectionError>;
}

/// Decides the fate of a local pending action when remote actions touched
/// overlapping state: keep it, substitute a replacement, or drop it.
pub trait ConflictFilter: Send + Sync {
    fn filter(&self, pending: &Action, remote: &[Action]) -> Option<Action>;
}

/// The do-nothing conflict policy: local pending actions are kept and
/// replayed as-is.
pub struct KeepOriginal;

impl ConflictFilter for KeepOriginal {
    fn filter(&self, pending: &Action, _remote: &[Action]) -> Option<Action> {
        Some(pending.clone())
    }
}

/// Synthesizes the header block when a collection is opened for the first
/// time.
pub trait CollectionHeader: Send + Sync {
    /// The header block must carry null `headId`/`tailId` attributes; the
    /// log chain fills them in when it initializes.
    fn create_header_block(&self, id: &CollectionId, store: &dyn BlockStore) -> Block;
}

/// A plain header block with the given type and the chain pointer
/// placeholders.
pub struct DefaultHeader {
    pub header_type: BlockType,
}

impl CollectionHeader for DefaultHeader {
    fn create_header_block(&self, id: &CollectionId, store: &dyn BlockStore) -> Block {
        let header = store.create_block_header(self.header_type.clone(), Some(id.header_block_id()));
        Block::with_attrs(
            header,
            [
                ("headId".to_owned(), Value::Null),
                ("tailId".to_owned(), Value::Null),
            ],
        )
    }
}
