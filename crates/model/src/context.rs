use serde::{Deserialize, Serialize};

use crate::ids::TrxId;

/// A revision number within one collection's log. Strictly monotonic,
/// starting at 1; 0 denotes "before any revision".
pub type Rev = u64;

/// A committed transaction and the revision it produced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrxRev {
    pub trx_id: TrxId,
    pub rev: Rev,
}

/// The reader's view of which revisions are visible when fetching blocks.
///
/// `committed` lists the transactions the reader already knows to have
/// committed; a storage peer that is behind catches up to them before
/// serving a read. When `trx_id` is set, the reader additionally wants that
/// pending transaction overlaid on the result.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrxContext {
    pub committed: Vec<TrxRev>,
    pub rev: Rev,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trx_id: Option<TrxId>,
}

impl TrxContext {
    pub fn new(committed: Vec<TrxRev>, rev: Rev) -> Self {
        Self {
            committed,
            rev,
            trx_id: None,
        }
    }
}
