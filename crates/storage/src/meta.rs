use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tessera_model::{Block, BlockId, Rev, Transform, TrxId, TrxRev};

/// One contiguous span of locally materializable revisions. An open end
/// means "live through current".
pub type RevRange = (Rev, Option<Rev>);

/// Per-block bookkeeping stored at `<blockId>/meta.json`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockMetadata {
    pub ranges: Vec<RevRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest: Option<TrxRev>,
}

impl BlockMetadata {
    pub fn contains(&self, rev: Rev) -> bool {
        self.ranges
            .iter()
            .any(|(start, end)| *start <= rev && end.map_or(true, |end| rev <= end))
    }

    /// Merge `range` into `ranges`, coalescing overlapping or adjacent
    /// spans.
    pub fn merge_range(&mut self, range: RevRange) {
        self.ranges.push(range);
        self.ranges.sort_by_key(|(start, _)| *start);
        let mut merged: Vec<RevRange> = Vec::with_capacity(self.ranges.len());
        for (start, end) in self.ranges.drain(..) {
            match merged.last_mut() {
                Some((_, last_end)) if joins(*last_end, start) => {
                    *last_end = match (*last_end, end) {
                        (None, _) | (_, None) => None,
                        (Some(a), Some(b)) => Some(a.max(b)),
                    };
                }
                _ => merged.push((start, end)),
            }
        }
        self.ranges = merged;
    }
}

/// Whether a span ending at `end` touches or overlaps one starting at
/// `start`.
fn joins(end: Option<Rev>, start: Rev) -> bool {
    end.map_or(true, |end| start <= end.saturating_add(1))
}

/// The transaction recorded at one archived revision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveTrx {
    pub trx_id: TrxId,
    pub transform: Transform,
}

/// One archived revision: its transaction, and a materialized snapshot for
/// the archive's oldest revision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveRevision {
    pub trx: ArchiveTrx,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block: Option<Block>,
}

/// Restore payload for a span of one block's history.
///
/// The revision at the low end of `range` must carry a materialized block,
/// so the restored span can be replayed without any older state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockArchive {
    pub block_id: BlockId,
    pub revisions: BTreeMap<Rev, ArchiveRevision>,
    pub range: RevRange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<BTreeMap<TrxId, Transform>>,
}
