//! The transactor surface: what collections consume, and what both the
//! storage repo and the cluster coordinator implement.

use std::{collections::BTreeMap, fmt, io};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    block::Block,
    context::{Rev, TrxContext, TrxRev},
    ids::{BlockId, PeerId, TrxId},
    transform::{Transform, Transforms},
};

/// A boolean that (de)serializes only as the literal `B`.
///
/// Success and failure replies share no tag other than their `success`
/// field; pinning it to a literal keeps the untagged unions unambiguous.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Flag<const B: bool>;

impl<const B: bool> fmt::Debug for Flag<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", B)
    }
}

impl<const B: bool> Serialize for Flag<B> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bool(B)
    }
}

impl<'de, const B: bool> Deserialize<'de> for Flag<B> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if bool::deserialize(deserializer)? == B {
            Ok(Self)
        } else {
            Err(serde::de::Error::custom(format!("expected the literal {}", B)))
        }
    }
}

/// Options accompanying every outbound transactor call.
#[derive(Clone, Debug, Default)]
pub struct MessageOptions {
    /// Absolute deadline, milliseconds since the Unix epoch. A network leg
    /// that cannot complete by then fails with [`TransactorError::Expired`].
    pub expiration: Option<u64>,
    /// Cooperative cancellation of the in-flight call.
    pub signal: Option<CancellationToken>,
}

impl MessageOptions {
    pub fn with_expiration(expiration: u64) -> Self {
        Self {
            expiration: Some(expiration),
            ..Self::default()
        }
    }
}

/// Fetch blocks as of a transaction context.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetRequest {
    pub block_ids: Vec<BlockId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<TrxContext>,
}

/// Per-block state reported alongside a fetched block.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest: Option<TrxRev>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pendings: Vec<TrxId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockGetResult {
    /// Absent for a block that is deleted as of the requested revision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block: Option<Block>,
    pub state: BlockState,
}

pub type GetResponse = BTreeMap<BlockId, BlockGetResult>;

/// What `pend` does when a block already has pending transactions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendPolicy {
    /// Accumulate the pending info and proceed.
    #[serde(rename = "c")]
    Continue,
    /// Fail with `StaleFailure { pending }`.
    #[serde(rename = "f")]
    Fail,
    /// Fail, and include each pending transform in the failure.
    #[serde(rename = "r")]
    Return,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendRequest {
    pub transforms: Transforms,
    pub trx_id: TrxId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<Rev>,
    pub policy: PendPolicy,
}

/// A pending transaction observed on a block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTrx {
    pub block_id: BlockId,
    pub trx_id: TrxId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Transform>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendSuccess {
    pub success: Flag<true>,
    /// Pending transactions that existed on the touched blocks when this
    /// pend was accepted (policy `c` only; empty otherwise).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<PendingTrx>,
    pub block_ids: Vec<BlockId>,
}

/// A transaction the caller has not seen, reported by a peer that is ahead.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingTrx {
    pub trx_id: TrxId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<Rev>,
    pub transforms: Transforms,
}

/// The transactor refused an operation because the caller's view is stale.
///
/// Recoverable: the caller updates from the log (and backs off when
/// `pending` is set) before retrying.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
pub struct StaleFailure {
    pub success: Flag<false>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Transactions committed at or above the requested revision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing: Option<Vec<MissingTrx>>,
    /// Pending transactions that blocked the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<Vec<PendingTrx>>,
}

impl fmt::Display for StaleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stale")?;
        if let Some(missing) = &self.missing {
            write!(f, "; missing {} transaction(s)", missing.len())?;
        }
        if let Some(pending) = &self.pending {
            write!(f, "; blocked by {} pending transaction(s)", pending.len())?;
        }
        if let Some(reason) = &self.reason {
            write!(f, ": {reason}")?;
        }
        Ok(())
    }
}

impl StaleFailure {
    pub fn pending(pending: Vec<PendingTrx>) -> Self {
        Self {
            pending: Some(pending),
            ..Self::default()
        }
    }

    pub fn missing(missing: Vec<MissingTrx>) -> Self {
        Self {
            missing: Some(missing),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PendOutcome {
    Success(PendSuccess),
    Stale(StaleFailure),
}

impl PendOutcome {
    pub fn into_result(self) -> Result<PendSuccess, StaleFailure> {
        match self {
            Self::Success(success) => Ok(success),
            Self::Stale(stale) => Err(stale),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub block_ids: Vec<BlockId>,
    pub trx_id: TrxId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRequest {
    pub block_ids: Vec<BlockId>,
    pub trx_id: TrxId,
    pub rev: Rev,
    /// The log tail block; committed before any other block of the
    /// transaction.
    pub tail_id: BlockId,
    /// Set on the first commit of a new collection so the cluster creates
    /// the header atomically with it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_id: Option<BlockId>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitSuccess {
    pub success: Flag<true>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinator_id: Option<PeerId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommitOutcome {
    Success(CommitSuccess),
    Stale(StaleFailure),
}

impl CommitOutcome {
    pub fn into_result(self) -> Result<CommitSuccess, StaleFailure> {
        match self {
            Self::Success(success) => Ok(success),
            Self::Stale(stale) => Err(stale),
        }
    }
}

/// Non-stale transactor failures. Stale conditions travel inside
/// [`PendOutcome`]/[`CommitOutcome`]; everything here is either fatal or
/// retryable only by policy of the caller.
#[derive(Debug, thiserror::Error)]
pub enum TransactorError {
    #[error("deadline exceeded")]
    Expired,
    #[error("no pending transaction {trx_id} on block {block_id}")]
    MissingPending { block_id: BlockId, trx_id: TrxId },
    #[error("block {0} not found")]
    BlockNotFound(BlockId),
    #[error("no usable coordinator for block {0}")]
    CoordinatorNone(BlockId),
    #[error("cluster consensus failed: {0}")]
    ConsensusFailed(String),
    #[error("record signature invalid")]
    SignatureInvalid,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The transactor: layered block access with two-step pend/commit writes.
///
/// Implemented locally by the storage repo, and remotely by the cluster
/// coordinator client; collections are generic over which one they talk to.
#[async_trait]
pub trait Transactor: Send + Sync {
    async fn get(
        &self,
        request: GetRequest,
        options: &MessageOptions,
    ) -> Result<GetResponse, TransactorError>;

    async fn pend(
        &self,
        request: PendRequest,
        options: &MessageOptions,
    ) -> Result<PendOutcome, TransactorError>;

    async fn cancel(
        &self,
        request: CancelRequest,
        options: &MessageOptions,
    ) -> Result<(), TransactorError>;

    async fn commit(
        &self,
        request: CommitRequest,
        options: &MessageOptions,
    ) -> Result<CommitOutcome, TransactorError>;
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn outcomes_disambiguate_on_the_success_literal() {
        let success: PendOutcome = serde_json::from_value(json!({
            "success": true,
            "blockIds": ["a"],
        }))
        .unwrap();
        assert!(matches!(success, PendOutcome::Success(_)));

        let stale: PendOutcome = serde_json::from_value(json!({
            "success": false,
            "pending": [{"blockId": "a", "trxId": "t-t-t-t-t"}],
        }))
        .unwrap();
        let stale = match stale {
            PendOutcome::Stale(stale) => stale,
            other => panic!("expected stale, got {other:?}"),
        };
        assert_eq!(stale.pending.as_ref().map(Vec::len), Some(1));
    }

    #[test]
    fn stale_failure_wire_shape() {
        let stale = StaleFailure::missing(vec![MissingTrx {
            trx_id: TrxId::new("a-b-c-d-e"),
            rev: Some(3),
            transforms: Transforms::new(),
        }]);
        let encoded = serde_json::to_value(&stale).unwrap();
        assert_eq!(encoded["success"], json!(false));
        assert_eq!(encoded["missing"][0]["rev"], json!(3));
    }
}
