//! Length-prefixed JSON framing for the repo and cluster protocols, plus
//! plain-TCP implementations of the transport traits.
//!
//! Each frame is one UTF-8 JSON document behind a length prefix
//! ([`tokio_util::codec::LengthDelimitedCodec`]). One response frame answers
//! each request frame.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use async_trait::async_trait;
use tessera_common::now_millis;
use tessera_model::{
    CommitOutcome, GetResponse, MessageOptions, PeerId, PendOutcome, Transactor, TransactorError,
};

use crate::{
    record::{ClusterRecord, PeerInfo, RepoOperation},
    ClusterError, ClusterMember, ClusterNetwork, RepoLink,
};

/// One request frame of the repo protocol.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoMessage {
    pub operations: Vec<RepoOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<u64>,
}

/// The outcome of one [`RepoOperation`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoResult {
    Get(GetResponse),
    Pend(PendOutcome),
    Cancel {},
    Commit(CommitOutcome),
    Error { message: String },
}

/// One response frame: a result per operation, in order.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoReply {
    pub results: Vec<RepoResult>,
}

pub type JsonFramed<S> = Framed<S, LengthDelimitedCodec>;

pub fn framed<S>(stream: S) -> JsonFramed<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite,
{
    Framed::new(stream, LengthDelimitedCodec::new())
}

pub async fn send_json<S, T>(framed: &mut JsonFramed<S>, value: &T) -> Result<(), ClusterError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(value)?;
    framed.send(bytes.into()).await?;
    Ok(())
}

pub async fn recv_json<S, T>(framed: &mut JsonFramed<S>) -> Result<Option<T>, ClusterError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    T: DeserializeOwned,
{
    match framed.next().await {
        None => Ok(None),
        Some(frame) => {
            let frame = frame?;
            Ok(Some(serde_json::from_slice(&frame)?))
        }
    }
}

/// Execute every operation of `message` against `transactor`, in order.
///
/// Operation-level failures become [`RepoResult::Error`] entries rather than
/// tearing down the connection.
pub async fn execute_message(transactor: &dyn Transactor, message: RepoMessage) -> RepoReply {
    let options = MessageOptions {
        expiration: message.expiration,
        signal: None,
    };
    let mut results = Vec::with_capacity(message.operations.len());
    for operation in message.operations {
        let result = match operation {
            RepoOperation::Get(request) => {
                transactor.get(request, &options).await.map(RepoResult::Get)
            }
            RepoOperation::Pend(request) => {
                transactor.pend(request, &options).await.map(RepoResult::Pend)
            }
            RepoOperation::Cancel(request) => transactor
                .cancel(request, &options)
                .await
                .map(|()| RepoResult::Cancel {}),
            RepoOperation::Commit(request) => {
                transactor.commit(request, &options).await.map(RepoResult::Commit)
            }
        };
        results.push(result.unwrap_or_else(|e| RepoResult::Error {
            message: e.to_string(),
        }));
    }
    RepoReply { results }
}

/// Serve the repo protocol on `listener`, executing requests against
/// `transactor`. Runs until the listener fails.
pub async fn serve_repo(
    listener: TcpListener,
    transactor: Arc<dyn Transactor>,
) -> std::io::Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        debug!("repo connection from {addr}");
        let transactor = Arc::clone(&transactor);
        tokio::spawn(async move {
            let mut framed = framed(stream);
            loop {
                match recv_json::<_, RepoMessage>(&mut framed).await {
                    Ok(Some(message)) => {
                        let reply = execute_message(transactor.as_ref(), message).await;
                        if let Err(e) = send_json(&mut framed, &reply).await {
                            warn!("repo reply to {addr} failed: {e}");
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("bad repo frame from {addr}: {e}");
                        break;
                    }
                }
            }
        });
    }
}

/// Serve the cluster record protocol on `listener`: each inbound frame is a
/// [`ClusterRecord`], answered with the member's merged view.
pub async fn serve_cluster(listener: TcpListener, member: Arc<ClusterMember>) -> std::io::Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        debug!("cluster connection from {addr}");
        let member = Arc::clone(&member);
        tokio::spawn(async move {
            let mut framed = framed(stream);
            loop {
                match recv_json::<_, ClusterRecord>(&mut framed).await {
                    Ok(Some(record)) => match member.update(record).await {
                        Ok(merged) => {
                            if let Err(e) = send_json(&mut framed, &merged).await {
                                warn!("cluster reply to {addr} failed: {e}");
                                break;
                            }
                        }
                        Err(e) => {
                            // Invalid records are dropped, not propagated.
                            warn!("cluster record from {addr} rejected: {e}");
                            break;
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!("bad cluster frame from {addr}: {e}");
                        break;
                    }
                }
            }
        });
    }
}

fn dial_addr(info: &PeerInfo) -> Result<&str, ClusterError> {
    info.multiaddr
        .first()
        .map(String::as_str)
        .ok_or_else(|| ClusterError::Protocol("peer has no address".into()))
}

async fn with_deadline<T>(
    expiration: Option<u64>,
    fut: impl std::future::Future<Output = Result<T, ClusterError>>,
) -> Result<T, ClusterError> {
    match expiration {
        None => fut.await,
        Some(expiration) => {
            let now = now_millis();
            if expiration <= now {
                return Err(ClusterError::Expired);
            }
            let remaining = std::time::Duration::from_millis(expiration - now);
            tokio::time::timeout(remaining, fut)
                .await
                .map_err(|_| ClusterError::Expired)?
        }
    }
}

/// [`RepoLink`] over plain TCP: one connection per request.
#[derive(Clone, Debug, Default)]
pub struct TcpRepoLink;

#[async_trait]
impl RepoLink for TcpRepoLink {
    async fn send(
        &self,
        peer: &PeerId,
        info: &PeerInfo,
        message: RepoMessage,
    ) -> Result<RepoReply, ClusterError> {
        let addr = dial_addr(info)?.to_owned();
        let expiration = message.expiration;
        with_deadline(expiration, async move {
            let stream = TcpStream::connect(&addr)
                .await
                .map_err(|e| ClusterError::Unreachable(peer.clone(), e.to_string()))?;
            let mut framed = framed(stream);
            send_json(&mut framed, &message).await?;
            recv_json(&mut framed)
                .await?
                .ok_or_else(|| ClusterError::Unreachable(peer.clone(), "connection closed".into()))
        })
        .await
    }
}

/// [`ClusterNetwork`] over plain TCP: one connection per record update.
#[derive(Clone, Debug, Default)]
pub struct TcpClusterNetwork;

#[async_trait]
impl ClusterNetwork for TcpClusterNetwork {
    async fn update(
        &self,
        peer: &PeerId,
        info: &PeerInfo,
        record: ClusterRecord,
    ) -> Result<ClusterRecord, ClusterError> {
        let addr = dial_addr(info)?.to_owned();
        let expiration = record.message.expiration;
        with_deadline(Some(expiration), async move {
            let stream = TcpStream::connect(&addr)
                .await
                .map_err(|e| ClusterError::Unreachable(peer.clone(), e.to_string()))?;
            let mut framed = framed(stream);
            send_json(&mut framed, &record).await?;
            recv_json(&mut framed)
                .await?
                .ok_or_else(|| ClusterError::Unreachable(peer.clone(), "connection closed".into()))
        })
        .await
    }
}

impl RepoResult {
    /// Surface a server-side `error` result as a transactor error.
    pub fn into_result(self) -> Result<RepoResult, TransactorError> {
        match self {
            RepoResult::Error { message } => Err(TransactorError::Protocol(message)),
            other => Ok(other),
        }
    }
}
