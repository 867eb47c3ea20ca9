//! Cluster coordination.
//!
//! Each block has a coordinator peer; the coordinator and a small set of
//! closest peers jointly commit operations on the block by circulating a
//! signed [`ClusterRecord`] through a two-phase promise/commit protocol.
//!
//! The crate has three faces:
//!
//! - [`NetworkTransactor`]: the client side used by collections. Batches
//!   block operations by coordinator peer, retries around failed peers and
//!   aggregates the replies into [`tessera_model::Transactor`] responses.
//! - [`ClusterCoordinator`] + [`ClusterMember`]: the serving side. Drives
//!   and participates in the promise/commit rounds, applying agreed
//!   operations to the local [`tessera_storage::StorageRepo`] exactly once.
//! - [`wire`]: the length-prefixed JSON framing of both protocols, with
//!   plain TCP implementations of the transport traits.

mod coordinator;
mod error;
mod keys;
mod member;
mod record;
mod transactor;
pub mod wire;

pub use coordinator::{spawn_timers, ClusterCoordinator, ClusterNetwork};
pub use error::ClusterError;
pub use keys::{verify_signature, Keypair};
pub use member::{ClusterMember, MemberOptions, RecordState};
pub use record::{
    ClusterMessage, ClusterPeers, ClusterRecord, PeerInfo, RepoOperation, Signature, SignaturePhase,
    SignatureType,
};
pub use transactor::{NetworkTransactor, PeerDirectory, RepoLink, TransactorOptions};
pub use wire::{RepoMessage, RepoReply, RepoResult};
