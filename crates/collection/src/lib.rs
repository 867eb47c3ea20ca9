//! Collections group blocks under a shared transactional boundary.
//!
//! A [`Collection`] applies actions locally through registered handlers
//! ([`Collection::act`]), absorbs remote history from the collection's log
//! ([`Collection::update`]) and pushes local changes to the cluster with
//! conflict-driven replay ([`Collection::sync`]).

mod action;
mod collection;
mod error;
mod source;

pub use action::{
    Action, ActionHandler, CollectionHeader, ConflictFilter, DefaultHeader, KeepOriginal,
};
pub use collection::{ActionCursor, Collection, CollectionInit, CollectionOptions};
pub use error::CollectionError;
pub use source::TransactorSource;
