//! Layered block access: the [`BlockSource`]/[`BlockStore`] traits, the
//! change-tracking [`Tracker`] with its all-or-nothing [`Atomic`] staging
//! area, and the read-through [`CacheSource`].

mod cache;
mod error;
#[cfg(any(test, feature = "test"))]
pub mod memory;
mod source;
mod tracker;

pub use cache::CacheSource;
pub use error::SourceError;
pub use source::{BlockSource, BlockStore};
pub use tracker::{Atomic, Tracker};
