//! Raw key/value storage under a per-block prefix.
//!
//! Paths are forward-slash-separated relative names such as
//! `<blockId>/pend/<trxId>.json`. This is mainly an internal trait to allow
//! testing against an in-memory representation alongside the filesystem
//! backend.

use std::io;

use async_trait::async_trait;

mod fs;
mod mem;

pub use fs::Fs;
pub use mem::Memory;

#[async_trait]
pub trait RawStorage: Send + Sync {
    /// The bytes stored under `path`, or `None` if absent.
    async fn read(&self, path: &str) -> io::Result<Option<Vec<u8>>>;

    /// Store `bytes` under `path`, atomically replacing any prior content.
    /// Parent "directories" spring into existence as needed.
    async fn write(&self, path: &str, bytes: &[u8]) -> io::Result<()>;

    /// Remove `path`. Removing an absent path is not an error.
    async fn delete(&self, path: &str) -> io::Result<()>;

    /// The file names (not full paths) directly under the directory
    /// `prefix`, in unspecified order. An absent directory lists as empty.
    async fn list(&self, prefix: &str) -> io::Result<Vec<String>>;
}
