use std::{collections::BTreeMap, io, sync::Arc};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::RawStorage;

/// In-memory implementation of [`RawStorage`].
///
/// Clones share the same underlying map, mirroring how filesystem handles
/// share the same directory.
#[derive(Clone, Debug, Default)]
pub struct Memory {
    inner: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents, across all prefixes.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[async_trait]
impl RawStorage for Memory {
    async fn read(&self, path: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.inner.read().get(path).cloned())
    }

    async fn write(&self, path: &str, bytes: &[u8]) -> io::Result<()> {
        self.inner.write().insert(path.to_owned(), bytes.to_vec());
        Ok(())
    }

    async fn delete(&self, path: &str) -> io::Result<()> {
        self.inner.write().remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> io::Result<Vec<String>> {
        let dir = format!("{}/", prefix.trim_end_matches('/'));
        let inner = self.inner.read();
        Ok(inner
            .range(dir.clone()..)
            .take_while(|(path, _)| path.starts_with(&dir))
            .filter_map(|(path, _)| {
                let rest = &path[dir.len()..];
                // Only direct children; nested paths belong to other listings.
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_owned())
            })
            .collect())
    }
}
