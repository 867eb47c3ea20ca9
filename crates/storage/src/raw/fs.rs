use std::{io, path::PathBuf};

use async_trait::async_trait;
use log::debug;
use tokio::{fs, io::AsyncWriteExt};

use super::RawStorage;

/// A [`RawStorage`] which stores documents as ordinary files under a root
/// directory.
///
/// Writes go through a `.tmp` sibling and a rename, so readers never observe
/// a partially written document.
#[derive(Clone, Debug)]
pub struct Fs {
    root: PathBuf,
}

impl Fs {
    /// Open (and create if needed) a storage root.
    pub async fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn full_path(&self, path: &str) -> PathBuf {
        let mut full = self.root.clone();
        full.extend(path.split('/'));
        full
    }
}

#[async_trait]
impl RawStorage for Fs {
    async fn read(&self, path: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.full_path(path)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write(&self, path: &str, bytes: &[u8]) -> io::Result<()> {
        let full = self.full_path(path);
        let parent = full
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
        fs::create_dir_all(parent).await?;

        let tmp = full.with_extension("tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_data().await?;
        drop(file);
        fs::rename(&tmp, &full).await
    }

    async fn delete(&self, path: &str) -> io::Result<()> {
        match fs::remove_file(self.full_path(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("delete of absent path {path}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn list(&self, prefix: &str) -> io::Result<Vec<String>> {
        let dir = self.full_path(prefix);
        let mut entries = Vec::new();
        let mut reader = match fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e),
        };
        while let Some(entry) = reader.next_entry().await? {
            if entry.file_type().await?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    // Skip in-flight temporaries.
                    if !name.ends_with(".tmp") {
                        entries.push(name.to_owned());
                    }
                }
            }
        }
        Ok(entries)
    }
}
