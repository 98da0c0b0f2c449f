// Write-once caches for descriptor files and poster images, keyed by content hash.

use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::DESCRIPTOR_EXTENSION;
use crate::error::{ControllerError, Result};

fn persistence(path: &Path) -> impl FnOnce(std::io::Error) -> ControllerError + '_ {
    move |source| ControllerError::Persistence {
        path: path.to_path_buf(),
        source,
    }
}

/// Outcome of a descriptor save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedDescriptor {
    pub path: PathBuf,
    /// False when the file was already cached.
    pub written: bool,
}

/// `<dir>/<hash>.torrent` files, written at most once per hash.
pub struct DescriptorCache {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl DescriptorCache {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path_for(&self, content_hash: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", content_hash, DESCRIPTOR_EXTENSION))
    }

    pub async fn save(&self, content_hash: &str, bytes: &[u8]) -> Result<SavedDescriptor> {
        let path = self.path_for(content_hash);
        // Serialize check-then-write so concurrent saves of one hash write once.
        let _guard = self.write_lock.lock().await;

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!("descriptor {} already cached", path.display());
            return Ok(SavedDescriptor {
                path,
                written: false,
            });
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(persistence(&self.dir))?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(persistence(&path))?;
        info!("saved descriptor {}", path.display());
        Ok(SavedDescriptor {
            path,
            written: true,
        })
    }
}

/// `<dir>/<hash><ext>` poster images.
pub struct PosterCache {
    dir: PathBuf,
}

impl PosterCache {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// `extension` includes the leading dot.
    pub fn path_for(&self, content_hash: &str, extension: &str) -> PathBuf {
        self.dir.join(format!("{}{}", content_hash, extension))
    }

    pub async fn save(&self, content_hash: &str, extension: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.path_for(content_hash, extension);
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(persistence(&self.dir))?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(persistence(&path))?;
        debug!("saved poster {} ({} bytes)", path.display(), bytes.len());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_descriptor_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DescriptorCache::new(dir.path().join("nested").join("torrents"));

        let first = cache.save("abc", b"one").await.unwrap();
        assert!(first.written);
        assert_eq!(first.path, dir.path().join("nested/torrents/abc.torrent"));

        let second = cache.save("abc", b"two").await.unwrap();
        assert!(!second.written);
        assert_eq!(second.path, first.path);
        assert_eq!(std::fs::read(&first.path).unwrap(), b"one");
    }

    #[tokio::test]
    async fn test_descriptor_write_failure_is_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();

        // The cache directory sits below a regular file, so mkdir fails.
        let cache = DescriptorCache::new(blocker.join("torrents"));
        let err = cache.save("abc", b"one").await.unwrap_err();
        assert!(matches!(err, ControllerError::Persistence { .. }));
    }

    #[tokio::test]
    async fn test_poster_path_uses_extension() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PosterCache::new(dir.path().to_path_buf());
        let path = cache.save("abc", ".png", b"png").await.unwrap();
        assert_eq!(path, dir.path().join("abc.png"));
        assert_eq!(std::fs::read(path).unwrap(), b"png");
    }
}
