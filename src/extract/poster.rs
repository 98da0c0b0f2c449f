// Poster extraction — pick the largest image shipped inside the transfer.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::debug;

use super::{Poster, PosterExtractor, TorrentFileReader};
use crate::detect::media::{detect_media, kind_from_name};
use crate::engine::TorrentHandle;

/// Largest poster accepted (8 MB).
const MAX_POSTER_BYTES: u64 = 8 * 1024 * 1024;

#[derive(Debug, Default, Clone, Copy)]
pub struct ImagePosterExtractor;

impl ImagePosterExtractor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PosterExtractor for ImagePosterExtractor {
    async fn extract(&self, handle: Arc<dyn TorrentHandle>) -> Result<Poster> {
        let files = handle.files();
        let (index, entry) = files
            .iter()
            .enumerate()
            .filter(|(_, f)| f.length > 0 && f.length <= MAX_POSTER_BYTES)
            .filter(|(_, f)| kind_from_name(&f.name).is_image())
            .max_by_key(|(_, f)| f.length)
            .ok_or_else(|| anyhow!("no image file in {}", handle.identifier()))?;

        debug!("poster candidate {} ({} bytes)", entry.name, entry.length);
        let reader = TorrentFileReader::open(handle.clone(), index)?;
        let bytes = reader.read(0, reader.len()).await?;

        // Trust the bytes over the extension.
        let kind = detect_media(&bytes);
        if !kind.is_image() {
            return Err(anyhow!("{} is not a recognised image", entry.name));
        }

        Ok(Poster {
            bytes,
            extension: kind.extension().to_string(),
        })
    }
}
