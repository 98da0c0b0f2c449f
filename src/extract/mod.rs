// Content extraction collaborators — poster images and audio tags read through the engine.

pub mod id3;
pub mod poster;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::engine::{FileEntry, TorrentHandle};

/// Read stream over one file of a session.
pub struct TorrentFileReader {
    handle: Arc<dyn TorrentHandle>,
    file_index: usize,
    entry: FileEntry,
}

impl TorrentFileReader {
    pub fn open(handle: Arc<dyn TorrentHandle>, file_index: usize) -> Result<Self> {
        let entry = handle
            .files()
            .into_iter()
            .nth(file_index)
            .ok_or_else(|| anyhow!("file index {} out of range", file_index))?;
        Ok(Self {
            handle,
            file_index,
            entry,
        })
    }

    pub fn file_index(&self) -> usize {
        self.file_index
    }

    pub fn len(&self) -> u64 {
        self.entry.length
    }

    pub fn is_empty(&self) -> bool {
        self.entry.length == 0
    }

    pub fn name(&self) -> &str {
        &self.entry.name
    }

    /// Read `[start, end)`, clamped to the file length.
    pub async fn read(&self, start: u64, end: u64) -> Result<Bytes> {
        let end = end.min(self.entry.length);
        if start >= end {
            return Ok(Bytes::new());
        }
        self.handle.read_file_range(self.file_index, start, end).await
    }

    /// Read the last `n` bytes, or the whole file when shorter.
    pub async fn read_tail(&self, n: u64) -> Result<Bytes> {
        let start = self.entry.length.saturating_sub(n);
        self.read(start, self.entry.length).await
    }
}

/// Encoded image bytes and the extension they should be stored under.
#[derive(Debug, Clone)]
pub struct Poster {
    pub bytes: Bytes,
    /// Including the leading dot.
    pub extension: String,
}

#[async_trait]
pub trait PosterExtractor: Send + Sync {
    async fn extract(&self, handle: Arc<dyn TorrentHandle>) -> Result<Poster>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub year: Option<String>,
    pub comment: Option<String>,
    pub track: Option<u8>,
    pub genre: Option<u8>,
}

#[async_trait]
pub trait AudioMetadataReader: Send + Sync {
    async fn read(&self, file: TorrentFileReader) -> Result<AudioMetadata>;
}
