// Fixed-state handle for unit tests of the registry, progress and server code.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bitvec::prelude::*;
use bytes::Bytes;

use crate::engine::{FileEntry, FileModTimes, TorrentHandle, TransferStats};

/// Handle whose pieces are one byte long; file contents are zero bytes.
#[derive(Default)]
pub struct StaticHandle {
    pub files: Vec<FileEntry>,
    pub bitfield: BitVec,
    pub ready: bool,
    pub destroyed: AtomicBool,
}

impl StaticHandle {
    /// `layout` holds (length, start_piece, end_piece) per file.
    pub fn with_layout(layout: &[(u64, usize, usize)], bitfield: BitVec) -> Self {
        let mut offset = 0;
        let files = layout
            .iter()
            .enumerate()
            .map(|(i, &(length, start_piece, end_piece))| {
                let entry = FileEntry {
                    name: format!("file{}", i),
                    path: format!("file{}", i),
                    length,
                    offset,
                    start_piece,
                    end_piece,
                };
                offset += length;
                entry
            })
            .collect();
        Self {
            files,
            bitfield,
            ready: true,
            destroyed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl TorrentHandle for StaticHandle {
    fn identifier(&self) -> &str {
        "static"
    }

    fn content_hash(&self) -> Option<String> {
        None
    }

    fn magnet_uri(&self) -> Option<String> {
        None
    }

    fn name(&self) -> Option<String> {
        None
    }

    fn path(&self) -> PathBuf {
        PathBuf::new()
    }

    fn files(&self) -> Vec<FileEntry> {
        self.files.clone()
    }

    fn bitfield(&self) -> BitVec {
        self.bitfield.clone()
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn stats(&self) -> TransferStats {
        let length = self.bitfield.len() as u64;
        let downloaded = self.bitfield.count_ones() as u64;
        TransferStats {
            progress: if length == 0 {
                0.0
            } else {
                downloaded as f64 / length as f64
            },
            downloaded,
            received: downloaded,
            length,
            ..TransferStats::default()
        }
    }

    fn descriptor(&self) -> Option<Bytes> {
        None
    }

    async fn file_mod_times(&self) -> Result<FileModTimes> {
        Err(anyhow!("no files on disk"))
    }

    async fn read_file_range(&self, file_index: usize, start: u64, end: u64) -> Result<Bytes> {
        let entry = self
            .files
            .get(file_index)
            .ok_or_else(|| anyhow!("file index {} out of range", file_index))?;
        let end = end.min(entry.length);
        Ok(Bytes::from(vec![0u8; end.saturating_sub(start) as usize]))
    }

    async fn destroy(&self) -> Result<()> {
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
