// Progress aggregation — per-file piece counts folded into snapshots, emitted only on change.

use std::sync::Arc;

use bitvec::prelude::*;
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use tracing::debug;

use super::registry::{SessionEntry, SessionRegistry};
use crate::engine::FileEntry;
use crate::protocol::{Notification, Notifier};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileProgress {
    pub start_piece: usize,
    pub end_piece: usize,
    pub num_pieces: usize,
    pub num_pieces_present: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TorrentProgress {
    pub torrent_key: String,
    pub ready: bool,
    pub progress: f64,
    pub downloaded: u64,
    pub download_speed: u64,
    pub upload_speed: u64,
    pub num_peers: usize,
    pub length: u64,
    #[serde(serialize_with = "serialize_bitfield")]
    pub bitfield: BitVec,
    /// Empty until metadata resolves.
    pub files: Vec<FileProgress>,
}

/// Progress of every live session at one instant. Replaced wholesale, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub torrents: Vec<TorrentProgress>,
    /// Downloaded over total length across sessions that are not complete yet.
    pub progress: f64,
    pub has_active_torrents: bool,
}

impl ProgressSnapshot {
    pub fn torrent(&self, key: &str) -> Option<&TorrentProgress> {
        self.torrents.iter().find(|t| t.torrent_key == key)
    }
}

/// Packs the bitfield MSB-first, one bit per piece.
fn serialize_bitfield<S: Serializer>(bits: &BitVec, serializer: S) -> Result<S::Ok, S::Error> {
    let mut bytes = vec![0u8; bits.len().div_ceil(8)];
    for index in bits.iter_ones() {
        bytes[index / 8] |= 0x80 >> (index % 8);
    }
    serializer.serialize_bytes(&bytes)
}

/// Count present pieces within the file's inclusive piece range.
pub fn file_progress(file: &FileEntry, bitfield: &BitSlice) -> FileProgress {
    let num_pieces_present = if file.length == 0 || file.start_piece >= bitfield.len() {
        0
    } else {
        let end = file.end_piece.min(bitfield.len() - 1);
        bitfield[file.start_piece..=end].count_ones()
    };
    FileProgress {
        start_piece: file.start_piece,
        end_piece: file.end_piece,
        num_pieces: file.num_pieces(),
        num_pieces_present,
    }
}

pub fn torrent_progress(entry: &SessionEntry) -> TorrentProgress {
    let handle = &entry.handle;
    let stats = handle.stats();
    let bitfield = handle.bitfield();
    let files = handle
        .files()
        .iter()
        .map(|file| file_progress(file, &bitfield))
        .collect();

    TorrentProgress {
        torrent_key: entry.key.clone(),
        ready: handle.is_ready(),
        progress: stats.progress,
        downloaded: stats.downloaded,
        download_speed: stats.download_speed,
        upload_speed: stats.upload_speed,
        num_peers: stats.num_peers,
        length: stats.length,
        bitfield,
        files,
    }
}

pub fn compute_snapshot(entries: &[SessionEntry]) -> ProgressSnapshot {
    let torrents: Vec<TorrentProgress> = entries.iter().map(torrent_progress).collect();

    let (downloaded, length) = torrents
        .iter()
        .filter(|t| t.progress != 1.0)
        .fold((0u64, 0u64), |(d, l), t| (d + t.downloaded, l + t.length));
    let progress = downloaded as f64 / length.max(1) as f64;
    let has_active_torrents = torrents.iter().any(|t| t.progress != 1.0);

    ProgressSnapshot {
        torrents,
        progress,
        has_active_torrents,
    }
}

/// Holds the last emitted snapshot.
#[derive(Default)]
pub struct ProgressTracker {
    previous: Mutex<Option<ProgressSnapshot>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `snapshot` when it differs from the last emitted one and keeps it
    /// as the new baseline; returns `None` when nothing changed.
    pub fn diff(&self, snapshot: ProgressSnapshot) -> Option<ProgressSnapshot> {
        let mut previous = self.previous.lock();
        if previous.as_ref() == Some(&snapshot) {
            return None;
        }
        *previous = Some(snapshot.clone());
        Some(snapshot)
    }

    pub fn previous(&self) -> Option<ProgressSnapshot> {
        self.previous.lock().clone()
    }
}

/// Computes snapshots from the registry and emits them when they change.
pub struct ProgressReporter {
    registry: Arc<SessionRegistry>,
    tracker: ProgressTracker,
    notifier: Notifier,
}

impl ProgressReporter {
    pub fn new(registry: Arc<SessionRegistry>, notifier: Notifier) -> Self {
        Self {
            registry,
            tracker: ProgressTracker::new(),
            notifier,
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        compute_snapshot(&self.registry.list_all())
    }

    /// Emit a progress notification if the snapshot changed. Returns whether one was sent.
    pub fn report(&self) -> bool {
        match self.tracker.diff(self.snapshot()) {
            Some(snapshot) => {
                debug!("progress changed across {} sessions", snapshot.torrents.len());
                self.notifier.send(Notification::Progress(snapshot));
                true
            }
            None => false,
        }
    }
}
