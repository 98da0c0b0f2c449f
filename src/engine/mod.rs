// Transfer engine capability — the seam between the controller and the peer-to-peer engine.
//
// The controller never mutates piece state or statistics; it only reads them
// through `TorrentHandle` and reacts to events pushed through an `EventSink`.

pub mod loopback;
pub mod pieces;
pub mod stats;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bitvec::prelude::*;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// Caller-assigned opaque session identifier.
pub type SessionKey = String;

/// Registry-assigned identity of one session instance. A key reused after a
/// stop gets a new id.
pub type SessionId = u64;

/// Per-file modification times in milliseconds since the Unix epoch, in file order.
pub type FileModTimes = Vec<Option<u64>>;

/// One file inside a transfer. Immutable once metadata resolves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    /// Path relative to the transfer root.
    pub path: String,
    pub length: u64,
    /// Byte offset of the file within the transfer's contiguous byte space.
    pub offset: u64,
    pub start_piece: usize,
    /// Inclusive.
    pub end_piece: usize,
}

impl FileEntry {
    /// Zero for an empty file, which occupies no piece.
    pub fn num_pieces(&self) -> usize {
        if self.length == 0 {
            return 0;
        }
        (self.end_piece + 1).saturating_sub(self.start_piece)
    }
}

/// Transfer statistics as reported by the engine at one instant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferStats {
    /// Fraction of the content present locally, 0.0..=1.0.
    pub progress: f64,
    /// Verified bytes present locally.
    pub downloaded: u64,
    /// Raw bytes received from peers.
    pub received: u64,
    pub download_speed: u64,
    pub upload_speed: u64,
    pub num_peers: usize,
    pub length: u64,
}

/// Options for joining an existing transfer.
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    /// Root directory the transfer is stored under.
    pub path: PathBuf,
    /// Known modification times of local files; unchanged files skip re-verification.
    pub file_mod_times: FileModTimes,
}

/// Options for creating a new transfer from local files.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedOptions {
    pub files: Vec<PathBuf>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub announce: Vec<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub private: bool,
}

/// Lifecycle events emitted by the engine, per session or engine-wide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Warning(String),
    Error(String),
    /// The content hash is known.
    IdentifierResolved(String),
    MetadataResolved,
    Ready,
    Completed,
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Warning(_) => "warning",
            Self::Error(_) => "error",
            Self::IdentifierResolved(_) => "identifierResolved",
            Self::MetadataResolved => "metadataResolved",
            Self::Ready => "ready",
            Self::Completed => "completed",
        }
    }
}

/// The session instance an event was emitted for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSource {
    pub key: SessionKey,
    pub id: SessionId,
}

/// An event tagged with its session (`None` for engine-wide events).
#[derive(Debug, Clone)]
pub struct EngineEventEnvelope {
    pub source: Option<EventSource>,
    pub event: EngineEvent,
}

pub type EventSender = mpsc::UnboundedSender<EngineEventEnvelope>;

struct Gate {
    open: bool,
    backlog: Vec<EngineEvent>,
}

/// Pushes engine events onto the shared event queue.
///
/// A session sink starts closed: events are buffered until the controller has
/// registered the handle and calls [`EventSink::open`], which flushes the
/// backlog in emission order.
#[derive(Clone)]
pub struct EventSink {
    source: Option<EventSource>,
    tx: EventSender,
    gate: Arc<Mutex<Gate>>,
}

impl EventSink {
    pub fn for_session(key: SessionKey, id: SessionId, tx: EventSender) -> Self {
        Self {
            source: Some(EventSource { key, id }),
            tx,
            gate: Arc::new(Mutex::new(Gate {
                open: false,
                backlog: Vec::new(),
            })),
        }
    }

    /// Engine-wide sink, open from the start.
    pub fn global(tx: EventSender) -> Self {
        Self {
            source: None,
            tx,
            gate: Arc::new(Mutex::new(Gate {
                open: true,
                backlog: Vec::new(),
            })),
        }
    }

    pub fn key(&self) -> Option<&str> {
        self.source.as_ref().map(|s| s.key.as_str())
    }

    pub fn emit(&self, event: EngineEvent) {
        let mut gate = self.gate.lock();
        if gate.open {
            self.forward(event);
        } else {
            gate.backlog.push(event);
        }
    }

    pub fn open(&self) {
        let mut gate = self.gate.lock();
        gate.open = true;
        for event in std::mem::take(&mut gate.backlog) {
            self.forward(event);
        }
    }

    fn forward(&self, event: EngineEvent) {
        let envelope = EngineEventEnvelope {
            source: self.source.clone(),
            event,
        };
        if self.tx.send(envelope).is_err() {
            debug!("event queue closed, dropping event for {:?}", self.key());
        }
    }
}

/// A live transfer inside the engine.
#[async_trait]
pub trait TorrentHandle: Send + Sync {
    /// The identifier the transfer was created from.
    fn identifier(&self) -> &str;
    fn content_hash(&self) -> Option<String>;
    fn magnet_uri(&self) -> Option<String>;
    fn name(&self) -> Option<String>;
    fn path(&self) -> PathBuf;
    /// Empty until metadata resolves.
    fn files(&self) -> Vec<FileEntry>;
    fn bitfield(&self) -> BitVec;
    fn is_ready(&self) -> bool;
    fn stats(&self) -> TransferStats;
    /// Serialized descriptor document, once metadata is known.
    fn descriptor(&self) -> Option<Bytes>;
    async fn file_mod_times(&self) -> Result<FileModTimes>;
    /// Read `[start, end)` of one file, waiting for the pieces it spans.
    async fn read_file_range(&self, file_index: usize, start: u64, end: u64) -> Result<Bytes>;
    /// Release every engine-internal resource held for this transfer.
    async fn destroy(&self) -> Result<()>;
}

/// The peer-to-peer engine.
#[async_trait]
pub trait TorrentEngine: Send + Sync {
    /// Route engine-wide warnings and errors to `events`.
    fn attach(&self, events: EventSink);
    async fn add(
        &self,
        identifier: &str,
        options: AddOptions,
        events: EventSink,
    ) -> Result<Arc<dyn TorrentHandle>>;
    async fn seed(&self, options: SeedOptions, events: EventSink) -> Result<Arc<dyn TorrentHandle>>;
}
