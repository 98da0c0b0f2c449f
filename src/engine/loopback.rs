// In-process loopback engine — seeds local files and moves pieces between transfers of one process.
//
// There is no network: every transfer that joins a content hash becomes a peer of
// every other transfer of that hash, and pieces are copied between their stores.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::UNIX_EPOCH;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bitvec::prelude::*;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pieces::PieceStore;
use super::stats::StatsCollector;
use super::{
    AddOptions, EngineEvent, EventSink, FileEntry, FileModTimes, SeedOptions, TorrentEngine,
    TorrentHandle, TransferStats,
};
use crate::config::LoopbackConfig;

const MAGNET_PREFIX: &str = "magnet:?";
const BTIH_PARAM: &str = "xt=urn:btih:";
const HASH_LEN: usize = 40;

/// Descriptor document of a loopback transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metainfo {
    pub name: String,
    pub piece_length: u64,
    pub length: u64,
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub announce: Vec<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub private: bool,
}

impl Metainfo {
    /// Lay `files` (relative path, length) out back to back in one piece space.
    pub fn layout(name: String, piece_length: u64, files: Vec<(String, u64)>) -> Self {
        let mut offset = 0u64;
        let entries = files
            .into_iter()
            .map(|(path, length)| {
                // Empty files sit on the piece holding the previous byte so
                // their index never runs past the bitfield.
                let (start_piece, end_piece) = if length == 0 {
                    let piece = (offset.saturating_sub(1) / piece_length) as usize;
                    (piece, piece)
                } else {
                    (
                        (offset / piece_length) as usize,
                        ((offset + length - 1) / piece_length) as usize,
                    )
                };
                let name = path.rsplit('/').next().unwrap_or(&path).to_string();
                let entry = FileEntry {
                    name,
                    path,
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
            name,
            piece_length,
            length: offset,
            files: entries,
            announce: Vec::new(),
            comment: None,
            private: false,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).context("invalid descriptor")
    }

    /// First 40 hex digits of the SHA-256 of the serialized descriptor.
    pub fn content_hash(&self) -> Result<String> {
        let digest = Sha256::digest(self.to_bytes()?);
        let mut hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        hex.truncate(HASH_LEN);
        Ok(hex)
    }
}

enum Identifier {
    Hash(String),
    Descriptor(Metainfo),
}

fn is_content_hash(value: &str) -> bool {
    value.len() == HASH_LEN && value.chars().all(|c| c.is_ascii_hexdigit())
}

/// Accepts a bare content hash, a magnet URI, or a path to a descriptor file.
async fn parse_identifier(identifier: &str) -> Result<Identifier> {
    let identifier = identifier.trim();

    if let Some(query) = identifier.strip_prefix(MAGNET_PREFIX) {
        let hash = query
            .split('&')
            .find_map(|param| param.strip_prefix(BTIH_PARAM))
            .ok_or_else(|| anyhow!("magnet URI has no btih topic: {}", identifier))?;
        if !is_content_hash(hash) {
            return Err(anyhow!("invalid content hash in magnet URI: {}", hash));
        }
        return Ok(Identifier::Hash(hash.to_ascii_lowercase()));
    }

    if is_content_hash(identifier) {
        return Ok(Identifier::Hash(identifier.to_ascii_lowercase()));
    }

    let path = Path::new(identifier);
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        let raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read descriptor {}", path.display()))?;
        return Ok(Identifier::Descriptor(Metainfo::from_bytes(&raw)?));
    }

    Err(anyhow!("unrecognized torrent identifier: {}", identifier))
}

fn mod_time_ms(path: &Path) -> Option<u64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(modified.duration_since(UNIX_EPOCH).ok()?.as_millis() as u64)
}

struct Swarm {
    config: LoopbackConfig,
    members: RwLock<HashMap<String, Vec<Weak<LoopbackHandle>>>>,
    created: RwLock<Vec<Weak<LoopbackHandle>>>,
    global: RwLock<Option<EventSink>>,
    next_store: AtomicU64,
}

impl Swarm {
    fn join(&self, hash: &str, handle: &Arc<LoopbackHandle>) {
        self.members
            .write()
            .entry(hash.to_string())
            .or_default()
            .push(Arc::downgrade(handle));
    }

    fn leave(&self, hash: &str, handle: &LoopbackHandle) {
        let mut members = self.members.write();
        if let Some(list) = members.get_mut(hash) {
            list.retain(|weak| {
                weak.upgrade()
                    .is_some_and(|member| !std::ptr::eq(member.as_ref(), handle))
            });
            if list.is_empty() {
                members.remove(hash);
            }
        }
    }

    /// Live transfers of `hash` other than `except`.
    fn peers(&self, hash: &str, except: &LoopbackHandle) -> Vec<Arc<LoopbackHandle>> {
        let members = self.members.read();
        members
            .get(hash)
            .map(|list| {
                list.iter()
                    .filter_map(Weak::upgrade)
                    .filter(|member| !std::ptr::eq(member.as_ref(), except))
                    .filter(|member| !member.shutdown.is_cancelled())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn scratch_path(&self, hash: &str) -> PathBuf {
        let id = self.next_store.fetch_add(1, Ordering::Relaxed);
        self.config
            .scratch_dir
            .join(format!("{}-{}-{}.pieces", hash, std::process::id(), id))
    }

    fn warn(&self, message: String) {
        if let Some(global) = self.global.read().as_ref() {
            global.emit(EngineEvent::Warning(message));
        }
    }
}

#[derive(Default)]
struct HandleState {
    content_hash: Option<String>,
    metainfo: Option<Arc<Metainfo>>,
    store: Option<Arc<PieceStore>>,
    /// Source files of a seeded transfer.
    local_files: Option<Vec<PathBuf>>,
    ready: bool,
    completed: bool,
}

/// A transfer inside the loopback engine.
pub struct LoopbackHandle {
    identifier: String,
    root: PathBuf,
    swarm: Arc<Swarm>,
    state: RwLock<HandleState>,
    stats: StatsCollector,
    events: EventSink,
    piece_arrived: Notify,
    shutdown: CancellationToken,
}

impl LoopbackHandle {
    fn new(identifier: String, root: PathBuf, swarm: Arc<Swarm>, events: EventSink) -> Self {
        Self {
            identifier,
            root,
            swarm,
            state: RwLock::new(HandleState::default()),
            stats: StatsCollector::new(),
            events,
            piece_arrived: Notify::new(),
            shutdown: CancellationToken::new(),
        }
    }

    fn store(&self) -> Option<Arc<PieceStore>> {
        self.state.read().store.clone()
    }

    fn metainfo(&self) -> Option<Arc<Metainfo>> {
        self.state.read().metainfo.clone()
    }

    fn has_piece(&self, index: usize) -> bool {
        self.store().is_some_and(|store| store.has_piece(index))
    }

    fn install_metadata(&self, hash: &str, metainfo: Arc<Metainfo>) -> Result<Arc<PieceStore>> {
        let store = Arc::new(PieceStore::new(
            &self.swarm.scratch_path(hash),
            metainfo.length,
            metainfo.piece_length,
        )?);
        let mut state = self.state.write();
        state.metainfo = Some(metainfo);
        state.store = Some(store.clone());
        Ok(store)
    }

    /// Pull one piece from any peer that has it.
    ///
    /// Returns `Ok(false)` when no peer can supply the piece yet.
    pub fn fetch_piece(&self, index: usize) -> Result<bool> {
        let store = self
            .store()
            .ok_or_else(|| anyhow!("metadata not resolved for {}", self.identifier))?;
        if store.has_piece(index) {
            return Ok(true);
        }
        if index >= store.num_pieces() {
            return Err(anyhow!(
                "piece {} out of range (total {})",
                index,
                store.num_pieces()
            ));
        }
        let hash = match self.state.read().content_hash.clone() {
            Some(hash) => hash,
            None => return Ok(false),
        };

        let source = self
            .swarm
            .peers(&hash, self)
            .into_iter()
            .find(|peer| peer.has_piece(index));
        let source = match source {
            Some(source) => source,
            None => return Ok(false),
        };
        let data = match source.store().and_then(|s| s.read_piece(index)) {
            Some(data) => data,
            None => return Ok(false),
        };

        store.put_piece(index, &data)?;
        self.stats.record_received(data.len() as u64);
        source.stats.record_uploaded(data.len() as u64);
        debug!("{} fetched piece {} ({} bytes)", hash, index, data.len());

        self.piece_arrived.notify_waiters();
        self.check_completed();
        Ok(true)
    }

    fn check_completed(&self) {
        let newly_completed = {
            let mut state = self.state.write();
            let complete = state.store.as_ref().is_some_and(|s| s.is_complete());
            if complete && !state.completed {
                state.completed = true;
                true
            } else {
                false
            }
        };
        if newly_completed {
            info!("transfer {} completed", self.identifier);
            self.events.emit(EngineEvent::Completed);
        }
    }

    fn mark_ready(&self) {
        self.state.write().ready = true;
        self.events.emit(EngineEvent::Ready);
    }

    async fn run_leech(self: Arc<Self>, identifier: Identifier) {
        let (hash, metainfo) = match identifier {
            Identifier::Hash(hash) => (hash, None),
            Identifier::Descriptor(metainfo) => match metainfo.content_hash() {
                Ok(hash) => (hash, Some(Arc::new(metainfo))),
                Err(e) => {
                    self.events.emit(EngineEvent::Error(e.to_string()));
                    return;
                }
            },
        };

        self.state.write().content_hash = Some(hash.clone());
        self.events.emit(EngineEvent::IdentifierResolved(hash.clone()));
        self.swarm.join(&hash, &self);

        let metainfo = match metainfo {
            Some(metainfo) => metainfo,
            None => match self.wait_for_metadata(&hash).await {
                Some(metainfo) => metainfo,
                None => return,
            },
        };

        if let Err(e) = self.install_metadata(&hash, metainfo) {
            warn!("transfer {} failed to allocate pieces: {}", hash, e);
            self.events.emit(EngineEvent::Error(e.to_string()));
            return;
        }
        self.events.emit(EngineEvent::MetadataResolved);
        self.mark_ready();

        if self.swarm.config.auto_transfer {
            self.transfer_loop().await;
        }
    }

    async fn wait_for_metadata(&self, hash: &str) -> Option<Arc<Metainfo>> {
        let mut warned = false;
        loop {
            let found = self
                .swarm
                .peers(hash, self)
                .into_iter()
                .find_map(|peer| peer.metainfo());
            if found.is_some() {
                return found;
            }
            if !warned {
                warned = true;
                self.events
                    .emit(EngineEvent::Warning(format!("no peers for {} yet", hash)));
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = tokio::time::sleep(self.swarm.config.transfer_interval()) => {}
            }
        }
    }

    async fn transfer_loop(&self) {
        let mut ticker = tokio::time::interval(self.swarm.config.transfer_interval());
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let store = match self.store() {
                Some(store) => store,
                None => return,
            };
            if store.is_complete() {
                return;
            }

            let missing: Vec<usize> = store
                .bitfield()
                .iter_zeros()
                .take(self.swarm.config.pieces_per_tick)
                .collect();
            for index in missing {
                if let Err(e) = self.fetch_piece(index) {
                    warn!("transfer {} piece {} failed: {}", self.identifier, index, e);
                    self.events.emit(EngineEvent::Warning(e.to_string()));
                }
            }
        }
    }

    async fn run_seed(self: Arc<Self>, hash: String) {
        self.events.emit(EngineEvent::IdentifierResolved(hash));
        self.events.emit(EngineEvent::MetadataResolved);
        self.mark_ready();
        self.check_completed();
    }
}

#[async_trait]
impl TorrentHandle for LoopbackHandle {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn content_hash(&self) -> Option<String> {
        self.state.read().content_hash.clone()
    }

    fn magnet_uri(&self) -> Option<String> {
        self.content_hash()
            .map(|hash| format!("{}{}{}", MAGNET_PREFIX, BTIH_PARAM, hash))
    }

    fn name(&self) -> Option<String> {
        self.metainfo().map(|m| m.name.clone())
    }

    fn path(&self) -> PathBuf {
        self.root.clone()
    }

    fn files(&self) -> Vec<FileEntry> {
        self.metainfo().map(|m| m.files.clone()).unwrap_or_default()
    }

    fn bitfield(&self) -> BitVec {
        self.store().map(|s| s.bitfield()).unwrap_or_default()
    }

    fn is_ready(&self) -> bool {
        self.state.read().ready
    }

    fn stats(&self) -> TransferStats {
        if let Some(hash) = self.content_hash() {
            self.stats.set_peers(self.swarm.peers(&hash, self).len());
        }
        let rates = self.stats.snapshot();
        let (length, downloaded) = self
            .store()
            .map(|s| (s.length(), s.present_bytes()))
            .unwrap_or((0, 0));
        let progress = if length == 0 {
            0.0
        } else {
            downloaded as f64 / length as f64
        };

        TransferStats {
            progress,
            downloaded,
            received: rates.received_bytes,
            download_speed: rates.download_bps,
            upload_speed: rates.upload_bps,
            num_peers: rates.peers,
            length,
        }
    }

    fn descriptor(&self) -> Option<Bytes> {
        self.metainfo()
            .and_then(|m| m.to_bytes().ok())
            .map(Bytes::from)
    }

    async fn file_mod_times(&self) -> Result<FileModTimes> {
        let (metainfo, store, local_files, completed) = {
            let state = self.state.read();
            (
                state.metainfo.clone(),
                state.store.clone(),
                state.local_files.clone(),
                state.completed,
            )
        };
        let metainfo =
            metainfo.ok_or_else(|| anyhow!("metadata not resolved for {}", self.identifier))?;

        if let Some(files) = local_files {
            return Ok(files.iter().map(|path| mod_time_ms(path)).collect());
        }
        if !completed {
            return Err(anyhow!("transfer {} is not complete", self.identifier));
        }
        let store = store.ok_or_else(|| anyhow!("transfer {} was destroyed", self.identifier))?;
        let stamp = mod_time_ms(store.path());
        Ok(vec![stamp; metainfo.files.len()])
    }

    async fn read_file_range(&self, file_index: usize, start: u64, end: u64) -> Result<Bytes> {
        let metainfo = self
            .metainfo()
            .ok_or_else(|| anyhow!("metadata not resolved for {}", self.identifier))?;
        let entry = metainfo
            .files
            .get(file_index)
            .ok_or_else(|| anyhow!("file index {} out of range", file_index))?;

        let end = end.min(entry.length);
        if start >= end {
            return Ok(Bytes::new());
        }
        let (abs_start, abs_end) = (entry.offset + start, entry.offset + end);

        loop {
            let store = self
                .store()
                .ok_or_else(|| anyhow!("transfer {} was destroyed", self.identifier))?;
            let notified = self.piece_arrived.notified();

            if let Some(data) = store.read_range(abs_start, abs_end) {
                return Ok(Bytes::from(data));
            }

            // Pull the pieces this reader is blocked on ahead of the transfer order.
            let mut progressed = false;
            if let Some((first, last)) = store.pieces_for_range(abs_start, abs_end) {
                for index in first..=last {
                    if !store.has_piece(index) && self.fetch_piece(index)? {
                        progressed = true;
                    }
                }
            }
            if progressed {
                continue;
            }

            tokio::select! {
                _ = notified => {}
                _ = self.shutdown.cancelled() => {
                    return Err(anyhow!("transfer {} was destroyed", self.identifier));
                }
                _ = tokio::time::sleep(self.swarm.config.transfer_interval()) => {}
            }
        }
    }

    async fn destroy(&self) -> Result<()> {
        self.shutdown.cancel();
        let hash = {
            let mut state = self.state.write();
            state.store = None;
            state.content_hash.clone()
        };
        if let Some(hash) = hash {
            self.swarm.leave(&hash, self);
        }
        self.piece_arrived.notify_waiters();
        info!("transfer {} destroyed", self.identifier);
        Ok(())
    }
}

/// Engine whose peers are the other transfers of the same process.
pub struct LoopbackEngine {
    swarm: Arc<Swarm>,
}

impl LoopbackEngine {
    pub fn new(config: LoopbackConfig) -> Self {
        Self {
            swarm: Arc::new(Swarm {
                config,
                members: RwLock::new(HashMap::new()),
                created: RwLock::new(Vec::new()),
                global: RwLock::new(None),
                next_store: AtomicU64::new(0),
            }),
        }
    }

    /// Live transfers created from `identifier`, oldest first.
    pub fn handles_for(&self, identifier: &str) -> Vec<Arc<LoopbackHandle>> {
        self.swarm
            .created
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|handle| handle.identifier == identifier)
            .collect()
    }

    fn track(&self, handle: &Arc<LoopbackHandle>) {
        let mut created = self.swarm.created.write();
        created.retain(|weak| weak.strong_count() > 0);
        created.push(Arc::downgrade(handle));
    }
}

#[async_trait]
impl TorrentEngine for LoopbackEngine {
    fn attach(&self, events: EventSink) {
        *self.swarm.global.write() = Some(events);
    }

    async fn add(
        &self,
        identifier: &str,
        options: AddOptions,
        events: EventSink,
    ) -> Result<Arc<dyn TorrentHandle>> {
        let parsed = match parse_identifier(identifier).await {
            Ok(parsed) => parsed,
            Err(e) => {
                self.swarm.warn(e.to_string());
                return Err(e);
            }
        };
        debug!(
            "adding {} under {} ({} known mod times)",
            identifier,
            options.path.display(),
            options.file_mod_times.len()
        );

        let handle = Arc::new(LoopbackHandle::new(
            identifier.to_string(),
            options.path,
            self.swarm.clone(),
            events,
        ));
        self.track(&handle);
        tokio::spawn(handle.clone().run_leech(parsed));
        Ok(handle)
    }

    async fn seed(&self, options: SeedOptions, events: EventSink) -> Result<Arc<dyn TorrentHandle>> {
        let first = options
            .files
            .first()
            .ok_or_else(|| anyhow!("nothing to seed: no files given"))?;
        let root = first
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let file_name = |path: &Path| {
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string())
        };
        let name = options.name.clone().unwrap_or_else(|| {
            if options.files.len() == 1 {
                file_name(first.as_path())
            } else {
                file_name(root.as_path())
            }
        });

        let mut contents = Vec::with_capacity(options.files.len());
        let mut layout = Vec::with_capacity(options.files.len());
        for path in &options.files {
            let data = tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let relative = if options.files.len() == 1 {
                file_name(path.as_path())
            } else {
                format!("{}/{}", name, file_name(path.as_path()))
            };
            layout.push((relative, data.len() as u64));
            contents.push(data);
        }

        let mut metainfo = Metainfo::layout(name, self.swarm.config.piece_length, layout);
        metainfo.announce = options.announce.clone();
        metainfo.comment = options.comment.clone();
        metainfo.private = options.private;
        let hash = metainfo.content_hash()?;

        let handle = Arc::new(LoopbackHandle::new(
            format!("{}{}{}", MAGNET_PREFIX, BTIH_PARAM, hash),
            root,
            self.swarm.clone(),
            events,
        ));
        let store = handle.install_metadata(&hash, Arc::new(metainfo))?;
        let data = contents.concat();
        for index in 0..store.num_pieces() {
            let start = index * store.piece_length() as usize;
            store.put_piece(index, &data[start..start + store.piece_len(index)])?;
        }
        {
            let mut state = handle.state.write();
            state.content_hash = Some(hash.clone());
            state.local_files = Some(options.files.clone());
        }

        self.swarm.join(&hash, &handle);
        self.track(&handle);
        info!("seeding {} ({} files)", hash, options.files.len());
        tokio::spawn(handle.clone().run_seed(hash));
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_spans_pieces() {
        let metainfo = Metainfo::layout(
            "album".to_string(),
            16,
            vec![
                ("album/a.bin".to_string(), 160),
                ("album/b.bin".to_string(), 40),
                ("album/empty".to_string(), 0),
            ],
        );
        assert_eq!(metainfo.length, 200);
        assert_eq!(metainfo.files[0].name, "a.bin");
        assert_eq!((metainfo.files[0].start_piece, metainfo.files[0].end_piece), (0, 9));
        assert_eq!((metainfo.files[1].start_piece, metainfo.files[1].end_piece), (10, 12));
        assert_eq!(metainfo.files[1].offset, 160);
        assert_eq!((metainfo.files[2].start_piece, metainfo.files[2].end_piece), (12, 12));
        assert_eq!(metainfo.files[2].num_pieces(), 0);
    }

    #[test]
    fn test_content_hash_is_stable() {
        let a = Metainfo::layout("x".to_string(), 16, vec![("x".to_string(), 3)]);
        let b = Metainfo::from_bytes(&a.to_bytes().unwrap()).unwrap();
        let hash = a.content_hash().unwrap();
        assert_eq!(hash.len(), HASH_LEN);
        assert!(is_content_hash(&hash));
        assert_eq!(hash, b.content_hash().unwrap());
    }

    #[tokio::test]
    async fn test_parse_identifier() {
        let hash = "0123456789abcdef0123456789abcdef01234567";
        match parse_identifier(hash).await.unwrap() {
            Identifier::Hash(h) => assert_eq!(h, hash),
            Identifier::Descriptor(_) => panic!("expected hash"),
        }
        let magnet = format!("magnet:?xt=urn:btih:{}&dn=movie", hash.to_uppercase());
        match parse_identifier(&magnet).await.unwrap() {
            Identifier::Hash(h) => assert_eq!(h, hash),
            Identifier::Descriptor(_) => panic!("expected hash"),
        }
        assert!(parse_identifier("magnet:?dn=movie").await.is_err());
        assert!(parse_identifier("/definitely/not/here.torrent").await.is_err());
    }
}
