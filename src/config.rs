// Worker configuration — timing constants, cache locations, loopback engine tuning.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Period of the progress aggregation timer.
pub const PROGRESS_INTERVAL_MS: u64 = 1000;

/// Maximum bytes returned for an open-ended or range-less stream request (512 KB).
pub const STREAM_CLAMP_BYTES: u64 = 512 * 1024;

/// Upper bound on waiting for the engine to tear a session down.
pub const STOP_TIMEOUT_SECS: u64 = 10;

/// File extension of cached descriptor files, without the dot.
pub const DESCRIPTOR_EXTENSION: &str = "torrent";

/// Default piece length of the loopback engine (16 KB).
pub const LOOPBACK_PIECE_LENGTH: u64 = 16 * 1024;

/// Controller settings: persisted caches, timers and the streaming server binding.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ControllerConfig {
    /// Directory holding `<hash>.torrent` descriptor files.
    pub descriptor_dir: PathBuf,
    /// Directory holding poster images named after the content hash.
    pub poster_dir: PathBuf,
    pub progress_interval_ms: u64,
    pub stop_timeout_secs: u64,
    /// Address the streaming server listens on. The port is always ephemeral.
    pub server_bind_addr: IpAddr,
}

impl ControllerConfig {
    /// Config rooted at a single directory, used by embedders and tests.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            descriptor_dir: root.join("torrents"),
            poster_dir: root.join("posters"),
            ..Self::default()
        }
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(1))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        let root = std::env::temp_dir().join("ma-torrent");
        Self {
            descriptor_dir: root.join("torrents"),
            poster_dir: root.join("posters"),
            progress_interval_ms: PROGRESS_INTERVAL_MS,
            stop_timeout_secs: STOP_TIMEOUT_SECS,
            server_bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

/// Tuning of the in-process loopback engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct LoopbackConfig {
    /// Directory for memory-mapped piece scratch files.
    pub scratch_dir: PathBuf,
    pub piece_length: u64,
    /// Interval between transfer rounds in milliseconds.
    pub transfer_interval_ms: u64,
    /// Pieces pulled per transfer round.
    pub pieces_per_tick: usize,
    /// When false, pieces only move through `fetch_piece` or streaming reads.
    pub auto_transfer: bool,
}

impl LoopbackConfig {
    pub fn transfer_interval(&self) -> Duration {
        Duration::from_millis(self.transfer_interval_ms.max(1))
    }
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            scratch_dir: std::env::temp_dir().join("ma-torrent").join("scratch"),
            piece_length: LOOPBACK_PIECE_LENGTH,
            transfer_interval_ms: 200,
            pieces_per_tick: 8,
            auto_transfer: true,
        }
    }
}

/// Top-level configuration of the worker binary.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct WorkerConfig {
    pub controller: ControllerConfig,
    pub loopback: LoopbackConfig,
}

impl WorkerConfig {
    /// Load a JSON config file. Missing keys fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("invalid worker config")
    }
}
