// Host protocol — inbound commands, outbound notifications and the session summaries they carry.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::engine::{FileModTimes, SeedOptions, SessionKey, TorrentHandle};
use crate::extract::AudioMetadata;
use crate::session::progress::ProgressSnapshot;

/// Commands sent by the host process.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Command {
    StartSession {
        key: SessionKey,
        identifier: String,
        path: PathBuf,
        #[serde(default)]
        file_mod_times: FileModTimes,
    },
    StopSession {
        key: SessionKey,
    },
    CreateAndSeed {
        key: SessionKey,
        options: SeedOptions,
    },
    SaveDescriptorFile {
        key: SessionKey,
    },
    GeneratePoster {
        key: SessionKey,
    },
    GetAudioMetadata {
        key: SessionKey,
        file_index: usize,
    },
    StartServer {
        key: SessionKey,
        file_index: usize,
    },
    StopServer,
}

impl Command {
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::StartSession { key, .. }
            | Self::StopSession { key }
            | Self::CreateAndSeed { key, .. }
            | Self::SaveDescriptorFile { key }
            | Self::GeneratePoster { key }
            | Self::GetAudioMetadata { key, .. }
            | Self::StartServer { key, .. } => Some(key),
            Self::StopServer => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::StartSession { .. } => "start-session",
            Self::StopSession { .. } => "stop-session",
            Self::CreateAndSeed { .. } => "create-and-seed",
            Self::SaveDescriptorFile { .. } => "save-descriptor-file",
            Self::GeneratePoster { .. } => "generate-poster",
            Self::GetAudioMetadata { .. } => "get-audio-metadata",
            Self::StartServer { .. } => "start-server",
            Self::StopServer => "stop-server",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TorrentFileInfo {
    pub name: String,
    pub length: u64,
    pub path: String,
}

/// Summary of a session sent on metadata, ready and completed transitions.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TorrentInfo {
    pub content_hash: Option<String>,
    pub magnet_uri: Option<String>,
    pub name: Option<String>,
    pub path: PathBuf,
    pub files: Vec<TorrentFileInfo>,
    pub bytes_received: u64,
}

impl TorrentInfo {
    pub fn from_handle(handle: &dyn TorrentHandle) -> Self {
        Self {
            content_hash: handle.content_hash(),
            magnet_uri: handle.magnet_uri(),
            name: handle.name(),
            path: handle.path(),
            files: handle
                .files()
                .into_iter()
                .map(|f| TorrentFileInfo {
                    name: f.name,
                    length: f.length,
                    path: f.path,
                })
                .collect(),
            bytes_received: handle.stats().received,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub torrent_key: SessionKey,
    pub local_url: String,
    pub network_url: String,
}

/// Notifications sent to the host process.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Notification {
    WorkerReady,
    Warning {
        key: Option<SessionKey>,
        message: String,
    },
    Error {
        key: Option<SessionKey>,
        message: String,
    },
    ContentHashResolved {
        key: SessionKey,
        hash: String,
    },
    Metadata {
        key: SessionKey,
        info: TorrentInfo,
    },
    Ready {
        key: SessionKey,
        info: TorrentInfo,
    },
    Completed {
        key: SessionKey,
        info: TorrentInfo,
    },
    FileModTimes {
        key: SessionKey,
        mod_times: FileModTimes,
    },
    DescriptorSaved {
        key: SessionKey,
        path: PathBuf,
    },
    PosterSaved {
        key: SessionKey,
        path: PathBuf,
    },
    AudioMetadata {
        key: SessionKey,
        file_index: usize,
        metadata: AudioMetadata,
    },
    ServerRunning(ServerInfo),
    Progress(ProgressSnapshot),
    SessionCreated {
        key: SessionKey,
    },
}

/// Outbound side of the host channel.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl Notifier {
    pub fn new(tx: mpsc::UnboundedSender<Notification>) -> Self {
        Self { tx }
    }

    pub fn send(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            debug!("host channel closed, dropping notification");
        }
    }

    pub fn warning(&self, key: Option<&str>, message: impl Into<String>) {
        self.send(Notification::Warning {
            key: key.map(str::to_string),
            message: message.into(),
        });
    }

    pub fn error(&self, key: Option<&str>, message: impl Into<String>) {
        self.send(Notification::Error {
            key: key.map(str::to_string),
            message: message.into(),
        });
    }
}
