// Shared harness: a worker over the loopback engine, rooted in a temp dir.
#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

use ma_torrent_engine::api::worker_api::{spawn_worker, WorkerHandle};
use ma_torrent_engine::config::{ControllerConfig, LoopbackConfig};
use ma_torrent_engine::controller::ControllerParts;
use ma_torrent_engine::engine::loopback::{LoopbackEngine, LoopbackHandle, Metainfo};
use ma_torrent_engine::engine::SeedOptions;
use ma_torrent_engine::protocol::{Command, Notification};

pub const PIECE_LENGTH: u64 = 16;
pub const WAIT: Duration = Duration::from_secs(5);

pub struct Harness {
    pub worker: WorkerHandle,
    pub engine: Arc<LoopbackEngine>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();

        let loopback = LoopbackConfig {
            scratch_dir: dir.path().join("scratch"),
            piece_length: PIECE_LENGTH,
            transfer_interval_ms: 20,
            pieces_per_tick: 4,
            auto_transfer: false,
        };
        let mut controller = ControllerConfig::rooted_at(dir.path());
        controller.progress_interval_ms = 50;
        controller.stop_timeout_secs = 2;
        controller.server_bind_addr = IpAddr::V4(Ipv4Addr::LOCALHOST);

        let engine = Arc::new(LoopbackEngine::new(loopback));
        let worker = spawn_worker(ControllerParts::with_engine(controller, engine.clone()));
        Self {
            worker,
            engine,
            dir,
        }
    }

    pub fn send(&self, command: Command) {
        self.worker.send(command).unwrap();
    }

    pub fn notifications(&mut self) -> &mut UnboundedReceiver<Notification> {
        &mut self.worker.notifications
    }

    /// Write a file under `<tmp>/content/` and return its path.
    pub fn write_file(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.dir.path().join("content").join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, bytes).unwrap();
        path
    }

    /// Seed `files` under `key` and return the content hash once resolved.
    pub async fn seed(&mut self, key: &str, files: Vec<PathBuf>) -> String {
        self.send(Command::CreateAndSeed {
            key: key.to_string(),
            options: SeedOptions {
                files,
                ..SeedOptions::default()
            },
        });
        let key = key.to_string();
        match self
            .wait_for(|n| matches!(n, Notification::ContentHashResolved { key: k, .. } if *k == key))
            .await
        {
            Notification::ContentHashResolved { hash, .. } => hash,
            _ => unreachable!(),
        }
    }

    /// Join `hash` as a leecher under `key`, returning once it is ready.
    pub async fn leech(&mut self, key: &str, hash: &str) -> Arc<LoopbackHandle> {
        self.send(Command::StartSession {
            key: key.to_string(),
            identifier: hash.to_string(),
            path: self.dir.path().join("downloads"),
            file_mod_times: Vec::new(),
        });
        let key_owned = key.to_string();
        self.wait_for(|n| matches!(n, Notification::Ready { key: k, .. } if *k == key_owned))
            .await;
        self.engine
            .handles_for(hash)
            .into_iter()
            .next()
            .expect("leech handle")
    }

    pub async fn wait_for<F>(&mut self, pred: F) -> Notification
    where
        F: FnMut(&Notification) -> bool,
    {
        wait_for(&mut self.worker.notifications, pred).await
    }

    /// Everything already queued, without waiting.
    pub fn drain(&mut self) -> Vec<Notification> {
        std::iter::from_fn(|| self.worker.notifications.try_recv().ok()).collect()
    }
}

pub async fn wait_for<F>(rx: &mut UnboundedReceiver<Notification>, mut pred: F) -> Notification
where
    F: FnMut(&Notification) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let notification = rx.recv().await.expect("notification channel closed");
            if pred(&notification) {
                return notification;
            }
        }
    })
    .await
    .expect("timed out waiting for notification")
}

/// Content hash the loopback engine assigns to a single seeded file.
pub fn single_file_hash(name: &str, length: u64) -> String {
    Metainfo::layout(
        name.to_string(),
        PIECE_LENGTH,
        vec![(name.to_string(), length)],
    )
    .content_hash()
    .unwrap()
}

/// Deterministic content of `len` bytes.
pub fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
