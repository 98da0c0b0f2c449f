// Stream server lifecycle — at most one server, started once its session is ready.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::handler::StreamServer;
use super::net::network_address;
use crate::engine::SessionKey;
use crate::error::{ControllerError, Result};
use crate::protocol::ServerInfo;
use crate::session::registry::SessionRegistry;

enum Slot {
    Idle,
    Serving(StreamServer),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingStart {
    key: SessionKey,
    file_index: usize,
}

/// Current binding of the active server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatus {
    pub key: SessionKey,
    pub file_index: usize,
    pub port: u16,
}

pub struct StreamServerManager {
    slot: tokio::sync::Mutex<Slot>,
    pending: Mutex<Vec<PendingStart>>,
    registry: Arc<SessionRegistry>,
    bind_addr: IpAddr,
}

impl StreamServerManager {
    pub fn new(registry: Arc<SessionRegistry>, bind_addr: IpAddr) -> Self {
        Self {
            slot: tokio::sync::Mutex::new(Slot::Idle),
            pending: Mutex::new(Vec::new()),
            registry,
            bind_addr,
        }
    }

    /// Start serving `file_index` of `key`.
    ///
    /// Returns `Ok(None)` when the request was queued behind the session's
    /// readiness or ignored because a server is already running.
    pub async fn start(&self, key: &str, file_index: usize) -> Result<Option<ServerInfo>> {
        let handle = self.registry.lookup(key)?;

        if !handle.is_ready() {
            let request = PendingStart {
                key: key.to_string(),
                file_index,
            };
            self.pending.lock().push(request.clone());

            // Readiness may have fired between the check and the push.
            if !handle.is_ready() || !self.take_pending(&request) {
                debug!("server start for {} queued until ready", key);
                return Ok(None);
            }
        }

        self.serve(key, file_index).await
    }

    /// Run the starts queued for `key`. Called once the session turns ready.
    pub async fn on_ready(&self, key: &str) -> Vec<Result<ServerInfo>> {
        let queued: Vec<PendingStart> = {
            let mut pending = self.pending.lock();
            let (ours, rest): (Vec<_>, Vec<_>) = pending.drain(..).partition(|p| p.key == key);
            *pending = rest;
            ours
        };

        let mut started = Vec::new();
        for request in queued {
            match self.serve(&request.key, request.file_index).await {
                Ok(Some(info)) => started.push(Ok(info)),
                Ok(None) => {}
                Err(e) => started.push(Err(e)),
            }
        }
        started
    }

    /// Stop the running server. Returns false when already idle.
    pub async fn stop(&self) -> bool {
        let mut slot = self.slot.lock().await;
        match std::mem::replace(&mut *slot, Slot::Idle) {
            Slot::Serving(server) => {
                info!("stopping stream server for {} on port {}", server.key(), server.port());
                server.shutdown();
                true
            }
            Slot::Idle => false,
        }
    }

    /// Drop queued starts for a session that is going away.
    pub fn forget(&self, key: &str) {
        self.pending.lock().retain(|p| p.key != key);
    }

    pub fn has_pending(&self, key: &str) -> bool {
        self.pending.lock().iter().any(|p| p.key == key)
    }

    pub async fn status(&self) -> Option<ServerStatus> {
        match &*self.slot.lock().await {
            Slot::Serving(server) => Some(ServerStatus {
                key: server.key().to_string(),
                file_index: server.file_index(),
                port: server.port(),
            }),
            Slot::Idle => None,
        }
    }

    fn take_pending(&self, request: &PendingStart) -> bool {
        let mut pending = self.pending.lock();
        match pending.iter().position(|p| p == request) {
            Some(index) => {
                pending.remove(index);
                true
            }
            None => false,
        }
    }

    async fn serve(&self, key: &str, file_index: usize) -> Result<Option<ServerInfo>> {
        let mut slot = self.slot.lock().await;
        if let Slot::Serving(server) = &*slot {
            debug!(
                "stream server already serving {}, ignoring start for {}",
                server.key(),
                key
            );
            return Ok(None);
        }

        let handle = self.registry.lookup(key)?;
        if file_index >= handle.files().len() {
            return Err(ControllerError::FileIndex {
                key: key.to_string(),
                index: file_index,
            });
        }

        let server =
            StreamServer::start(self.bind_addr, self.registry.clone(), key.to_string(), file_index)
                .await?;
        let port = server.port();
        *slot = Slot::Serving(server);
        drop(slot);

        let network = SocketAddr::new(network_address().await, port);
        info!("stream server for {} file {} on port {}", key, file_index, port);
        Ok(Some(ServerInfo {
            torrent_key: key.to_string(),
            local_url: format!("http://localhost:{}/{}", port, file_index),
            network_url: format!("http://{}/{}", network, file_index),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TorrentHandle;
    use crate::session::testing::StaticHandle;
    use bitvec::prelude::*;
    use std::net::Ipv4Addr;

    fn manager_with(handles: Vec<(&str, StaticHandle)>) -> StreamServerManager {
        let registry = Arc::new(SessionRegistry::new());
        for (key, handle) in handles {
            let handle: Arc<dyn TorrentHandle> = Arc::new(handle);
            registry.register(key, handle).unwrap();
        }
        StreamServerManager::new(registry, IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    fn ready() -> StaticHandle {
        StaticHandle::with_layout(&[(8, 0, 7)], bitvec![1; 8])
    }

    #[tokio::test]
    async fn test_first_start_wins() {
        let manager = manager_with(vec![("a", ready()), ("b", ready())]);

        let info = manager.start("a", 0).await.unwrap().unwrap();
        assert_eq!(info.torrent_key, "a");
        assert!(info.local_url.starts_with("http://localhost:"));
        assert!(info.local_url.ends_with("/0"));

        assert!(manager.start("b", 0).await.unwrap().is_none());
        assert_eq!(manager.status().await.unwrap().key, "a");

        assert!(manager.stop().await);
        assert!(manager.status().await.is_none());
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let manager = manager_with(vec![]);
        assert!(!manager.stop().await);
        assert!(manager.status().await.is_none());
    }

    #[tokio::test]
    async fn test_start_validates_key_and_index() {
        let manager = manager_with(vec![("a", ready())]);
        assert!(matches!(
            manager.start("missing", 0).await,
            Err(ControllerError::UnknownKey(_))
        ));
        assert!(matches!(
            manager.start("a", 3).await,
            Err(ControllerError::FileIndex { index: 3, .. })
        ));
        assert!(manager.status().await.is_none());
    }

    #[tokio::test]
    async fn test_start_waits_for_ready() {
        let mut handle = ready();
        handle.ready = false;
        let manager = manager_with(vec![("a", handle)]);

        assert!(manager.start("a", 0).await.unwrap().is_none());
        assert!(manager.has_pending("a"));
        assert!(manager.status().await.is_none());

        let started = manager.on_ready("a").await;
        assert_eq!(started.len(), 1);
        assert!(!manager.has_pending("a"));
        assert_eq!(manager.status().await.unwrap().file_index, 0);
    }

    #[tokio::test]
    async fn test_forget_drops_pending() {
        let mut handle = ready();
        handle.ready = false;
        let manager = manager_with(vec![("a", handle)]);

        manager.start("a", 0).await.unwrap();
        manager.forget("a");
        assert!(manager.on_ready("a").await.is_empty());
        assert!(manager.status().await.is_none());
    }
}
