// Event translation — engine lifecycle events in, host notifications out.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::engine::{EngineEvent, EngineEventEnvelope, EventSource, TorrentHandle};
use crate::protocol::{Notification, Notifier, TorrentInfo};
use crate::session::progress::ProgressReporter;
use crate::session::registry::SessionRegistry;
use crate::server::manager::StreamServerManager;

pub struct EventTranslator {
    registry: Arc<SessionRegistry>,
    notifier: Notifier,
    progress: Arc<ProgressReporter>,
    servers: Arc<StreamServerManager>,
}

impl EventTranslator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        notifier: Notifier,
        progress: Arc<ProgressReporter>,
        servers: Arc<StreamServerManager>,
    ) -> Self {
        Self {
            registry,
            notifier,
            progress,
            servers,
        }
    }

    /// Translate one event. Events are handled strictly in arrival order.
    pub async fn handle(&self, envelope: EngineEventEnvelope) {
        let EngineEventEnvelope { source, event } = envelope;

        let EventSource { key, id } = match source {
            Some(source) => source,
            None => {
                match event {
                    EngineEvent::Warning(message) => self.notifier.warning(None, message),
                    EngineEvent::Error(message) => self.notifier.error(None, message),
                    other => debug!("ignoring engine-wide {} event", other.name()),
                }
                return;
            }
        };

        // A stopped session, or an earlier session under a reused key.
        let handle = match self.registry.lookup_session(&key, id) {
            Some(handle) => handle,
            None => {
                debug!("dropping {} event for stale session {}#{}", event.name(), key, id);
                return;
            }
        };

        match event {
            EngineEvent::Warning(message) => {
                warn!("session {} warning: {}", key, message);
                self.notifier.warning(Some(&key), message);
            }
            EngineEvent::Error(message) => {
                warn!("session {} error: {}", key, message);
                self.notifier.error(Some(&key), message);
            }
            EngineEvent::IdentifierResolved(hash) => {
                debug!("session {} resolved to {}", key, hash);
                self.notifier
                    .send(Notification::ContentHashResolved { key, hash });
            }
            EngineEvent::MetadataResolved => {
                let info = TorrentInfo::from_handle(handle.as_ref());
                self.notifier.send(Notification::Metadata { key, info });
                self.progress.report();
            }
            EngineEvent::Ready => {
                let info = TorrentInfo::from_handle(handle.as_ref());
                self.notifier.send(Notification::Ready {
                    key: key.clone(),
                    info,
                });
                self.progress.report();
                self.start_pending_servers(&key).await;
            }
            EngineEvent::Completed => {
                let info = TorrentInfo::from_handle(handle.as_ref());
                self.notifier.send(Notification::Completed {
                    key: key.clone(),
                    info,
                });
                self.progress.report();
                self.forward_mod_times(key, handle);
            }
        }
    }

    async fn start_pending_servers(&self, key: &str) {
        for started in self.servers.on_ready(key).await {
            match started {
                Ok(info) => self.notifier.send(Notification::ServerRunning(info)),
                Err(e) => {
                    warn!("queued server start for {} failed: {}", key, e);
                    self.notifier.error(Some(key), e.to_string());
                }
            }
        }
    }

    fn forward_mod_times(&self, key: String, handle: Arc<dyn TorrentHandle>) {
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            match handle.file_mod_times().await {
                Ok(mod_times) => notifier.send(Notification::FileModTimes { key, mod_times }),
                Err(e) => warn!("session {} file mod times unavailable: {}", key, e),
            }
        });
    }
}
