// Session controller — dispatches host commands and drives the event and progress loops.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::engine::{
    AddOptions, EngineEventEnvelope, EventSender, EventSink, FileModTimes, SeedOptions,
    SessionId, SessionKey, TorrentEngine, TorrentHandle,
};
use crate::error::{ControllerError, Result};
use crate::extract::id3::Id3v1Reader;
use crate::extract::poster::ImagePosterExtractor;
use crate::extract::{AudioMetadataReader, PosterExtractor, TorrentFileReader};
use crate::persist::{DescriptorCache, PosterCache};
use crate::protocol::{Command, Notification, Notifier};
use crate::server::manager::StreamServerManager;
use crate::session::progress::ProgressReporter;
use crate::session::registry::SessionRegistry;
use crate::translator::EventTranslator;

/// Collaborators a controller is assembled from.
pub struct ControllerParts {
    pub config: ControllerConfig,
    pub engine: Arc<dyn TorrentEngine>,
    pub poster_extractor: Arc<dyn PosterExtractor>,
    pub audio_reader: Arc<dyn AudioMetadataReader>,
}

impl ControllerParts {
    /// Parts with the built-in poster and ID3 extractors.
    pub fn with_engine(config: ControllerConfig, engine: Arc<dyn TorrentEngine>) -> Self {
        Self {
            config,
            engine,
            poster_extractor: Arc::new(ImagePosterExtractor::new()),
            audio_reader: Arc::new(Id3v1Reader::new()),
        }
    }
}

/// Orders commands per key: a command starts once the previous command for
/// the same key has finished. Each lane's tail is the completion signal of
/// its most recent command.
#[derive(Default)]
struct CommandLanes {
    tails: HashMap<SessionKey, oneshot::Receiver<()>>,
}

impl CommandLanes {
    /// Queue behind the last command for `key`. Returns the signal to wait on
    /// and the sender to drop once this command is done.
    fn enter(&mut self, key: &str) -> (Option<oneshot::Receiver<()>>, oneshot::Sender<()>) {
        self.tails
            .retain(|_, tail| matches!(tail.try_recv(), Err(TryRecvError::Empty)));
        let (done, tail) = oneshot::channel();
        let previous = self.tails.insert(key.to_string(), tail);
        (previous, done)
    }
}

pub struct Controller {
    config: ControllerConfig,
    engine: Arc<dyn TorrentEngine>,
    registry: Arc<SessionRegistry>,
    notifier: Notifier,
    events_tx: EventSender,
    translator: EventTranslator,
    progress: Arc<ProgressReporter>,
    servers: Arc<StreamServerManager>,
    descriptors: DescriptorCache,
    posters: PosterCache,
    poster_extractor: Arc<dyn PosterExtractor>,
    audio_reader: Arc<dyn AudioMetadataReader>,
}

impl Controller {
    /// Build a controller publishing to `notifications`. The returned receiver
    /// carries engine events and must be handed to [`Controller::run`].
    pub fn new(
        parts: ControllerParts,
        notifications: mpsc::UnboundedSender<Notification>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<EngineEventEnvelope>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let notifier = Notifier::new(notifications);
        let registry = Arc::new(SessionRegistry::new());
        let progress = Arc::new(ProgressReporter::new(registry.clone(), notifier.clone()));
        let servers = Arc::new(StreamServerManager::new(
            registry.clone(),
            parts.config.server_bind_addr,
        ));
        let translator = EventTranslator::new(
            registry.clone(),
            notifier.clone(),
            progress.clone(),
            servers.clone(),
        );

        parts.engine.attach(EventSink::global(events_tx.clone()));

        let controller = Arc::new(Self {
            descriptors: DescriptorCache::new(parts.config.descriptor_dir.clone()),
            posters: PosterCache::new(parts.config.poster_dir.clone()),
            config: parts.config,
            engine: parts.engine,
            registry,
            notifier,
            events_tx,
            translator,
            progress,
            servers,
            poster_extractor: parts.poster_extractor,
            audio_reader: parts.audio_reader,
        });
        (controller, events_rx)
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn servers(&self) -> &Arc<StreamServerManager> {
        &self.servers
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Process commands, engine events and progress ticks until `shutdown`
    /// fires or the command channel closes, then wait for in-flight commands
    /// and tear every session down.
    ///
    /// Commands for the same key run one after another in arrival order;
    /// commands for different keys run concurrently.
    pub async fn run(
        self: Arc<Self>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<EngineEventEnvelope>,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.config.progress_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let tasks = TaskTracker::new();
        let mut lanes = CommandLanes::default();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => {
                        let lane = command.key().map(|key| lanes.enter(key));
                        let this = self.clone();
                        tasks.spawn(async move {
                            let _done = match lane {
                                Some((previous, done)) => {
                                    if let Some(previous) = previous {
                                        let _ = previous.await;
                                    }
                                    Some(done)
                                }
                                None => None,
                            };
                            this.handle_command(command).await;
                        });
                    }
                    None => {
                        debug!("command channel closed");
                        break;
                    }
                },
                Some(envelope) = events.recv() => self.handle_event(envelope).await,
                _ = ticker.tick() => {
                    self.emit_progress();
                }
            }
        }

        tasks.close();
        if !tasks.is_empty() {
            debug!("waiting for {} in-flight commands", tasks.len());
        }
        tasks.wait().await;
        self.shutdown_all().await;
    }

    /// Run one command, reporting its failure to the host.
    pub async fn handle_command(&self, command: Command) {
        let name = command.name();
        let key = command.key().map(str::to_string);
        debug!("command {} for {:?}", name, key);

        if let Err(e) = self.dispatch(command).await {
            warn!("{} failed for {:?}: {}", name, key, e);
            let key = e.key().map(str::to_string).or(key);
            self.notifier.error(key.as_deref(), e.to_string());
        }
    }

    pub async fn dispatch(&self, command: Command) -> Result<()> {
        match command {
            Command::StartSession {
                key,
                identifier,
                path,
                file_mod_times,
            } => self.start_session(key, &identifier, path, file_mod_times).await,
            Command::StopSession { key } => self.stop_session(&key).await,
            Command::CreateAndSeed { key, options } => self.create_and_seed(key, options).await,
            Command::SaveDescriptorFile { key } => self.save_descriptor_file(&key).await,
            Command::GeneratePoster { key } => self.generate_poster(&key).await,
            Command::GetAudioMetadata { key, file_index } => {
                self.get_audio_metadata(&key, file_index).await
            }
            Command::StartServer { key, file_index } => self.start_server(&key, file_index).await,
            Command::StopServer => {
                self.stop_server().await;
                Ok(())
            }
        }
    }

    pub async fn handle_event(&self, envelope: EngineEventEnvelope) {
        self.translator.handle(envelope).await;
    }

    /// Emit a progress snapshot if anything changed since the last one.
    pub fn emit_progress(&self) -> bool {
        self.progress.report()
    }

    pub async fn start_session(
        &self,
        key: SessionKey,
        identifier: &str,
        path: PathBuf,
        file_mod_times: FileModTimes,
    ) -> Result<()> {
        if self.registry.contains(&key) {
            return Err(ControllerError::DuplicateKey(key));
        }

        info!("starting session {} from {}", key, identifier);
        let id = self.registry.allocate_id();
        let sink = EventSink::for_session(key.clone(), id, self.events_tx.clone());
        let options = AddOptions {
            path,
            file_mod_times,
        };
        let handle = self.engine.add(identifier, options, sink.clone()).await?;
        self.install(&key, id, handle).await?;
        sink.open();
        Ok(())
    }

    pub async fn create_and_seed(&self, key: SessionKey, options: SeedOptions) -> Result<()> {
        if self.registry.contains(&key) {
            return Err(ControllerError::DuplicateKey(key));
        }

        info!("seeding session {} ({} files)", key, options.files.len());
        let id = self.registry.allocate_id();
        let sink = EventSink::for_session(key.clone(), id, self.events_tx.clone());
        let handle = self.engine.seed(options, sink.clone()).await?;
        self.install(&key, id, handle).await?;
        self.notifier
            .send(Notification::SessionCreated { key: key.clone() });
        sink.open();
        Ok(())
    }

    /// Register a freshly created handle, destroying it if the key was taken meanwhile.
    async fn install(
        &self,
        key: &str,
        id: SessionId,
        handle: Arc<dyn TorrentHandle>,
    ) -> Result<()> {
        if let Err(e) = self.registry.register_as(key, id, handle.clone()) {
            if let Err(destroy_err) = handle.destroy().await {
                warn!("failed to destroy orphaned handle for {}: {}", key, destroy_err);
            }
            return Err(e);
        }
        Ok(())
    }

    pub async fn stop_session(&self, key: &str) -> Result<()> {
        let handle = self.registry.lookup(key)?;
        self.servers.forget(key);

        let limit = self.config.stop_timeout();
        let destroyed = timeout(limit, handle.destroy()).await;
        self.registry.unregister(key)?;
        info!("session {} stopped", key);

        match destroyed {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ControllerError::Engine(e)),
            Err(_) => Err(ControllerError::StopTimeout {
                key: key.to_string(),
                secs: limit.as_secs(),
            }),
        }
    }

    pub async fn save_descriptor_file(&self, key: &str) -> Result<()> {
        let handle = self.registry.lookup(key)?;
        let hash = handle
            .content_hash()
            .ok_or_else(|| ControllerError::NotResolved(key.to_string()))?;
        let descriptor = handle
            .descriptor()
            .ok_or_else(|| ControllerError::NotResolved(key.to_string()))?;

        let saved = self.descriptors.save(&hash, &descriptor).await.map_err(|e| {
            warn!("session {} descriptor save failed: {}", key, e);
            e
        })?;
        self.notifier.send(Notification::DescriptorSaved {
            key: key.to_string(),
            path: saved.path,
        });
        Ok(())
    }

    /// Failures past the key lookup are logged and never reported.
    pub async fn generate_poster(&self, key: &str) -> Result<()> {
        let handle = self.registry.lookup(key)?;
        let hash = match handle.content_hash() {
            Some(hash) => hash,
            None => {
                warn!("session {} has no content hash, skipping poster", key);
                return Ok(());
            }
        };

        let poster = match self.poster_extractor.extract(handle).await {
            Ok(poster) => poster,
            Err(e) => {
                warn!("session {} poster extraction failed: {}", key, e);
                return Ok(());
            }
        };

        match self.posters.save(&hash, &poster.extension, &poster.bytes).await {
            Ok(path) => self.notifier.send(Notification::PosterSaved {
                key: key.to_string(),
                path,
            }),
            Err(e) => warn!("session {} poster save failed: {}", key, e),
        }
        Ok(())
    }

    /// Failures past the key and file lookup are logged and never reported.
    pub async fn get_audio_metadata(&self, key: &str, file_index: usize) -> Result<()> {
        let handle = self.registry.lookup(key)?;
        let reader =
            TorrentFileReader::open(handle, file_index).map_err(|_| ControllerError::FileIndex {
                key: key.to_string(),
                index: file_index,
            })?;
        let name = reader.name().to_string();

        match self.audio_reader.read(reader).await {
            Ok(metadata) => {
                debug!("audio metadata for {}: {:?}", name, metadata);
                self.notifier.send(Notification::AudioMetadata {
                    key: key.to_string(),
                    file_index,
                    metadata,
                });
            }
            Err(e) => warn!("session {} audio metadata for {} failed: {}", key, name, e),
        }
        Ok(())
    }

    pub async fn start_server(&self, key: &str, file_index: usize) -> Result<()> {
        if let Some(info) = self.servers.start(key, file_index).await? {
            self.notifier.send(Notification::ServerRunning(info));
        }
        Ok(())
    }

    pub async fn stop_server(&self) {
        if !self.servers.stop().await {
            debug!("stop-server with no server running");
        }
    }

    /// Stop the server and destroy every registered session.
    pub async fn shutdown_all(&self) {
        self.servers.stop().await;
        let limit = self.config.stop_timeout();
        for entry in self.registry.drain() {
            self.servers.forget(&entry.key);
            match timeout(limit, entry.handle.destroy()).await {
                Ok(Ok(())) => debug!("session {} destroyed on shutdown", entry.key),
                Ok(Err(e)) => warn!("session {} failed to stop: {}", entry.key, e),
                Err(_) => warn!("session {} did not stop within {:?}", entry.key, limit),
            }
        }
        info!("controller shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::StaticHandle;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Engine whose `add` blocks until released.
    struct GatedEngine {
        handle: Arc<StaticHandle>,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl TorrentEngine for GatedEngine {
        fn attach(&self, _events: EventSink) {}

        async fn add(
            &self,
            _identifier: &str,
            _options: AddOptions,
            _events: EventSink,
        ) -> anyhow::Result<Arc<dyn TorrentHandle>> {
            self.entered.notify_one();
            self.release.notified().await;
            let handle: Arc<dyn TorrentHandle> = self.handle.clone();
            Ok(handle)
        }

        async fn seed(
            &self,
            _options: SeedOptions,
            _events: EventSink,
        ) -> anyhow::Result<Arc<dyn TorrentHandle>> {
            Err(anyhow!("seeding not supported"))
        }
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_start() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(GatedEngine {
            handle: Arc::new(StaticHandle::default()),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let (notifications_tx, _notifications) = mpsc::unbounded_channel();
        let parts = ControllerParts::with_engine(
            ControllerConfig::rooted_at(dir.path()),
            engine.clone(),
        );
        let (controller, events) = Controller::new(parts, notifications_tx);

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let run = tokio::spawn(controller.clone().run(commands, events, shutdown.clone()));

        commands_tx
            .send(Command::StartSession {
                key: "k1".to_string(),
                identifier: "slow".to_string(),
                path: dir.path().join("downloads"),
                file_mod_times: Vec::new(),
            })
            .unwrap();
        engine.entered.notified().await;

        shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!run.is_finished());

        engine.release.notify_one();
        run.await.unwrap();
        assert!(controller.registry().is_empty());
        assert!(engine.handle.destroyed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_lane_waits_for_previous_command_on_key() {
        let mut lanes = CommandLanes::default();
        let (first_wait, first_done) = lanes.enter("k1");
        assert!(first_wait.is_none());

        let (second_wait, second_done) = lanes.enter("k1");
        let mut second_wait = second_wait.unwrap();
        assert!(matches!(second_wait.try_recv(), Err(TryRecvError::Empty)));

        // Other keys never wait.
        let (other_wait, _other_done) = lanes.enter("k2");
        assert!(other_wait.is_none());

        drop(first_done);
        assert!(matches!(second_wait.try_recv(), Err(TryRecvError::Closed)));

        // A finished lane is pruned on the next entry.
        drop(second_done);
        let (third_wait, _third_done) = lanes.enter("k1");
        assert!(third_wait.is_none());
    }
}
