// Worker wiring — channels around a running controller plus the JSON-lines codec.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::controller::{Controller, ControllerParts};
use crate::protocol::{Command, Notification};

/// A controller running on its own task.
pub struct WorkerHandle {
    pub commands: mpsc::UnboundedSender<Command>,
    pub notifications: mpsc::UnboundedReceiver<Notification>,
    pub controller: Arc<Controller>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow!("worker has stopped"))
    }

    /// Move the notification stream out, leaving a closed receiver behind.
    pub fn take_notifications(&mut self) -> mpsc::UnboundedReceiver<Notification> {
        let (_, closed) = mpsc::unbounded_channel();
        std::mem::replace(&mut self.notifications, closed)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop the controller and wait until every session is destroyed.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            task.await.context("worker task panicked")?;
        }
        Ok(())
    }
}

/// Start a controller and announce it with a `worker-ready` notification.
pub fn spawn_worker(parts: ControllerParts) -> WorkerHandle {
    let (notifications_tx, notifications) = mpsc::unbounded_channel();
    let (commands, commands_rx) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();

    let _ = notifications_tx.send(Notification::WorkerReady);
    let (controller, events_rx) = Controller::new(parts, notifications_tx);
    let task = tokio::spawn(
        controller
            .clone()
            .run(commands_rx, events_rx, shutdown.clone()),
    );
    info!("worker started");

    WorkerHandle {
        commands,
        notifications,
        controller,
        shutdown,
        task: Some(task),
    }
}

pub fn decode_command(line: &str) -> Result<Command> {
    serde_json::from_str(line.trim()).with_context(|| format!("invalid command: {}", line.trim()))
}

pub fn encode_notification(notification: &Notification) -> Result<String> {
    serde_json::to_string(notification).context("failed to encode notification")
}
