//! Torrent worker process
//!
//! Speaks JSON lines with its host: one command per stdin line, one
//! notification per stdout line. Logs go to stderr.
//!
//! ```bash
//! ma-torrent-worker --config worker.json
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};

use ma_torrent_engine::api::simple::init_tracing;
use ma_torrent_engine::api::worker_api::{decode_command, encode_notification, spawn_worker};
use ma_torrent_engine::config::WorkerConfig;
use ma_torrent_engine::controller::ControllerParts;
use ma_torrent_engine::engine::loopback::LoopbackEngine;

const WRITER_DRAIN: Duration = Duration::from_secs(2);

/// Torrent session worker
#[derive(Parser, Debug)]
#[command(name = "ma-torrent-worker")]
#[command(about = "Background torrent session controller speaking JSON lines")]
struct Args {
    /// JSON config file; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => WorkerConfig::load(path)?,
        None => WorkerConfig::default(),
    };
    info!(
        "descriptors in {}, posters in {}",
        config.controller.descriptor_dir.display(),
        config.controller.poster_dir.display()
    );

    let engine = Arc::new(LoopbackEngine::new(config.loopback));
    let mut worker = spawn_worker(ControllerParts::with_engine(config.controller, engine));

    let mut notifications = worker.take_notifications();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(notification) = notifications.recv().await {
            let line = match encode_notification(&notification) {
                Ok(line) => line,
                Err(e) => {
                    error!("{:#}", e);
                    continue;
                }
            };
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                warn!("stdout closed, stopping notification writer");
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match decode_command(&line) {
            Ok(command) => worker.send(command)?,
            Err(e) => warn!("{:#}", e),
        }
    }

    info!("stdin closed, shutting down");
    worker.shutdown().await?;
    drop(worker);
    if tokio::time::timeout(WRITER_DRAIN, writer).await.is_err() {
        warn!("notification writer did not drain in time");
    }
    Ok(())
}
