// Live transfer statistics — byte counters, sampled rates and peer counts per transfer.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Rates are recomputed at most once per window.
const RATE_WINDOW: Duration = Duration::from_secs(1);

struct RateSample {
    at: Instant,
    received_bytes: u64,
    uploaded_bytes: u64,
    download_bps: u64,
    upload_bps: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSnapshot {
    pub download_bps: u64,
    pub upload_bps: u64,
    pub received_bytes: u64,
    pub uploaded_bytes: u64,
    pub peers: usize,
}

pub struct StatsCollector {
    received_total: AtomicU64,
    uploaded_total: AtomicU64,
    peers: AtomicUsize,
    sample: Mutex<RateSample>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            received_total: AtomicU64::new(0),
            uploaded_total: AtomicU64::new(0),
            peers: AtomicUsize::new(0),
            sample: Mutex::new(RateSample {
                at: Instant::now(),
                received_bytes: 0,
                uploaded_bytes: 0,
                download_bps: 0,
                upload_bps: 0,
            }),
        }
    }

    pub fn record_received(&self, bytes: u64) {
        self.received_total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_uploaded(&self, bytes: u64) {
        self.uploaded_total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn set_peers(&self, peers: usize) {
        self.peers.store(peers, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RateSnapshot {
        let now = Instant::now();
        let received = self.received_total.load(Ordering::Relaxed);
        let uploaded = self.uploaded_total.load(Ordering::Relaxed);

        let (download_bps, upload_bps) = {
            let mut sample = self.sample.lock();
            let elapsed = now.duration_since(sample.at);
            if elapsed >= RATE_WINDOW {
                let secs = elapsed.as_secs_f64();
                sample.download_bps =
                    ((received - sample.received_bytes) as f64 / secs) as u64;
                sample.upload_bps = ((uploaded - sample.uploaded_bytes) as f64 / secs) as u64;
                sample.at = now;
                sample.received_bytes = received;
                sample.uploaded_bytes = uploaded;
            }
            (sample.download_bps, sample.upload_bps)
        };

        RateSnapshot {
            download_bps,
            upload_bps,
            received_bytes: received,
            uploaded_bytes: uploaded,
            peers: self.peers.load(Ordering::Relaxed),
        }
    }

    pub fn total_received(&self) -> u64 {
        self.received_total.load(Ordering::Relaxed)
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}
