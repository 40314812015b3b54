//! Link statistics
//!
//! Lock-free counters shared by the pipeline activities, plus a periodic
//! reporter that logs per-second flux on both channels and the frame
//! accuracy ratio.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shared counter set. Producers and consumers touch different subsets; the
/// reporter prints whatever moved.
#[derive(Debug, Default)]
pub struct LinkStats {
    frames_captured: AtomicU64,
    frames_sent: AtomicU64,
    frames_completed: AtomicU64,
    frames_corrupt: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    data_bytes: AtomicU64,
    control_bytes: AtomicU64,
}

impl LinkStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_frame_captured(&self) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_frame_sent(&self, packets: u64, bytes: u64) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.packets_sent.fetch_add(packets, Ordering::Relaxed);
        self.data_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_frame_completed(&self) {
        self.frames_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_frame_corrupt(&self) {
        self.frames_corrupt.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_packet_received(&self, bytes: u64) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.data_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_control_bytes(&self, bytes: u64) {
        self.control_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_completed: self.frames_completed.load(Ordering::Relaxed),
            frames_corrupt: self.frames_corrupt.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            data_bytes: self.data_bytes.load(Ordering::Relaxed),
            control_bytes: self.control_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_captured: u64,
    pub frames_sent: u64,
    pub frames_completed: u64,
    pub frames_corrupt: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub data_bytes: u64,
    pub control_bytes: u64,
}

impl StatsSnapshot {
    /// Data-channel throughput since `previous`, in kB/s.
    pub fn data_flux_kbps(&self, previous: &Self, elapsed_secs: f64) -> f64 {
        flux_kbps(self.data_bytes, previous.data_bytes, elapsed_secs)
    }

    /// Control-channel throughput since `previous`, in kB/s.
    pub fn control_flux_kbps(&self, previous: &Self, elapsed_secs: f64) -> f64 {
        flux_kbps(self.control_bytes, previous.control_bytes, elapsed_secs)
    }

    /// Fraction of completed frames that survived decompress + decode.
    pub fn frame_accuracy(&self) -> f64 {
        if self.frames_completed == 0 {
            return 1.0;
        }
        let ok = self.frames_completed.saturating_sub(self.frames_corrupt);
        ok as f64 / self.frames_completed as f64
    }
}

fn flux_kbps(current: u64, previous: u64, elapsed_secs: f64) -> f64 {
    if elapsed_secs == 0.0 {
        return 0.0;
    }
    current.saturating_sub(previous) as f64 / elapsed_secs / 1024.0
}

/// Spawns a task that logs link flux once a second until cancelled.
pub fn spawn_reporter(
    role: &'static str,
    stats: Arc<LinkStats>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut previous = stats.snapshot();
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // immediate first tick

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let current = stats.snapshot();
            if current == previous {
                continue;
            }

            info!(
                role,
                data_kbps = format!("{:.1}", current.data_flux_kbps(&previous, 1.0)),
                control_kbps = format!("{:.1}", current.control_flux_kbps(&previous, 1.0)),
                frames_captured = current.frames_captured,
                frames_sent = current.frames_sent,
                frames_completed = current.frames_completed,
                accuracy = format!("{:.3}", current.frame_accuracy()),
                "link flux"
            );
            previous = current;
        }
    })
}
