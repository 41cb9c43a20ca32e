use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;

/// Local loudness above this is reported as speaking.
pub const SPEAKING_THRESHOLD: f32 = 0.1;

const SAMPLE_INTERVAL: Duration = Duration::from_millis(30);

/// Platform seam for reading the local microphone's current loudness,
/// normalized to `[0, 1]`.
pub trait LevelProbe: Send + Sync {
    fn level(&self) -> f32;
}

/// Samples the local microphone loudness on a fixed short interval and
/// feeds it to a sink for the lifetime of one attachment.
///
/// Attach is idempotent: re-attaching while attached is a no-op, so a
/// duplicate local-track-published event can never stack a second sampling
/// task on top of the first. Detach aborts the task and must run on every
/// session teardown.
pub struct AudioLevelMonitor {
    task: Mutex<Option<JoinHandle<()>>>,
    interval: Duration,
    attach_generation: AtomicU64,
}

impl AudioLevelMonitor {
    pub fn new() -> Self {
        Self::with_interval(SAMPLE_INTERVAL)
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            task: Mutex::new(None),
            interval,
            attach_generation: AtomicU64::new(0),
        }
    }

    /// Start sampling `probe`, delivering each clamped reading to `sink`.
    /// No-op when already attached.
    pub fn attach(
        &self,
        probe: std::sync::Arc<dyn LevelProbe>,
        sink: impl Fn(f32) + Send + Sync + 'static,
    ) {
        let mut task = self.task.lock().unwrap();
        if task.is_some() {
            tracing::debug!("level monitor already attached, ignoring");
            return;
        }

        self.attach_generation.fetch_add(1, Ordering::SeqCst);
        let interval = self.interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                sink(probe.level().clamp(0.0, 1.0));
            }
        }));
    }

    /// Stop sampling and release the task. Safe to call when not attached.
    pub fn detach(&self) {
        if let Some(handle) = self.task.lock().unwrap().take() {
            handle.abort();
        }
    }

    pub fn is_attached(&self) -> bool {
        self.task.lock().unwrap().is_some()
    }

    /// Number of sampling tasks ever started. One attachment starts
    /// exactly one task.
    pub fn attach_count(&self) -> u64 {
        self.attach_generation.load(Ordering::SeqCst)
    }
}

impl Drop for AudioLevelMonitor {
    fn drop(&mut self) {
        self.detach();
    }
}

impl Default for AudioLevelMonitor {
    fn default() -> Self {
        Self::new()
    }
}
