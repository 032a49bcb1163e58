//! Pipeline counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use serde::{Deserialize, Serialize};

/// Counters shared by the facade and its workers
#[derive(Default)]
pub struct PipelineMetrics {
    pub preview_frames: AtomicU64,
    pub preview_failures: AtomicU64,

    pub recording_delivered: AtomicU64,
    pub recording_released: AtomicU64,
    pub recording_requeued: AtomicU64,

    pub pictures_taken: AtomicU64,
    pub pictures_failed: AtomicU64,
    pub total_capture_ms: AtomicU64,

    pub focus_success: AtomicU64,
    pub focus_failure: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_picture(&self, success: bool, latency_ms: u64) {
        if success {
            self.pictures_taken.fetch_add(1, Ordering::Relaxed);
            self.total_capture_ms.fetch_add(latency_ms, Ordering::Relaxed);
        } else {
            self.pictures_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_focus(&self, success: bool) {
        if success {
            self.focus_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.focus_failure.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let taken = self.pictures_taken.load(Ordering::Relaxed);
        let capture_ms = self.total_capture_ms.load(Ordering::Relaxed);

        MetricsSnapshot {
            preview: PreviewMetrics {
                frames: self.preview_frames.load(Ordering::Relaxed),
                failures: self.preview_failures.load(Ordering::Relaxed),
            },
            recording: RecordingMetrics {
                delivered: self.recording_delivered.load(Ordering::Relaxed),
                released: self.recording_released.load(Ordering::Relaxed),
                requeued: self.recording_requeued.load(Ordering::Relaxed),
            },
            picture: PictureMetrics {
                taken,
                failed: self.pictures_failed.load(Ordering::Relaxed),
                avg_capture_ms: if taken > 0 { capture_ms / taken } else { 0 },
            },
            focus: FocusMetrics {
                success: self.focus_success.load(Ordering::Relaxed),
                failure: self.focus_failure.load(Ordering::Relaxed),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub preview: PreviewMetrics,
    pub recording: RecordingMetrics,
    pub picture: PictureMetrics,
    pub focus: FocusMetrics,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreviewMetrics {
    pub frames: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordingMetrics {
    pub delivered: u64,
    pub released: u64,
    /// Frames requeued at once because no consumer was registered.
    pub requeued: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PictureMetrics {
    pub taken: u64,
    pub failed: u64,
    pub avg_capture_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FocusMetrics {
    pub success: u64,
    pub failure: u64,
}

/// Timer for tracking capture latency
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
