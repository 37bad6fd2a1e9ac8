use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Shared counters for cross-thread conversation monitoring. Cloning is
/// cheap; all clones observe the same counters.
#[derive(Clone)]
pub struct SessionMetrics {
    // Capture
    pub frames_captured: Arc<AtomicU64>,
    pub frames_dropped: Arc<AtomicU64>,

    // Segmentation
    pub speech_starts: Arc<AtomicU64>,
    pub misfires: Arc<AtomicU64>,
    pub utterances_finalized: Arc<AtomicU64>,

    // Backend link
    pub utterances_sent: Arc<AtomicU64>,
    pub partials_received: Arc<AtomicU64>,
    pub replies_received: Arc<AtomicU64>,
    pub server_errors: Arc<AtomicU64>,

    // Playback
    pub replies_played: Arc<AtomicU64>,
    pub playback_interrupts: Arc<AtomicU64>,
    pub playback_rejections: Arc<AtomicU64>,

    // Orchestration
    pub turns_completed: Arc<AtomicU64>,
    pub failsafe_recoveries: Arc<AtomicU64>,
    pub last_turn_completed: Arc<RwLock<Option<Instant>>>,
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self {
            frames_captured: Arc::new(AtomicU64::new(0)),
            frames_dropped: Arc::new(AtomicU64::new(0)),
            speech_starts: Arc::new(AtomicU64::new(0)),
            misfires: Arc::new(AtomicU64::new(0)),
            utterances_finalized: Arc::new(AtomicU64::new(0)),
            utterances_sent: Arc::new(AtomicU64::new(0)),
            partials_received: Arc::new(AtomicU64::new(0)),
            replies_received: Arc::new(AtomicU64::new(0)),
            server_errors: Arc::new(AtomicU64::new(0)),
            replies_played: Arc::new(AtomicU64::new(0)),
            playback_interrupts: Arc::new(AtomicU64::new(0)),
            playback_rejections: Arc::new(AtomicU64::new(0)),
            turns_completed: Arc::new(AtomicU64::new(0)),
            failsafe_recoveries: Arc::new(AtomicU64::new(0)),
            last_turn_completed: Arc::new(RwLock::new(None)),
        }
    }
}

impl SessionMetrics {
    pub fn mark_turn_completed(&self) {
        self.turns_completed.fetch_add(1, Ordering::Relaxed);
        *self.last_turn_completed.write() = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_counters() {
        let metrics = SessionMetrics::default();
        let clone = metrics.clone();
        clone.utterances_sent.fetch_add(3, Ordering::Relaxed);
        assert_eq!(metrics.utterances_sent.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn turn_completion_stamps_time() {
        let metrics = SessionMetrics::default();
        assert!(metrics.last_turn_completed.read().is_none());
        metrics.mark_turn_completed();
        assert_eq!(metrics.turns_completed.load(Ordering::Relaxed), 1);
        assert!(metrics.last_turn_completed.read().is_some());
    }
}
