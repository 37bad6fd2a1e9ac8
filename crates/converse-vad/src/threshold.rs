use crate::classifier::FrameClassifier;
use crate::config::VadConfig;
use crate::engine::VadEngine;
use crate::types::{VadEvent, VadState};
use converse_foundation::AudioFrame;

/// Threshold state machine over per-frame speech probabilities.
///
/// Onset is eager: the first frame at or above the positive threshold opens
/// a segment. The end is confirmed only after `redemption_frames` frames
/// below the negative threshold; frames between the two thresholds keep the
/// segment alive without counting as speech. Segments that close with fewer
/// than `min_speech_frames` speech frames are misfires.
pub struct ThresholdVad {
    cfg: VadConfig,
    classifier: Box<dyn FrameClassifier>,
    state: VadState,
    clock_ms: f64,
    segment_start_ms: u64,
    speech_frames: u32,
    redemption: u32,
}

impl ThresholdVad {
    pub fn new(cfg: VadConfig, classifier: Box<dyn FrameClassifier>) -> Self {
        Self {
            cfg,
            classifier,
            state: VadState::Silence,
            clock_ms: 0.0,
            segment_start_ms: 0,
            speech_frames: 0,
            redemption: 0,
        }
    }

    fn close_segment(&mut self) -> VadEvent {
        let timestamp_ms = self.clock_ms as u64;
        let event = if self.speech_frames >= self.cfg.min_speech_frames {
            VadEvent::SpeechEnd {
                timestamp_ms,
                duration_ms: timestamp_ms.saturating_sub(self.segment_start_ms).max(1),
            }
        } else {
            VadEvent::Misfire { timestamp_ms }
        };
        self.state = VadState::Silence;
        self.speech_frames = 0;
        self.redemption = 0;
        event
    }
}

impl VadEngine for ThresholdVad {
    fn process(&mut self, frame: &AudioFrame) -> Option<VadEvent> {
        self.clock_ms += frame.duration_ms() as f64;
        let probability = self.classifier.predict(&frame.samples);

        match self.state {
            VadState::Silence => {
                if probability >= self.cfg.positive_speech_threshold {
                    self.state = VadState::Speech;
                    self.segment_start_ms = self.clock_ms as u64;
                    self.speech_frames = 1;
                    self.redemption = 0;
                    return Some(VadEvent::SpeechStart {
                        timestamp_ms: self.segment_start_ms,
                    });
                }
                None
            }
            VadState::Speech => {
                if probability >= self.cfg.positive_speech_threshold {
                    self.speech_frames += 1;
                    self.redemption = 0;
                    None
                } else if probability < self.cfg.negative_speech_threshold {
                    self.redemption += 1;
                    if self.redemption >= self.cfg.redemption_frames {
                        return Some(self.close_segment());
                    }
                    None
                } else {
                    // Between thresholds: neither speech nor silence.
                    self.redemption = 0;
                    None
                }
            }
        }
    }

    fn reset(&mut self) {
        self.state = VadState::Silence;
        self.speech_frames = 0;
        self.redemption = 0;
        self.classifier.reset();
    }

    fn current_state(&self) -> VadState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Classifier that replays a scripted probability sequence.
    struct Scripted {
        probs: Vec<f32>,
        at: usize,
    }

    impl FrameClassifier for Scripted {
        fn predict(&mut self, _frame: &[i16]) -> f32 {
            let p = self.probs.get(self.at).copied().unwrap_or(0.0);
            self.at += 1;
            p
        }
    }

    fn vad(probs: Vec<f32>, cfg: VadConfig) -> ThresholdVad {
        ThresholdVad::new(cfg, Box::new(Scripted { probs, at: 0 }))
    }

    fn frame() -> AudioFrame {
        AudioFrame {
            samples: vec![0; 512],
            sample_rate_hz: 16_000,
            timestamp_ms: 0,
        }
    }

    #[test]
    fn onset_is_eager() {
        let mut v = vad(vec![0.1, 0.9], VadConfig::default());
        assert_eq!(v.process(&frame()), None);
        assert!(matches!(
            v.process(&frame()),
            Some(VadEvent::SpeechStart { .. })
        ));
        assert_eq!(v.current_state(), VadState::Speech);
    }

    #[test]
    fn short_segment_is_a_misfire() {
        let cfg = VadConfig {
            min_speech_frames: 5,
            redemption_frames: 2,
            ..Default::default()
        };
        let mut probs = vec![0.9, 0.9];
        probs.extend([0.0, 0.0]);
        let mut v = vad(probs, cfg);
        let mut events = Vec::new();
        for _ in 0..4 {
            if let Some(e) = v.process(&frame()) {
                events.push(e);
            }
        }
        assert!(matches!(events[0], VadEvent::SpeechStart { .. }));
        assert!(matches!(events[1], VadEvent::Misfire { .. }));
        assert_eq!(v.current_state(), VadState::Silence);
    }

    #[test]
    fn redemption_grace_keeps_segment_alive() {
        let cfg = VadConfig {
            min_speech_frames: 2,
            redemption_frames: 3,
            ..Default::default()
        };
        // Dip below the negative threshold for two frames, then recover.
        let mut v = vad(vec![0.9, 0.9, 0.1, 0.1, 0.9, 0.9], cfg);
        let mut events = Vec::new();
        for _ in 0..6 {
            if let Some(e) = v.process(&frame()) {
                events.push(e);
            }
        }
        assert_eq!(events.len(), 1);
        assert_eq!(v.current_state(), VadState::Speech);
    }

    #[test]
    fn confirmed_segment_ends_with_duration() {
        let cfg = VadConfig {
            min_speech_frames: 3,
            redemption_frames: 2,
            ..Default::default()
        };
        let mut probs = vec![0.9; 10];
        probs.extend(vec![0.0; 2]);
        let mut v = vad(probs, cfg);
        let mut end = None;
        for _ in 0..12 {
            if let Some(VadEvent::SpeechEnd { duration_ms, .. }) = v.process(&frame()) {
                end = Some(duration_ms);
            }
        }
        // 11 frames of 32ms elapsed between onset and confirmation.
        let duration = end.expect("expected SpeechEnd");
        assert!(duration >= 300, "duration {duration}ms too short");
    }

    #[test]
    fn mid_band_frames_reset_redemption() {
        let cfg = VadConfig {
            min_speech_frames: 1,
            redemption_frames: 2,
            ..Default::default()
        };
        // low, mid, low, mid... never two consecutive low frames.
        let mut v = vad(vec![0.9, 0.1, 0.5, 0.1, 0.5, 0.1, 0.5], cfg);
        let mut events = Vec::new();
        for _ in 0..7 {
            if let Some(e) = v.process(&frame()) {
                events.push(e);
            }
        }
        assert_eq!(events.len(), 1, "segment must stay open: {events:?}");
        assert_eq!(v.current_state(), VadState::Speech);
    }
}
