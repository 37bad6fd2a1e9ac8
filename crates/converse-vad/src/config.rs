use serde::{Deserialize, Serialize};

/// Sample rate the backend expects utterance audio at.
pub const TARGET_SAMPLE_RATE_HZ: u32 = 16_000;

/// Frame-level detection thresholds. Defaults follow the tuning the client
/// shipped with: eager onset, generous grace before confirming the end.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VadConfig {
    /// Probability at or above which a frame counts as speech.
    pub positive_speech_threshold: f32,
    /// Probability below which a frame counts toward ending the segment.
    pub negative_speech_threshold: f32,
    /// Consecutive-ish speech frames required for a segment to be real;
    /// shorter segments are reported as misfires.
    pub min_speech_frames: u32,
    /// Grace frames below the negative threshold before the end is confirmed.
    pub redemption_frames: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            positive_speech_threshold: 0.8,
            negative_speech_threshold: 0.3,
            min_speech_frames: 5,
            redemption_frames: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmenterConfig {
    pub vad: VadConfig,
    /// Frames of context retained before the detected speech onset.
    pub pre_speech_pad_frames: usize,
    /// Rate utterances are resampled to before encoding.
    pub target_sample_rate_hz: u32,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            vad: VadConfig::default(),
            pre_speech_pad_frames: 10,
            target_sample_rate_hz: TARGET_SAMPLE_RATE_HZ,
        }
    }
}
