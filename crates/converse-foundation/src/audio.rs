use serde::{Deserialize, Serialize};

/// One fixed-duration chunk of mono 16-bit PCM, stamped with the capture
/// clock. Produced by the capture thread, consumed by the segmenter.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub sample_rate_hz: u32,
    pub timestamp_ms: u64,
}

impl AudioFrame {
    pub fn duration_ms(&self) -> f32 {
        if self.sample_rate_hz == 0 {
            return 0.0;
        }
        self.samples.len() as f32 * 1000.0 / self.sample_rate_hz as f32
    }
}

/// Processing constraints requested for every microphone session. Chosen to
/// keep speech energy characteristics stable for VAD thresholds: echo
/// cancellation and noise suppression on, automatic gain control off.
/// cpal exposes no per-stream toggle for these, so they are recorded with
/// the session and logged at acquire time as the platform contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Approximate frame length handed to the VAD, in milliseconds.
    pub frame_ms: u32,
    pub constraints: CaptureConstraints,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            frame_ms: 32,
            constraints: CaptureConstraints::default(),
        }
    }
}
