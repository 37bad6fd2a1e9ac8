/// Per-frame speech scoring. The real model is an external collaborator;
/// anything that can map a frame of PCM to a [0, 1] speech probability can
/// drive the threshold state machine.
pub trait FrameClassifier: Send {
    fn predict(&mut self, frame: &[i16]) -> f32;
    fn reset(&mut self) {}
}

/// Energy-based stand-in classifier: frame RMS in dBFS mapped linearly onto
/// [0, 1] between a silence floor and a speech ceiling. Good enough to drive
/// the segmenter on close-mic audio; swap in a model-backed classifier for
/// anything noisier.
pub struct EnergyClassifier {
    floor_dbfs: f32,
    ceiling_dbfs: f32,
}

impl EnergyClassifier {
    pub fn new(floor_dbfs: f32, ceiling_dbfs: f32) -> Self {
        Self {
            floor_dbfs,
            ceiling_dbfs,
        }
    }

    pub fn dbfs(frame: &[i16]) -> f32 {
        if frame.is_empty() {
            return -100.0;
        }
        let sum_squares: i64 = frame
            .iter()
            .map(|&sample| {
                let s = sample as i64;
                s * s
            })
            .sum();
        let mean_square = sum_squares as f64 / frame.len() as f64;
        let rms = (mean_square.sqrt() / 32768.0) as f32;
        if rms <= 1e-10 {
            return -100.0;
        }
        20.0 * rms.log10()
    }
}

impl Default for EnergyClassifier {
    fn default() -> Self {
        Self::new(-55.0, -20.0)
    }
}

impl FrameClassifier for EnergyClassifier {
    fn predict(&mut self, frame: &[i16]) -> f32 {
        let db = Self::dbfs(frame);
        ((db - self.floor_dbfs) / (self.ceiling_dbfs - self.floor_dbfs)).clamp(0.0, 1.0)
    }
}
