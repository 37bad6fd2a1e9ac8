pub mod classifier;
pub mod config;
pub mod engine;
pub mod resample;
pub mod segmenter;
pub mod threshold;
pub mod types;

pub use classifier::{EnergyClassifier, FrameClassifier};
pub use config::{SegmenterConfig, VadConfig, TARGET_SAMPLE_RATE_HZ};
pub use engine::VadEngine;
pub use segmenter::{
    SegmenterCommand, SegmenterEvent, SpeechSegmenter, Utterance,
};
pub use threshold::ThresholdVad;
pub use types::{VadEvent, VadState};
