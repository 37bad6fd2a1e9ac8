use crate::types::{VadEvent, VadState};
use converse_foundation::AudioFrame;

/// The VAD collaborator boundary.
///
/// Implementations consume capture frames and emit speech-start / speech-end
/// / misfire signals. The segmenter owns one engine and is the only caller.
pub trait VadEngine: Send {
    fn process(&mut self, frame: &AudioFrame) -> Option<VadEvent>;
    fn reset(&mut self);
    fn current_state(&self) -> VadState;
}
