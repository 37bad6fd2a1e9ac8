#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    Silence,
    Speech,
}

/// Signals from the VAD collaborator, timestamped on the capture clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VadEvent {
    SpeechStart {
        timestamp_ms: u64,
    },
    SpeechEnd {
        timestamp_ms: u64,
        duration_ms: u64,
    },
    /// The detector confirmed a false positive: speech ended before the
    /// minimum frame count was reached.
    Misfire {
        timestamp_ms: u64,
    },
}
