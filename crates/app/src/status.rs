//! Human-readable status surface. Purely observational: derived from turn
//! state and error events, never consulted by the state machine itself.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Idle,
    /// Microphone acquisition and detector arming are pending.
    Initializing,
    Listening,
    VoiceDetected,
    Processing,
    Thinking,
    Speaking,
    /// Autoplay was refused; the reply is available behind a manual trigger.
    TapToPlay,
    /// Shown briefly when the user cuts the reply off.
    ResponseStopped,
    Error(String),
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Idle => write!(f, "Idle"),
            Status::Initializing => write!(f, "Initializing voice detection..."),
            Status::Listening => write!(f, "Listening..."),
            Status::VoiceDetected => write!(f, "Voice detected..."),
            Status::Processing => write!(f, "Processing your voice..."),
            Status::Thinking => write!(f, "AI is thinking..."),
            Status::Speaking => write!(f, "AI is speaking..."),
            Status::TapToPlay => write!(f, "Click to play AI response"),
            Status::ResponseStopped => write!(f, "AI response stopped"),
            Status::Error(message) => write!(f, "Error: {message}"),
        }
    }
}
