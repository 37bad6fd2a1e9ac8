use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Capture subsystem error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Playback subsystem error: {0}")]
    Playback(#[from] PlaybackError),

    #[error("Backend link error: {0}")]
    Link(String),

    #[error("Backend reported failure: {0}")]
    Server(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timed out waiting for {what} after {after:?}")]
    Timeout { what: &'static str, after: Duration },

    #[error("Fatal error, cannot recover: {0}")]
    Fatal(String),
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Microphone access denied: {reason}")]
    PermissionDenied { reason: String },

    #[error("Device not found: {name:?}")]
    DeviceNotFound { name: Option<String> },

    #[error("Device disconnected")]
    DeviceDisconnected,

    #[error("Format not supported: {format}")]
    FormatNotSupported { format: String },

    #[error("Buffer overflow, dropped {count} frames")]
    BufferOverflow { count: usize },

    #[error("CPAL error: {0}")]
    Cpal(#[from] cpal::StreamError),

    #[error("Default stream config error: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),

    #[error("Build stream error: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("Play stream error: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("Supported stream configs error: {0}")]
    SupportedStreamConfigs(#[from] cpal::SupportedStreamConfigsError),

    #[error("Fatal capture error, cannot recover: {0}")]
    Fatal(String),
}

#[derive(Error, Debug)]
pub enum PlaybackError {
    #[error("Playback start rejected: {0}")]
    Rejected(String),

    #[error("Audio decode failed: {0}")]
    Decode(String),

    #[error("Output device unavailable: {0}")]
    DeviceUnavailable(String),
}

/// What the orchestrator does after a failure is caught at its async
/// boundary. Every error maps to a state the system can keep running from;
/// only mic denial waits on the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Return to Idle and wait for an explicit user retry.
    ReturnToIdle,
    /// Release whatever is held and re-arm capture (back to Listening).
    RearmCapture,
    /// Give up the turn, surface the error, keep the conversation alive.
    SurfaceAndRearm,
}

impl AppError {
    pub fn recovery_action(&self) -> RecoveryAction {
        match self {
            AppError::Capture(CaptureError::PermissionDenied { .. }) => {
                RecoveryAction::ReturnToIdle
            }
            AppError::Capture(_) => RecoveryAction::ReturnToIdle,
            AppError::Link(_) | AppError::Server(_) => RecoveryAction::SurfaceAndRearm,
            AppError::Playback(_) => RecoveryAction::RearmCapture,
            AppError::Timeout { .. } => RecoveryAction::RearmCapture,
            AppError::Config(_) | AppError::Fatal(_) => RecoveryAction::ReturnToIdle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_denial_requires_user_action() {
        let err = AppError::Capture(CaptureError::PermissionDenied {
            reason: "denied by portal".into(),
        });
        assert_eq!(err.recovery_action(), RecoveryAction::ReturnToIdle);
    }

    #[test]
    fn turn_scoped_failures_rearm() {
        assert_eq!(
            AppError::Server("overloaded".into()).recovery_action(),
            RecoveryAction::SurfaceAndRearm
        );
        assert_eq!(
            AppError::Playback(PlaybackError::Rejected("no sink".into())).recovery_action(),
            RecoveryAction::RearmCapture
        );
        assert_eq!(
            AppError::Timeout {
                what: "playback completion",
                after: Duration::from_secs(60)
            }
            .recovery_action(),
            RecoveryAction::RearmCapture
        );
    }
}
