use thiserror::Error;

#[derive(Error, Debug)]
pub enum LinkError {
    /// The connection is not open at send time. Sends are never queued.
    #[error("Not connected to backend")]
    NotConnected,

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<serde_json::Error> for LinkError {
    fn from(e: serde_json::Error) -> Self {
        LinkError::Protocol(e.to_string())
    }
}

impl From<base64::DecodeError> for LinkError {
    fn from(e: base64::DecodeError) -> Self {
        LinkError::Protocol(format!("invalid base64 audio: {e}"))
    }
}
