use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;

use crate::error::LinkError;

/// Wire format of inbound backend messages.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Partial/live transcript of the in-flight utterance.
    Transcription { text: String },
    /// Final reply text plus base64-encoded synthesized audio.
    AiResponse { text: String, audio: String },
    /// Turn-scoped failure.
    Error { message: String },
}

/// Parsed inbound event as the orchestrator consumes it.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEvent {
    Partial(String),
    FinalReply { text: String, audio: Vec<u8> },
    ServerError(String),
}

pub fn parse_message(raw: &str) -> Result<TranscriptEvent, LinkError> {
    let message: ServerMessage = serde_json::from_str(raw)?;
    Ok(match message {
        ServerMessage::Transcription { text } => TranscriptEvent::Partial(text),
        ServerMessage::AiResponse { text, audio } => TranscriptEvent::FinalReply {
            text,
            audio: BASE64.decode(audio.as_bytes())?,
        },
        ServerMessage::Error { message } => TranscriptEvent::ServerError(message),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_transcription() {
        let event = parse_message(r#"{"type":"transcription","text":"hello there"}"#).unwrap();
        assert_eq!(event, TranscriptEvent::Partial("hello there".into()));
    }

    #[test]
    fn parses_ai_response_with_audio() {
        let raw = r#"{"type":"ai_response","text":"hi","audio":"AQID"}"#;
        match parse_message(raw).unwrap() {
            TranscriptEvent::FinalReply { text, audio } => {
                assert_eq!(text, "hi");
                assert_eq!(audio, vec![1, 2, 3]);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn parses_error() {
        let event = parse_message(r#"{"type":"error","message":"overloaded"}"#).unwrap();
        assert_eq!(event, TranscriptEvent::ServerError("overloaded".into()));
    }

    #[test]
    fn unknown_tag_is_a_protocol_error() {
        let err = parse_message(r#"{"type":"heartbeat"}"#).unwrap_err();
        assert!(matches!(err, LinkError::Protocol(_)));
    }

    #[test]
    fn bad_base64_is_a_protocol_error() {
        let raw = r#"{"type":"ai_response","text":"hi","audio":"%%%"}"#;
        let err = parse_message(raw).unwrap_err();
        assert!(matches!(err, LinkError::Protocol(_)));
    }
}
