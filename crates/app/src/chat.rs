//! Append-only conversation history.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub speaker: Speaker,
    pub text: String,
}

/// The conversation history plus the transient partial transcript of the
/// in-flight utterance. Messages only grow; once appended they are never
/// mutated or reordered. Partials are display state, not history.
#[derive(Debug, Default)]
pub struct Transcript {
    messages: Vec<ChatMessage>,
    last_partial: Option<String>,
}

impl Transcript {
    pub fn append(&mut self, speaker: Speaker, text: impl Into<String>) {
        self.messages.push(ChatMessage {
            speaker,
            text: text.into(),
        });
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn set_partial(&mut self, text: impl Into<String>) {
        self.last_partial = Some(text.into());
    }

    pub fn take_partial(&mut self) -> Option<String> {
        self.last_partial.take()
    }

    pub fn partial(&self) -> Option<&str> {
        self.last_partial.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_accumulate_in_order() {
        let mut transcript = Transcript::default();
        transcript.append(Speaker::User, "hello");
        transcript.append(Speaker::Assistant, "hi there");
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript.messages()[0].speaker, Speaker::User);
        assert_eq!(transcript.messages()[1].speaker, Speaker::Assistant);
    }

    #[test]
    fn partial_is_transient() {
        let mut transcript = Transcript::default();
        transcript.set_partial("hel");
        transcript.set_partial("hello");
        assert_eq!(transcript.partial(), Some("hello"));
        assert_eq!(transcript.take_partial(), Some("hello".to_string()));
        assert_eq!(transcript.take_partial(), None);
        assert!(transcript.is_empty());
    }
}
