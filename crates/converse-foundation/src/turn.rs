use crate::error::AppError;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Whose turn it is. Exactly one value at any instant, owned exclusively by
/// the orchestrator; everything else observes via `subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationTurn {
    Idle,
    Listening,
    CapturingUtterance,
    AwaitingReply,
    Speaking,
}

impl ConversationTurn {
    /// True while the microphone session should be open.
    pub fn capture_active(&self) -> bool {
        matches!(
            self,
            ConversationTurn::Listening | ConversationTurn::CapturingUtterance
        )
    }

    /// True while the output sink may be playing.
    pub fn playback_active(&self) -> bool {
        matches!(self, ConversationTurn::Speaking)
    }
}

pub struct TurnTracker {
    turn: Arc<RwLock<ConversationTurn>>,
    turn_tx: Sender<ConversationTurn>,
    turn_rx: Receiver<ConversationTurn>,
}

impl Default for TurnTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnTracker {
    pub fn new() -> Self {
        let (turn_tx, turn_rx) = crossbeam_channel::unbounded();
        Self {
            turn: Arc::new(RwLock::new(ConversationTurn::Idle)),
            turn_tx,
            turn_rx,
        }
    }

    /// Move to `next`, rejecting transitions outside the turn-taking cycle.
    /// Handlers are expected to check `current()` first; an error here means
    /// two code paths raced on the same resource.
    pub fn transition(&self, next: ConversationTurn) -> Result<(), AppError> {
        use ConversationTurn::*;
        let mut current = self.turn.write();

        let valid = matches!(
            (*current, next),
            (Idle, Listening)
                | (Listening, CapturingUtterance)
                | (Listening, Idle)
                | (CapturingUtterance, AwaitingReply)
                | (CapturingUtterance, Listening)
                | (CapturingUtterance, Idle)
                | (AwaitingReply, Speaking)
                | (AwaitingReply, Listening)
                | (AwaitingReply, Idle)
                | (Speaking, Listening)
                | (Speaking, Idle)
        );

        if !valid {
            return Err(AppError::Fatal(format!(
                "Invalid turn transition: {:?} -> {:?}",
                *current, next
            )));
        }

        tracing::debug!(target: "orchestrator", "Turn transition: {:?} -> {:?}", *current, next);
        *current = next;
        let _ = self.turn_tx.send(next);
        Ok(())
    }

    pub fn current(&self) -> ConversationTurn {
        *self.turn.read()
    }

    pub fn subscribe(&self) -> Receiver<ConversationTurn> {
        self.turn_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConversationTurn::*;

    #[test]
    fn full_cycle_is_valid() {
        let tracker = TurnTracker::new();
        for next in [Listening, CapturingUtterance, AwaitingReply, Speaking, Listening] {
            tracker.transition(next).unwrap();
        }
        assert_eq!(tracker.current(), Listening);
    }

    #[test]
    fn skipping_capture_is_rejected() {
        let tracker = TurnTracker::new();
        assert!(tracker.transition(Speaking).is_err());
        assert_eq!(tracker.current(), Idle);
    }

    #[test]
    fn interrupt_and_manual_stop_paths() {
        let tracker = TurnTracker::new();
        tracker.transition(Listening).unwrap();
        tracker.transition(CapturingUtterance).unwrap();
        // short manual stop discards straight back to Idle
        tracker.transition(Idle).unwrap();

        tracker.transition(Listening).unwrap();
        tracker.transition(CapturingUtterance).unwrap();
        tracker.transition(AwaitingReply).unwrap();
        tracker.transition(Speaking).unwrap();
        // user interrupt during playback re-arms listening
        tracker.transition(Listening).unwrap();
    }

    #[test]
    fn capture_and_playback_never_both_active() {
        for turn in [Idle, Listening, CapturingUtterance, AwaitingReply, Speaking] {
            assert!(!(turn.capture_active() && turn.playback_active()));
        }
    }
}
