//! The turn-taking state machine.
//!
//! One task owns the canonical `ConversationTurn` and every resource
//! decision. Collaborators (capture thread, segmenter, backend link,
//! playback thread) emit typed events into this loop and only ever mutate
//! their resource on a command issued from here. Handlers re-check the
//! current turn before acting, so events that arrive late (a speech-end
//! after a manual stop, a reply after the user gave up) fall through as
//! no-ops instead of corrupting state.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use converse_audio::{CaptureCommand, CaptureEvent, PlaybackCommand, PlaybackEvent};
use converse_foundation::{AppError, ConversationTurn, RecoveryAction, TurnTracker};
use converse_link::{LinkCommand, LinkEvent, TranscriptEvent};
use converse_telemetry::SessionMetrics;
use converse_vad::{SegmenterCommand, SegmenterEvent};

use crate::chat::{Speaker, Transcript};
use crate::status::Status;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCommand {
    Start,
    Stop,
    Interrupt,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Requested input device; `None` is the system default.
    pub device: Option<String>,
    /// Manual stops earlier than this discard the segment unsent.
    pub min_turn: Duration,
    /// After a short manual stop, Start commands are ignored for this long.
    pub cooldown: Duration,
    /// Upper bound on one capture segment when the detector never confirms
    /// the end; fires a flush.
    pub silence_timeout: Duration,
    /// Upper bound on Speaking without a completion signal.
    pub failsafe_timeout: Duration,
    /// Pause between playback completion and reacquiring the microphone.
    pub resume_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            device: None,
            min_turn: Duration::from_millis(5_000),
            cooldown: Duration::from_millis(1_500),
            silence_timeout: Duration::from_secs(10),
            failsafe_timeout: Duration::from_secs(60),
            resume_delay: Duration::from_millis(300),
        }
    }
}

/// Event receivers from every collaborator plus command senders back to
/// them. Built by the runtime; tests wire both ends directly.
pub struct OrchestratorChannels {
    pub user_rx: mpsc::Receiver<UserCommand>,
    pub capture_rx: mpsc::Receiver<CaptureEvent>,
    pub segmenter_rx: mpsc::Receiver<SegmenterEvent>,
    pub link_rx: mpsc::Receiver<LinkEvent>,
    pub playback_rx: mpsc::Receiver<PlaybackEvent>,
    pub capture_tx: mpsc::Sender<CaptureCommand>,
    pub segmenter_tx: mpsc::Sender<SegmenterCommand>,
    pub link_tx: mpsc::Sender<LinkCommand>,
    pub playback_tx: mpsc::Sender<PlaybackCommand>,
}

pub struct ConversationOrchestrator {
    cfg: OrchestratorConfig,
    ch: OrchestratorChannels,
    turn: TurnTracker,
    transcript: Arc<RwLock<Transcript>>,
    metrics: Arc<SessionMetrics>,
    status_tx: watch::Sender<Status>,
    turn_tx: watch::Sender<ConversationTurn>,

    /// Exactly one utterance may be awaiting a reply.
    utterance_in_flight: bool,
    capture_started_at: Option<Instant>,
    silence_deadline: Option<Instant>,
    failsafe_deadline: Option<Instant>,
    resume_deadline: Option<Instant>,
    cooldown_until: Option<Instant>,
}

impl ConversationOrchestrator {
    pub fn new(
        cfg: OrchestratorConfig,
        ch: OrchestratorChannels,
        transcript: Arc<RwLock<Transcript>>,
        metrics: Arc<SessionMetrics>,
    ) -> (Self, watch::Receiver<Status>, watch::Receiver<ConversationTurn>) {
        let (status_tx, status_rx) = watch::channel(Status::Idle);
        let (turn_tx, turn_rx) = watch::channel(ConversationTurn::Idle);
        (
            Self {
                cfg,
                ch,
                turn: TurnTracker::new(),
                transcript,
                metrics,
                status_tx,
                turn_tx,
                utterance_in_flight: false,
                capture_started_at: None,
                silence_deadline: None,
                failsafe_deadline: None,
                resume_deadline: None,
                cooldown_until: None,
            },
            status_rx,
            turn_rx,
        )
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        info!(target: "orchestrator", "Conversation orchestrator started");
        loop {
            let silence = deadline(self.silence_deadline);
            let failsafe = deadline(self.failsafe_deadline);
            let resume = deadline(self.resume_deadline);

            tokio::select! {
                Some(cmd) = self.ch.user_rx.recv() => self.handle_user(cmd).await,
                Some(ev) = self.ch.capture_rx.recv() => self.handle_capture(ev).await,
                Some(ev) = self.ch.segmenter_rx.recv() => self.handle_segmenter(ev).await,
                Some(ev) = self.ch.link_rx.recv() => self.handle_link(ev).await,
                Some(ev) = self.ch.playback_rx.recv() => self.handle_playback(ev).await,
                _ = silence => self.on_silence_timeout().await,
                _ = failsafe => self.on_failsafe().await,
                _ = resume => self.on_resume().await,
                else => {
                    info!(target: "orchestrator", "All event sources closed, exiting");
                    break;
                }
            }
        }
    }

    fn set_turn(&mut self, next: ConversationTurn) {
        if let Err(e) = self.turn.transition(next) {
            warn!(target: "orchestrator", "{e}");
            return;
        }
        let _ = self.turn_tx.send(next);
    }

    fn set_status(&self, status: Status) {
        let _ = self.status_tx.send(status);
    }

    // ---- user commands ---------------------------------------------------

    async fn handle_user(&mut self, cmd: UserCommand) {
        match cmd {
            UserCommand::Start => self.on_start().await,
            UserCommand::Stop => self.on_stop().await,
            UserCommand::Interrupt => self.on_interrupt().await,
        }
    }

    async fn on_start(&mut self) {
        if let Some(until) = self.cooldown_until {
            if Instant::now() < until {
                debug!(target: "orchestrator", "Start ignored during cooldown");
                return;
            }
            self.cooldown_until = None;
        }
        if self.turn.current() != ConversationTurn::Idle {
            debug!(target: "orchestrator", "Start ignored in {:?}", self.turn.current());
            return;
        }
        self.set_turn(ConversationTurn::Listening);
        self.set_status(Status::Initializing);
        let _ = self
            .ch
            .capture_tx
            .send(CaptureCommand::Acquire {
                device: self.cfg.device.clone(),
            })
            .await;
    }

    async fn on_stop(&mut self) {
        match self.turn.current() {
            ConversationTurn::Idle => {}
            ConversationTurn::Listening | ConversationTurn::CapturingUtterance => {
                let long_enough = self
                    .capture_started_at
                    .map(|t| t.elapsed() >= self.cfg.min_turn)
                    .unwrap_or(false);

                if long_enough && self.turn.current() == ConversationTurn::CapturingUtterance {
                    // Long enough to be deliberate speech: commit what we
                    // have instead of discarding it.
                    debug!(target: "orchestrator", "Manual stop commits the buffered segment");
                    self.set_status(Status::Processing);
                    self.silence_deadline = None;
                    let _ = self.ch.segmenter_tx.send(SegmenterCommand::Flush).await;
                } else {
                    debug!(
                        target: "orchestrator",
                        "Manual stop discards the segment (long_enough={})", long_enough
                    );
                    self.silence_deadline = None;
                    self.teardown_capture().await;
                    self.set_turn(ConversationTurn::Idle);
                    self.set_status(Status::Idle);
                    if !long_enough {
                        // Anti-noise heuristic: brief accidental taps should
                        // not immediately re-open the mic.
                        self.cooldown_until = Some(Instant::now() + self.cfg.cooldown);
                    }
                }
            }
            ConversationTurn::AwaitingReply => {
                // Abandon the turn; a reply that still arrives is ignored.
                self.utterance_in_flight = false;
                self.set_turn(ConversationTurn::Idle);
                self.set_status(Status::Idle);
            }
            ConversationTurn::Speaking => {
                let _ = self.ch.playback_tx.send(PlaybackCommand::Stop).await;
                self.failsafe_deadline = None;
                self.set_turn(ConversationTurn::Idle);
                self.set_status(Status::Idle);
            }
        }
    }

    async fn on_interrupt(&mut self) {
        if self.turn.current() != ConversationTurn::Speaking {
            debug!(target: "orchestrator", "Interrupt ignored in {:?}", self.turn.current());
            return;
        }
        let _ = self.ch.playback_tx.send(PlaybackCommand::Stop).await;
        self.failsafe_deadline = None;
        self.set_status(Status::ResponseStopped);
        self.set_turn(ConversationTurn::Listening);
        let _ = self
            .ch
            .capture_tx
            .send(CaptureCommand::Acquire {
                device: self.cfg.device.clone(),
            })
            .await;
    }

    // ---- capture lifecycle -----------------------------------------------

    async fn handle_capture(&mut self, ev: CaptureEvent) {
        match ev {
            CaptureEvent::Opened {
                device,
                sample_rate_hz,
            } => {
                if !self.turn.current().capture_active() {
                    // User stopped while the acquire was pending.
                    warn!(
                        target: "orchestrator",
                        "Microphone opened after turn moved to {:?}, releasing",
                        self.turn.current()
                    );
                    let _ = self.ch.capture_tx.send(CaptureCommand::Release).await;
                    return;
                }
                info!(
                    target: "orchestrator",
                    "Microphone session open on '{}' at {} Hz", device, sample_rate_hz
                );
                self.capture_started_at = Some(Instant::now());
                let _ = self.ch.segmenter_tx.send(SegmenterCommand::Arm).await;
                self.set_status(Status::Listening);
            }
            CaptureEvent::Denied(e) => {
                let err = AppError::Capture(e);
                warn!(target: "orchestrator", "Microphone acquisition failed: {}", err);
                if err.recovery_action() == RecoveryAction::ReturnToIdle
                    && self.turn.current().capture_active()
                {
                    let _ = self.ch.segmenter_tx.send(SegmenterCommand::Disarm).await;
                    self.set_turn(ConversationTurn::Idle);
                }
                self.capture_started_at = None;
                self.set_status(Status::Error(err.to_string()));
            }
            CaptureEvent::Closed => {
                debug!(target: "orchestrator", "Microphone session closed");
            }
            CaptureEvent::DevicesChanged(devices) => {
                info!(target: "orchestrator", "Input devices changed: {:?}", devices);
            }
        }
    }

    // ---- segmentation ----------------------------------------------------

    async fn handle_segmenter(&mut self, ev: SegmenterEvent) {
        match ev {
            SegmenterEvent::SpeechStart => match self.turn.current() {
                ConversationTurn::Listening => {
                    self.silence_deadline = Some(Instant::now() + self.cfg.silence_timeout);
                    self.set_turn(ConversationTurn::CapturingUtterance);
                    self.set_status(Status::VoiceDetected);
                }
                ConversationTurn::Speaking => {
                    // The mic is closed during playback; a VAD signal here
                    // means something upstream leaked. Log and ignore.
                    warn!(target: "orchestrator", "VAD signal while speaking, suppressed");
                }
                other => {
                    debug!(target: "orchestrator", "SpeechStart ignored in {:?}", other);
                }
            },
            SegmenterEvent::UtteranceReady(utterance) => {
                if self.turn.current() != ConversationTurn::CapturingUtterance {
                    debug!(
                        target: "orchestrator",
                        "Duplicate utterance {} ignored in {:?}",
                        utterance.id,
                        self.turn.current()
                    );
                    return;
                }
                if self.utterance_in_flight {
                    warn!(target: "orchestrator", "Utterance already in flight, dropping");
                    return;
                }
                self.silence_deadline = None;
                self.teardown_capture().await;
                self.set_turn(ConversationTurn::AwaitingReply);
                self.set_status(Status::Thinking);
                self.utterance_in_flight = true;
                self.metrics.utterances_sent.fetch_add(1, Ordering::Relaxed);
                let _ = self
                    .ch
                    .link_tx
                    .send(LinkCommand::SendUtterance(utterance))
                    .await;
            }
            SegmenterEvent::Misfire => {
                if self.turn.current() == ConversationTurn::CapturingUtterance {
                    debug!(target: "orchestrator", "Misfire, back to listening");
                    self.silence_deadline = None;
                    self.set_turn(ConversationTurn::Listening);
                    self.set_status(Status::Listening);
                }
            }
            SegmenterEvent::EncodeFailed(message) => {
                warn!(target: "orchestrator", "Utterance encode failed: {}", message);
                if self.turn.current() == ConversationTurn::CapturingUtterance {
                    self.silence_deadline = None;
                    self.set_turn(ConversationTurn::Listening);
                }
                self.set_status(Status::Error(message));
            }
        }
    }

    // ---- backend link ----------------------------------------------------

    async fn handle_link(&mut self, ev: LinkEvent) {
        match ev {
            LinkEvent::Transcript(TranscriptEvent::Partial(text)) => {
                self.metrics.partials_received.fetch_add(1, Ordering::Relaxed);
                self.transcript.write().set_partial(text);
            }
            LinkEvent::Transcript(TranscriptEvent::FinalReply { text, audio }) => {
                if self.turn.current() != ConversationTurn::AwaitingReply {
                    debug!(
                        target: "orchestrator",
                        "Reply ignored in {:?}", self.turn.current()
                    );
                    self.utterance_in_flight = false;
                    return;
                }
                self.metrics.replies_received.fetch_add(1, Ordering::Relaxed);
                self.utterance_in_flight = false;

                {
                    // User line first, assistant line second; playback only
                    // starts after both are in the history.
                    let mut transcript = self.transcript.write();
                    let heard = transcript
                        .take_partial()
                        .unwrap_or_else(|| "[unrecognized]".to_string());
                    transcript.append(Speaker::User, heard);
                    transcript.append(Speaker::Assistant, text);
                }

                self.set_turn(ConversationTurn::Speaking);
                self.set_status(Status::Speaking);
                self.failsafe_deadline = Some(Instant::now() + self.cfg.failsafe_timeout);
                let _ = self
                    .ch
                    .playback_tx
                    .send(PlaybackCommand::Play { bytes: audio })
                    .await;
            }
            LinkEvent::Transcript(TranscriptEvent::ServerError(message)) => {
                self.metrics.server_errors.fetch_add(1, Ordering::Relaxed);
                warn!(target: "orchestrator", "Server error: {}", message);
                self.recover_turn(Status::Error(message)).await;
            }
            LinkEvent::SendFailed(e) => {
                warn!(target: "orchestrator", "Utterance send failed: {}", e);
                self.recover_turn(Status::Error(e.to_string())).await;
            }
            LinkEvent::Closed => {
                warn!(target: "orchestrator", "Backend connection closed");
                self.recover_turn(Status::Error("connection closed".to_string()))
                    .await;
            }
        }
    }

    /// Give up on the in-flight turn and re-arm capture so the user is not
    /// left stuck. Only meaningful while a reply is outstanding.
    async fn recover_turn(&mut self, status: Status) {
        self.set_status(status);
        if self.turn.current() != ConversationTurn::AwaitingReply {
            return;
        }
        self.utterance_in_flight = false;
        self.set_turn(ConversationTurn::Listening);
        let _ = self
            .ch
            .capture_tx
            .send(CaptureCommand::Acquire {
                device: self.cfg.device.clone(),
            })
            .await;
    }

    // ---- playback --------------------------------------------------------

    async fn handle_playback(&mut self, ev: PlaybackEvent) {
        match ev {
            PlaybackEvent::Started => {
                debug!(target: "orchestrator", "Reply playback started");
            }
            PlaybackEvent::Finished => {
                if self.turn.current() != ConversationTurn::Speaking {
                    debug!(target: "orchestrator", "Stale playback completion ignored");
                    return;
                }
                self.failsafe_deadline = None;
                self.metrics.mark_turn_completed();
                self.set_turn(ConversationTurn::Listening);
                self.set_status(Status::Listening);
                if self.cfg.resume_delay.is_zero() {
                    self.reacquire().await;
                } else {
                    self.resume_deadline = Some(Instant::now() + self.cfg.resume_delay);
                }
            }
            PlaybackEvent::Rejected(e) => {
                warn!(target: "orchestrator", "Playback rejected: {}", e);
                if self.turn.current() != ConversationTurn::Speaking {
                    return;
                }
                self.failsafe_deadline = None;
                // The reply stays available behind a manual trigger; the
                // conversation itself must not block on it.
                self.set_status(Status::TapToPlay);
                self.set_turn(ConversationTurn::Listening);
                self.reacquire().await;
            }
        }
    }

    // ---- timers ----------------------------------------------------------

    async fn on_silence_timeout(&mut self) {
        self.silence_deadline = None;
        if self.turn.current() != ConversationTurn::CapturingUtterance {
            return;
        }
        debug!(target: "orchestrator", "Silence timeout, flushing segment");
        self.set_status(Status::Processing);
        let _ = self.ch.segmenter_tx.send(SegmenterCommand::Flush).await;
    }

    async fn on_failsafe(&mut self) {
        self.failsafe_deadline = None;
        if self.turn.current() != ConversationTurn::Speaking {
            return;
        }
        warn!(target: "orchestrator", "No playback completion signal, forcing recovery");
        self.metrics.failsafe_recoveries.fetch_add(1, Ordering::Relaxed);
        let _ = self.ch.playback_tx.send(PlaybackCommand::Stop).await;
        self.set_turn(ConversationTurn::Listening);
        self.set_status(Status::Listening);
        self.reacquire().await;
    }

    async fn on_resume(&mut self) {
        self.resume_deadline = None;
        if self.turn.current() != ConversationTurn::Listening {
            return;
        }
        self.reacquire().await;
    }

    // ---- helpers ---------------------------------------------------------

    async fn reacquire(&mut self) {
        let _ = self
            .ch
            .capture_tx
            .send(CaptureCommand::Acquire {
                device: self.cfg.device.clone(),
            })
            .await;
    }

    /// Synchronously order the mic closed and the detector disarmed. Issued
    /// before any send or playback so capture and playback never overlap.
    async fn teardown_capture(&mut self) {
        let _ = self.ch.segmenter_tx.send(SegmenterCommand::Disarm).await;
        let _ = self.ch.capture_tx.send(CaptureCommand::Release).await;
        self.capture_started_at = None;
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
