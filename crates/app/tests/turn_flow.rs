//! End-to-end turn-taking scenarios with channel-faked collaborators.
//!
//! Each test stands in for the capture thread, segmenter, backend link, and
//! playback thread by holding the far ends of the orchestrator's channels,
//! then drives events and asserts on the commands the orchestrator issues.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use converse_app::chat::{Speaker, Transcript};
use converse_app::orchestrator::{
    ConversationOrchestrator, OrchestratorChannels, OrchestratorConfig, UserCommand,
};
use converse_app::status::Status;
use converse_audio::{CaptureCommand, CaptureEvent, PlaybackCommand, PlaybackEvent};
use converse_foundation::{CaptureError, ConversationTurn, PlaybackError};
use converse_link::{LinkCommand, LinkError, LinkEvent, TranscriptEvent};
use converse_telemetry::SessionMetrics;
use converse_vad::{SegmenterCommand, SegmenterEvent, Utterance};

struct Harness {
    user_tx: mpsc::Sender<UserCommand>,
    capture_ev_tx: mpsc::Sender<CaptureEvent>,
    seg_ev_tx: mpsc::Sender<SegmenterEvent>,
    link_ev_tx: mpsc::Sender<LinkEvent>,
    play_ev_tx: mpsc::Sender<PlaybackEvent>,
    capture_cmd_rx: mpsc::Receiver<CaptureCommand>,
    seg_cmd_rx: mpsc::Receiver<SegmenterCommand>,
    link_cmd_rx: mpsc::Receiver<LinkCommand>,
    play_cmd_rx: mpsc::Receiver<PlaybackCommand>,
    status_rx: watch::Receiver<Status>,
    turn_rx: watch::Receiver<ConversationTurn>,
    transcript: Arc<RwLock<Transcript>>,
    metrics: Arc<SessionMetrics>,
    _orchestrator: JoinHandle<()>,
}

fn harness(cfg: OrchestratorConfig) -> Harness {
    let (user_tx, user_rx) = mpsc::channel(8);
    let (capture_ev_tx, capture_rx) = mpsc::channel(16);
    let (seg_ev_tx, segmenter_rx) = mpsc::channel(16);
    let (link_ev_tx, link_rx) = mpsc::channel(16);
    let (play_ev_tx, playback_rx) = mpsc::channel(16);
    let (capture_tx, capture_cmd_rx) = mpsc::channel(16);
    let (segmenter_tx, seg_cmd_rx) = mpsc::channel(16);
    let (link_tx, link_cmd_rx) = mpsc::channel(16);
    let (playback_tx, play_cmd_rx) = mpsc::channel(16);

    let transcript = Arc::new(RwLock::new(Transcript::default()));
    let metrics = Arc::new(SessionMetrics::default());
    let channels = OrchestratorChannels {
        user_rx,
        capture_rx,
        segmenter_rx,
        link_rx,
        playback_rx,
        capture_tx,
        segmenter_tx,
        link_tx,
        playback_tx,
    };
    let (orchestrator, status_rx, turn_rx) =
        ConversationOrchestrator::new(cfg, channels, transcript.clone(), metrics.clone());
    let handle = orchestrator.spawn();

    Harness {
        user_tx,
        capture_ev_tx,
        seg_ev_tx,
        link_ev_tx,
        play_ev_tx,
        capture_cmd_rx,
        seg_cmd_rx,
        link_cmd_rx,
        play_cmd_rx,
        status_rx,
        turn_rx,
        transcript,
        metrics,
        _orchestrator: handle,
    }
}

fn immediate_resume_cfg() -> OrchestratorConfig {
    OrchestratorConfig {
        resume_delay: Duration::ZERO,
        ..Default::default()
    }
}

/// Let the orchestrator drain everything queued so far without advancing
/// the (paused) clock.
async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

fn utterance() -> Utterance {
    Utterance {
        id: 0,
        bytes: vec![1, 2, 3, 4],
        sample_rate_hz: 16_000,
        duration_ms: 2_000,
    }
}

fn turn(h: &Harness) -> ConversationTurn {
    *h.turn_rx.borrow()
}

fn status(h: &Harness) -> Status {
    h.status_rx.borrow().clone()
}

async fn start_listening(h: &mut Harness) {
    h.user_tx.send(UserCommand::Start).await.unwrap();
    settle().await;
    assert!(matches!(
        h.capture_cmd_rx.try_recv(),
        Ok(CaptureCommand::Acquire { .. })
    ));
    assert_eq!(status(h), Status::Initializing);
    h.capture_ev_tx
        .send(CaptureEvent::Opened {
            device: "default".into(),
            sample_rate_hz: 48_000,
        })
        .await
        .unwrap();
    settle().await;
    assert!(matches!(
        h.seg_cmd_rx.try_recv(),
        Ok(SegmenterCommand::Arm)
    ));
    assert_eq!(turn(h), ConversationTurn::Listening);
}

/// Start, speak, and finalize one utterance; leaves the harness in
/// AwaitingReply with the send command drained.
async fn drive_to_awaiting(h: &mut Harness) {
    start_listening(h).await;

    h.seg_ev_tx.send(SegmenterEvent::SpeechStart).await.unwrap();
    settle().await;
    assert_eq!(turn(h), ConversationTurn::CapturingUtterance);
    assert_eq!(status(h), Status::VoiceDetected);

    h.seg_ev_tx
        .send(SegmenterEvent::UtteranceReady(utterance()))
        .await
        .unwrap();
    settle().await;

    // Mic torn down strictly before the utterance goes out.
    assert!(matches!(
        h.seg_cmd_rx.try_recv(),
        Ok(SegmenterCommand::Disarm)
    ));
    assert!(matches!(
        h.capture_cmd_rx.try_recv(),
        Ok(CaptureCommand::Release)
    ));
    assert!(matches!(
        h.link_cmd_rx.try_recv(),
        Ok(LinkCommand::SendUtterance(_))
    ));
    assert_eq!(turn(h), ConversationTurn::AwaitingReply);
    assert_eq!(status(h), Status::Thinking);
}

async fn drive_to_speaking(h: &mut Harness) {
    drive_to_awaiting(h).await;
    h.link_ev_tx
        .send(LinkEvent::Transcript(TranscriptEvent::FinalReply {
            text: "hello back".into(),
            audio: vec![9, 9, 9],
        }))
        .await
        .unwrap();
    settle().await;
    assert_eq!(turn(h), ConversationTurn::Speaking);
    assert!(matches!(
        h.play_cmd_rx.try_recv(),
        Ok(PlaybackCommand::Play { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn full_turn_cycle_resumes_listening() {
    let mut h = harness(immediate_resume_cfg());
    drive_to_awaiting(&mut h).await;

    h.link_ev_tx
        .send(LinkEvent::Transcript(TranscriptEvent::Partial(
            "what is the weather".into(),
        )))
        .await
        .unwrap();
    h.link_ev_tx
        .send(LinkEvent::Transcript(TranscriptEvent::FinalReply {
            text: "it is sunny".into(),
            audio: vec![9; 128],
        }))
        .await
        .unwrap();
    settle().await;

    // Chat history gains exactly two entries, user strictly first.
    {
        let transcript = h.transcript.read();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript.messages()[0].speaker, Speaker::User);
        assert_eq!(transcript.messages()[0].text, "what is the weather");
        assert_eq!(transcript.messages()[1].speaker, Speaker::Assistant);
        assert_eq!(transcript.messages()[1].text, "it is sunny");
    }
    assert_eq!(turn(&h), ConversationTurn::Speaking);
    assert_eq!(status(&h), Status::Speaking);
    assert!(matches!(
        h.play_cmd_rx.try_recv(),
        Ok(PlaybackCommand::Play { bytes }) if bytes == vec![9; 128]
    ));

    // No mic acquisition while the reply plays.
    h.play_ev_tx.send(PlaybackEvent::Started).await.unwrap();
    settle().await;
    assert!(h.capture_cmd_rx.try_recv().is_err());

    // Completion re-arms capture automatically.
    h.play_ev_tx.send(PlaybackEvent::Finished).await.unwrap();
    settle().await;
    assert_eq!(turn(&h), ConversationTurn::Listening);
    assert!(matches!(
        h.capture_cmd_rx.try_recv(),
        Ok(CaptureCommand::Acquire { .. })
    ));
    assert_eq!(h.metrics.turns_completed.load(Ordering::Relaxed), 1);
}

#[tokio::test(start_paused = true)]
async fn server_error_rearms_without_chat_append() {
    let mut h = harness(immediate_resume_cfg());
    drive_to_awaiting(&mut h).await;

    h.link_ev_tx
        .send(LinkEvent::Transcript(TranscriptEvent::ServerError(
            "overloaded".into(),
        )))
        .await
        .unwrap();
    settle().await;

    assert_eq!(status(&h), Status::Error("overloaded".into()));
    assert_eq!(turn(&h), ConversationTurn::Listening);
    assert!(matches!(
        h.capture_cmd_rx.try_recv(),
        Ok(CaptureCommand::Acquire { .. })
    ));
    assert!(h.transcript.read().is_empty());
}

#[tokio::test(start_paused = true)]
async fn interrupt_during_speaking_reacquires_mic() {
    let mut h = harness(immediate_resume_cfg());
    drive_to_speaking(&mut h).await;

    h.user_tx.send(UserCommand::Interrupt).await.unwrap();
    settle().await;

    assert!(matches!(h.play_cmd_rx.try_recv(), Ok(PlaybackCommand::Stop)));
    assert_eq!(turn(&h), ConversationTurn::Listening);
    assert!(matches!(
        h.capture_cmd_rx.try_recv(),
        Ok(CaptureCommand::Acquire { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn permission_denied_returns_to_idle() {
    let mut h = harness(immediate_resume_cfg());
    h.user_tx.send(UserCommand::Start).await.unwrap();
    settle().await;
    assert!(matches!(
        h.capture_cmd_rx.try_recv(),
        Ok(CaptureCommand::Acquire { .. })
    ));

    h.capture_ev_tx
        .send(CaptureEvent::Denied(CaptureError::PermissionDenied {
            reason: "access refused".into(),
        }))
        .await
        .unwrap();
    settle().await;

    assert_eq!(turn(&h), ConversationTurn::Idle);
    match status(&h) {
        Status::Error(message) => assert!(message.contains("denied"), "{message}"),
        other => panic!("expected error status, got {other:?}"),
    }
    // No retry on its own.
    assert!(h.capture_cmd_rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn duplicate_utterance_sends_nothing() {
    let mut h = harness(immediate_resume_cfg());
    drive_to_awaiting(&mut h).await;

    // A second speech-end converges on a second UtteranceReady; it must be
    // a no-op.
    h.seg_ev_tx
        .send(SegmenterEvent::UtteranceReady(utterance()))
        .await
        .unwrap();
    settle().await;

    assert_eq!(turn(&h), ConversationTurn::AwaitingReply);
    assert!(h.link_cmd_rx.try_recv().is_err());
    assert_eq!(h.metrics.utterances_sent.load(Ordering::Relaxed), 1);
}

#[tokio::test(start_paused = true)]
async fn manual_stop_under_minimum_turn_discards() {
    let mut h = harness(immediate_resume_cfg());
    start_listening(&mut h).await;
    h.seg_ev_tx.send(SegmenterEvent::SpeechStart).await.unwrap();
    settle().await;

    tokio::time::advance(Duration::from_millis(4_999)).await;
    h.user_tx.send(UserCommand::Stop).await.unwrap();
    settle().await;

    assert_eq!(turn(&h), ConversationTurn::Idle);
    assert!(matches!(
        h.seg_cmd_rx.try_recv(),
        Ok(SegmenterCommand::Disarm)
    ));
    assert!(matches!(
        h.capture_cmd_rx.try_recv(),
        Ok(CaptureCommand::Release)
    ));
    // Nothing was committed to the network.
    assert!(h.link_cmd_rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn manual_stop_past_minimum_turn_sends() {
    let mut h = harness(immediate_resume_cfg());
    start_listening(&mut h).await;
    h.seg_ev_tx.send(SegmenterEvent::SpeechStart).await.unwrap();
    settle().await;

    tokio::time::advance(Duration::from_millis(5_001)).await;
    h.user_tx.send(UserCommand::Stop).await.unwrap();
    settle().await;

    // The segment is committed rather than discarded.
    assert!(matches!(
        h.seg_cmd_rx.try_recv(),
        Ok(SegmenterCommand::Flush)
    ));
    assert_eq!(status(&h), Status::Processing);

    h.seg_ev_tx
        .send(SegmenterEvent::UtteranceReady(utterance()))
        .await
        .unwrap();
    settle().await;
    assert_eq!(turn(&h), ConversationTurn::AwaitingReply);
    assert!(matches!(
        h.link_cmd_rx.try_recv(),
        Ok(LinkCommand::SendUtterance(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn cooldown_after_short_stop_blocks_restart() {
    let mut h = harness(immediate_resume_cfg());
    start_listening(&mut h).await;

    tokio::time::advance(Duration::from_millis(500)).await;
    h.user_tx.send(UserCommand::Stop).await.unwrap();
    settle().await;
    assert_eq!(turn(&h), ConversationTurn::Idle);
    let _ = h.capture_cmd_rx.try_recv(); // drain Release

    h.user_tx.send(UserCommand::Start).await.unwrap();
    settle().await;
    assert_eq!(turn(&h), ConversationTurn::Idle);
    assert!(h.capture_cmd_rx.try_recv().is_err());

    tokio::time::advance(Duration::from_millis(1_600)).await;
    h.user_tx.send(UserCommand::Start).await.unwrap();
    settle().await;
    assert_eq!(turn(&h), ConversationTurn::Listening);
    assert!(matches!(
        h.capture_cmd_rx.try_recv(),
        Ok(CaptureCommand::Acquire { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn silence_timeout_flushes_the_segment() {
    let mut h = harness(immediate_resume_cfg());
    start_listening(&mut h).await;
    h.seg_ev_tx.send(SegmenterEvent::SpeechStart).await.unwrap();
    settle().await;

    tokio::time::advance(Duration::from_secs(10)).await;
    settle().await;
    assert!(matches!(
        h.seg_cmd_rx.try_recv(),
        Ok(SegmenterCommand::Flush)
    ));

    h.seg_ev_tx
        .send(SegmenterEvent::UtteranceReady(utterance()))
        .await
        .unwrap();
    settle().await;
    assert_eq!(turn(&h), ConversationTurn::AwaitingReply);
    assert!(matches!(
        h.link_cmd_rx.try_recv(),
        Ok(LinkCommand::SendUtterance(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn failsafe_recovers_a_stuck_playback() {
    let mut h = harness(immediate_resume_cfg());
    drive_to_speaking(&mut h).await;

    tokio::time::advance(Duration::from_secs(60)).await;
    settle().await;

    assert!(matches!(h.play_cmd_rx.try_recv(), Ok(PlaybackCommand::Stop)));
    assert_eq!(turn(&h), ConversationTurn::Listening);
    assert!(matches!(
        h.capture_cmd_rx.try_recv(),
        Ok(CaptureCommand::Acquire { .. })
    ));
    assert_eq!(h.metrics.failsafe_recoveries.load(Ordering::Relaxed), 1);
}

#[tokio::test(start_paused = true)]
async fn playback_rejection_degrades_but_rearms() {
    let mut h = harness(immediate_resume_cfg());
    drive_to_speaking(&mut h).await;

    h.play_ev_tx
        .send(PlaybackEvent::Rejected(PlaybackError::Rejected(
            "autoplay refused".into(),
        )))
        .await
        .unwrap();
    settle().await;

    assert_eq!(status(&h), Status::TapToPlay);
    assert_eq!(turn(&h), ConversationTurn::Listening);
    assert!(matches!(
        h.capture_cmd_rx.try_recv(),
        Ok(CaptureCommand::Acquire { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn send_failure_rearms_capture() {
    let mut h = harness(immediate_resume_cfg());
    drive_to_awaiting(&mut h).await;

    h.link_ev_tx
        .send(LinkEvent::SendFailed(LinkError::NotConnected))
        .await
        .unwrap();
    settle().await;

    assert_eq!(turn(&h), ConversationTurn::Listening);
    match status(&h) {
        Status::Error(message) => assert!(message.contains("Not connected"), "{message}"),
        other => panic!("expected error status, got {other:?}"),
    }
    assert!(matches!(
        h.capture_cmd_rx.try_recv(),
        Ok(CaptureCommand::Acquire { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn stop_while_awaiting_ignores_the_late_reply() {
    let mut h = harness(immediate_resume_cfg());
    drive_to_awaiting(&mut h).await;

    h.user_tx.send(UserCommand::Stop).await.unwrap();
    settle().await;
    assert_eq!(turn(&h), ConversationTurn::Idle);

    h.link_ev_tx
        .send(LinkEvent::Transcript(TranscriptEvent::FinalReply {
            text: "too late".into(),
            audio: vec![1],
        }))
        .await
        .unwrap();
    settle().await;

    assert_eq!(turn(&h), ConversationTurn::Idle);
    assert!(h.transcript.read().is_empty());
    assert!(h.play_cmd_rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn vad_signal_during_speaking_is_suppressed() {
    let mut h = harness(immediate_resume_cfg());
    drive_to_speaking(&mut h).await;

    h.seg_ev_tx.send(SegmenterEvent::SpeechStart).await.unwrap();
    settle().await;

    assert_eq!(turn(&h), ConversationTurn::Speaking);
    assert!(h.capture_cmd_rx.try_recv().is_err());
    assert!(h.play_cmd_rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn resume_delay_defers_reacquisition() {
    let mut h = harness(OrchestratorConfig {
        resume_delay: Duration::from_millis(300),
        ..Default::default()
    });
    drive_to_speaking(&mut h).await;

    h.play_ev_tx.send(PlaybackEvent::Finished).await.unwrap();
    settle().await;
    assert_eq!(turn(&h), ConversationTurn::Listening);
    assert!(h.capture_cmd_rx.try_recv().is_err());

    tokio::time::advance(Duration::from_millis(301)).await;
    settle().await;
    assert!(matches!(
        h.capture_cmd_rx.try_recv(),
        Ok(CaptureCommand::Acquire { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn late_mic_open_after_stop_is_released() {
    let mut h = harness(immediate_resume_cfg());
    h.user_tx.send(UserCommand::Start).await.unwrap();
    settle().await;
    assert!(matches!(
        h.capture_cmd_rx.try_recv(),
        Ok(CaptureCommand::Acquire { .. })
    ));

    // User gives up while the permission prompt is still pending. The stop
    // is under the minimum turn, so it discards and goes Idle.
    h.user_tx.send(UserCommand::Stop).await.unwrap();
    settle().await;
    assert_eq!(turn(&h), ConversationTurn::Idle);
    let _ = h.capture_cmd_rx.try_recv(); // drain Release
    let _ = h.seg_cmd_rx.try_recv(); // drain Disarm

    // The grant lands afterwards: the orchestrator must re-validate state
    // and order the session closed rather than start listening.
    h.capture_ev_tx
        .send(CaptureEvent::Opened {
            device: "default".into(),
            sample_rate_hz: 48_000,
        })
        .await
        .unwrap();
    settle().await;

    assert_eq!(turn(&h), ConversationTurn::Idle);
    assert!(matches!(
        h.capture_cmd_rx.try_recv(),
        Ok(CaptureCommand::Release)
    ));
    assert!(h.seg_cmd_rx.try_recv().is_err());
}
