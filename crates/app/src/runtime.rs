//! Pipeline wiring: spawns every collaborator, bridges their handles onto
//! the orchestrator's command channels, and hands back one `AppHandle` that
//! can observe and shut down the whole thing.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

use converse_audio::{
    CaptureCommand, CaptureEvent, CaptureHandle, PlaybackCommand, PlaybackEvent, PlaybackHandle,
};
use converse_foundation::{AudioFrame, CaptureConfig, ConversationTurn};
use converse_link::{spawn_link_sender, LinkCommand, LinkEvent, TranscriptStreamer};
use converse_telemetry::SessionMetrics;
use converse_vad::{
    EnergyClassifier, SegmenterCommand, SegmenterConfig, SegmenterEvent, SpeechSegmenter,
    ThresholdVad,
};

use crate::chat::Transcript;
use crate::orchestrator::{
    ConversationOrchestrator, OrchestratorChannels, OrchestratorConfig, UserCommand,
};
use crate::status::Status;

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub backend_url: String,
    pub capture: CaptureConfig,
    pub segmenter: SegmenterConfig,
    pub orchestrator: OrchestratorConfig,
}

pub struct AppHandle {
    pub user_tx: mpsc::Sender<UserCommand>,
    pub status_rx: watch::Receiver<Status>,
    pub turn_rx: watch::Receiver<ConversationTurn>,
    pub transcript: Arc<RwLock<Transcript>>,
    pub metrics: Arc<SessionMetrics>,

    capture_tx: mpsc::Sender<CaptureCommand>,
    playback_tx: mpsc::Sender<PlaybackCommand>,
    capture_bridge: JoinHandle<()>,
    playback_bridge: JoinHandle<()>,
    segmenter_handle: JoinHandle<()>,
    link_sender_handle: JoinHandle<()>,
    orchestrator_handle: JoinHandle<()>,
}

impl AppHandle {
    /// Gracefully stop the pipeline and wait for the audio threads to join.
    pub async fn shutdown(self) {
        info!("Shutting down converse runtime...");

        let _ = self.capture_tx.send(CaptureCommand::Shutdown).await;
        let _ = self.playback_tx.send(PlaybackCommand::Shutdown).await;
        let _ = self.capture_bridge.await;
        let _ = self.playback_bridge.await;

        self.orchestrator_handle.abort();
        self.segmenter_handle.abort();
        self.link_sender_handle.abort();
        let _ = self.orchestrator_handle.await;
        let _ = self.segmenter_handle.await;
        let _ = self.link_sender_handle.await;

        info!("converse runtime shutdown complete");
    }

    pub async fn wait_for_shutdown_signal() {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, initiating graceful shutdown"),
            Err(e) => tracing::error!("Failed to listen for SIGINT: {}", e),
        }
    }
}

/// Start the full pipeline against a live backend.
pub async fn start(opts: RuntimeOptions) -> anyhow::Result<AppHandle> {
    let metrics = Arc::new(SessionMetrics::default());
    let transcript = Arc::new(RwLock::new(Transcript::default()));

    // 1) Capture thread, bridged onto an async command channel.
    let (frame_tx, frame_rx) = mpsc::channel::<AudioFrame>(256);
    let (capture_event_tx, capture_event_rx) = mpsc::channel::<CaptureEvent>(32);
    let (capture_tx, capture_rx) = mpsc::channel::<CaptureCommand>(32);
    let capture = CaptureHandle::spawn(
        opts.capture.clone(),
        frame_tx,
        capture_event_tx,
        metrics.clone(),
    )?;
    let capture_bridge = spawn_capture_bridge(capture, capture_rx);

    // 2) Playback thread, same arrangement.
    let (playback_event_tx, playback_event_rx) = mpsc::channel::<PlaybackEvent>(32);
    let (playback_tx, playback_rx) = mpsc::channel::<PlaybackCommand>(8);
    let playback = PlaybackHandle::spawn(playback_event_tx, metrics.clone())?;
    let playback_bridge = spawn_playback_bridge(playback, playback_rx);

    // 3) Segmenter with the energy classifier behind the VAD boundary.
    let (segmenter_event_tx, segmenter_event_rx) = mpsc::channel::<SegmenterEvent>(32);
    let (segmenter_tx, segmenter_cmd_rx) = mpsc::channel::<SegmenterCommand>(32);
    let engine = ThresholdVad::new(
        opts.segmenter.vad,
        Box::new(EnergyClassifier::default()),
    );
    let segmenter_handle = SpeechSegmenter::new(
        frame_rx,
        segmenter_cmd_rx,
        segmenter_event_tx,
        Box::new(engine),
        opts.segmenter.clone(),
        metrics.clone(),
    )
    .spawn();

    // 4) Backend link.
    let (link_event_tx, link_event_rx) = mpsc::channel::<LinkEvent>(64);
    let (link_tx, link_cmd_rx) = mpsc::channel::<LinkCommand>(8);
    let streamer = TranscriptStreamer::connect(&opts.backend_url, link_event_tx.clone()).await?;
    let link_sender_handle = spawn_link_sender(streamer, link_cmd_rx, link_event_tx);

    // 5) The orchestrator ties it all together.
    let (user_tx, user_rx) = mpsc::channel::<UserCommand>(8);
    let channels = OrchestratorChannels {
        user_rx,
        capture_rx: capture_event_rx,
        segmenter_rx: segmenter_event_rx,
        link_rx: link_event_rx,
        playback_rx: playback_event_rx,
        capture_tx: capture_tx.clone(),
        segmenter_tx,
        link_tx,
        playback_tx: playback_tx.clone(),
    };
    let (orchestrator, status_rx, turn_rx) = ConversationOrchestrator::new(
        opts.orchestrator,
        channels,
        transcript.clone(),
        metrics.clone(),
    );
    let orchestrator_handle = orchestrator.spawn();

    info!(
        "converse pipeline started (backend: {}, frame: {}ms)",
        opts.backend_url, opts.capture.frame_ms
    );

    Ok(AppHandle {
        user_tx,
        status_rx,
        turn_rx,
        transcript,
        metrics,
        capture_tx,
        playback_tx,
        capture_bridge,
        playback_bridge,
        segmenter_handle,
        link_sender_handle,
        orchestrator_handle,
    })
}

fn spawn_capture_bridge(
    capture: CaptureHandle,
    mut cmd_rx: mpsc::Receiver<CaptureCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                CaptureCommand::Acquire { device } => capture.acquire(device),
                CaptureCommand::Release => capture.release(),
                CaptureCommand::Shutdown => break,
            }
        }
        capture.shutdown();
    })
}

fn spawn_playback_bridge(
    playback: PlaybackHandle,
    mut cmd_rx: mpsc::Receiver<PlaybackCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                PlaybackCommand::Play { bytes } => playback.play(bytes),
                PlaybackCommand::Stop => playback.stop(),
                PlaybackCommand::Shutdown => break,
            }
        }
        playback.shutdown();
    })
}
