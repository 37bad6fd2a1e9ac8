//! Utterance segmentation gated by VAD events.
//!
//! The segmenter consumes capture frames while armed, keeps a short ring of
//! pre-speech context, buffers audio between speech-start and speech-end,
//! and finalizes each segment into exactly one transport-ready utterance.

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::SegmenterConfig;
use crate::engine::VadEngine;
use crate::resample::resample_mono;
use crate::types::VadEvent;
use converse_foundation::AudioFrame;
use converse_telemetry::SessionMetrics;

/// One finalized, contiguous speech segment: 16-bit PCM WAV bytes at the
/// backend rate. Produced once, consumed exactly once by the streamer.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub id: u64,
    pub bytes: Vec<u8>,
    pub sample_rate_hz: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmenterCommand {
    /// Begin classifying frames. Resets detector state and buffers.
    Arm,
    /// Stop classifying and drop any partial segment.
    Disarm,
    /// Finalize whatever is buffered as the utterance, without waiting for
    /// the detector to confirm the end (silence-timeout and manual-send
    /// paths).
    Flush,
}

#[derive(Debug)]
pub enum SegmenterEvent {
    SpeechStart,
    UtteranceReady(Utterance),
    Misfire,
    EncodeFailed(String),
}

pub struct SpeechSegmenter {
    frame_rx: mpsc::Receiver<AudioFrame>,
    cmd_rx: mpsc::Receiver<SegmenterCommand>,
    event_tx: mpsc::Sender<SegmenterEvent>,
    engine: Box<dyn VadEngine>,
    cfg: SegmenterConfig,
    metrics: Arc<SessionMetrics>,

    armed: bool,
    capturing: bool,
    prepad: VecDeque<AudioFrame>,
    buffer: Vec<i16>,
    buffer_rate_hz: u32,
    next_utterance_id: u64,
}

impl SpeechSegmenter {
    pub fn new(
        frame_rx: mpsc::Receiver<AudioFrame>,
        cmd_rx: mpsc::Receiver<SegmenterCommand>,
        event_tx: mpsc::Sender<SegmenterEvent>,
        engine: Box<dyn VadEngine>,
        cfg: SegmenterConfig,
        metrics: Arc<SessionMetrics>,
    ) -> Self {
        Self {
            frame_rx,
            cmd_rx,
            event_tx,
            engine,
            cfg,
            metrics,
            armed: false,
            capturing: false,
            prepad: VecDeque::new(),
            buffer: Vec::new(),
            buffer_rate_hz: 0,
            next_utterance_id: 0,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Main loop. Frame handling and encoding are serialized: a finalize
    /// (and its bounded encode) completes before the next frame or command
    /// is looked at, so an encode can never be orphaned by later events.
    pub async fn run(mut self) {
        info!(target: "segmenter", "Speech segmenter started");
        loop {
            tokio::select! {
                Some(cmd) = self.cmd_rx.recv() => {
                    self.handle_command(cmd).await;
                }
                Some(frame) = self.frame_rx.recv() => {
                    self.handle_frame(frame).await;
                }
                else => {
                    info!(target: "segmenter", "All channels closed, segmenter exiting");
                    break;
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: SegmenterCommand) {
        match cmd {
            SegmenterCommand::Arm => {
                debug!(target: "segmenter", "Armed");
                self.armed = true;
                self.reset_segment_state();
            }
            SegmenterCommand::Disarm => {
                debug!(target: "segmenter", "Disarmed");
                self.armed = false;
                self.reset_segment_state();
            }
            SegmenterCommand::Flush => {
                if self.capturing && !self.buffer.is_empty() {
                    debug!(
                        target: "segmenter",
                        "Flush: finalizing {} buffered samples", self.buffer.len()
                    );
                    self.engine.reset();
                    self.finalize_utterance().await;
                } else {
                    // Raced with a detector-confirmed end; nothing to do.
                    trace!(target: "segmenter", "Flush with no active segment, ignoring");
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: AudioFrame) {
        if !self.armed {
            return;
        }
        self.buffer_rate_hz = frame.sample_rate_hz;

        match self.engine.process(&frame) {
            Some(VadEvent::SpeechStart { timestamp_ms }) => {
                debug!(target: "segmenter", "Speech started @ {}ms", timestamp_ms);
                self.buffer.clear();
                for padded in self.prepad.drain(..) {
                    self.buffer.extend_from_slice(&padded.samples);
                }
                self.buffer.extend_from_slice(&frame.samples);
                self.capturing = true;
                self.metrics.speech_starts.fetch_add(1, Ordering::Relaxed);
                let _ = self.event_tx.send(SegmenterEvent::SpeechStart).await;
            }
            Some(VadEvent::SpeechEnd {
                timestamp_ms,
                duration_ms,
            }) => {
                debug!(
                    target: "segmenter",
                    "Speech ended @ {}ms (duration={}ms)", timestamp_ms, duration_ms
                );
                self.buffer.extend_from_slice(&frame.samples);
                self.finalize_utterance().await;
            }
            Some(VadEvent::Misfire { timestamp_ms }) => {
                debug!(target: "segmenter", "VAD misfire @ {}ms, dropping segment", timestamp_ms);
                self.reset_segment_state();
                self.metrics.misfires.fetch_add(1, Ordering::Relaxed);
                let _ = self.event_tx.send(SegmenterEvent::Misfire).await;
            }
            None => {
                if self.capturing {
                    self.buffer.extend_from_slice(&frame.samples);
                } else {
                    self.prepad.push_back(frame);
                    while self.prepad.len() > self.cfg.pre_speech_pad_frames {
                        self.prepad.pop_front();
                    }
                }
            }
        }
    }

    fn reset_segment_state(&mut self) {
        self.engine.reset();
        self.capturing = false;
        self.buffer.clear();
        self.prepad.clear();
    }

    /// Encode the buffered segment and emit exactly one event for it. The
    /// encode runs off-loop but is awaited here under a timeout derived from
    /// the sample count, so the segmenter never moves on with an encode
    /// still pending.
    async fn finalize_utterance(&mut self) {
        let samples = std::mem::take(&mut self.buffer);
        let in_rate = self.buffer_rate_hz;
        self.capturing = false;
        self.prepad.clear();

        if samples.is_empty() || in_rate == 0 {
            warn!(target: "segmenter", "Finalize with empty buffer, skipping");
            return;
        }

        let duration_ms = samples.len() as u64 * 1000 / in_rate as u64;
        let out_rate = self.cfg.target_sample_rate_hz;
        let id = self.next_utterance_id;
        self.next_utterance_id += 1;

        let limit = encode_timeout(samples.len());
        let encode = tokio::task::spawn_blocking(move || encode_wav(&samples, in_rate, out_rate));

        let event = match tokio::time::timeout(limit, encode).await {
            Ok(Ok(Ok(bytes))) => {
                info!(
                    target: "segmenter",
                    "Utterance {} finalized: {}ms, {} bytes", id, duration_ms, bytes.len()
                );
                self.metrics
                    .utterances_finalized
                    .fetch_add(1, Ordering::Relaxed);
                SegmenterEvent::UtteranceReady(Utterance {
                    id,
                    bytes,
                    sample_rate_hz: out_rate,
                    duration_ms,
                })
            }
            Ok(Ok(Err(e))) => {
                warn!(target: "segmenter", "Utterance {} encode failed: {}", id, e);
                SegmenterEvent::EncodeFailed(e)
            }
            Ok(Err(join_err)) => {
                warn!(target: "segmenter", "Utterance {} encode task failed: {}", id, join_err);
                SegmenterEvent::EncodeFailed(join_err.to_string())
            }
            Err(_) => {
                warn!(
                    target: "segmenter",
                    "Utterance {} encode exceeded {:?}", id, limit
                );
                SegmenterEvent::EncodeFailed(format!("encode exceeded {limit:?}"))
            }
        };
        let _ = self.event_tx.send(event).await;
    }
}

/// Encode timeout scales with utterance length: a one-second floor plus
/// roughly realtime for the resample itself.
fn encode_timeout(sample_count: usize) -> Duration {
    Duration::from_millis(1_000 + sample_count as u64 / 16)
}

fn encode_wav(samples: &[i16], in_rate: u32, out_rate: u32) -> Result<Vec<u8>, String> {
    let resampled = resample_mono(samples, in_rate, out_rate)?;

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: out_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| format!("wav writer: {e}"))?;
        for &sample in &resampled {
            writer
                .write_sample(sample)
                .map_err(|e| format!("wav write: {e}"))?;
        }
        writer.finalize().map_err(|e| format!("wav finalize: {e}"))?;
    }
    Ok(cursor.into_inner())
}
