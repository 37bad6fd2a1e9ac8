//! Reply playback on a dedicated OS thread.
//!
//! rodio's `OutputStream` is not `Send`, so one thread owns the output sink
//! for the life of the process. At most one playback session is active:
//! starting a new one stops and drains the previous sink before the new
//! start is issued, so two starts can never overlap on the same output.
//! Completion fires exactly once per play that runs to the end; an
//! interrupted session fires nothing.

use converse_foundation::PlaybackError;
use converse_telemetry::SessionMetrics;
use crossbeam_channel::RecvTimeoutError;
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink, Source};
use std::io::Cursor;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

const SINK_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug)]
pub enum PlaybackCommand {
    Play { bytes: Vec<u8> },
    Stop,
    Shutdown,
}

#[derive(Debug)]
pub enum PlaybackEvent {
    Started,
    /// Natural end of a session. Never emitted for interrupted sessions.
    Finished,
    Rejected(PlaybackError),
}

pub struct PlaybackHandle {
    cmd_tx: crossbeam_channel::Sender<PlaybackCommand>,
    handle: Option<JoinHandle<()>>,
}

impl PlaybackHandle {
    pub fn spawn(
        event_tx: mpsc::Sender<PlaybackEvent>,
        metrics: Arc<SessionMetrics>,
    ) -> Result<Self, PlaybackError> {
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let handle = thread::Builder::new()
            .name("audio-playback".to_string())
            .spawn(move || {
                let mut worker = PlaybackWorker {
                    event_tx,
                    metrics,
                    output: None,
                };
                worker.run(cmd_rx);
            })
            .map_err(|e| {
                PlaybackError::DeviceUnavailable(format!("spawn audio-playback thread: {e}"))
            })?;

        Ok(Self {
            cmd_tx,
            handle: Some(handle),
        })
    }

    pub fn play(&self, bytes: Vec<u8>) {
        let _ = self.cmd_tx.send(PlaybackCommand::Play { bytes });
    }

    /// Safe to call at any time, including before playback has begun.
    pub fn stop(&self) {
        let _ = self.cmd_tx.send(PlaybackCommand::Stop);
    }

    pub fn shutdown(mut self) {
        let _ = self.cmd_tx.send(PlaybackCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct PlaybackWorker {
    event_tx: mpsc::Sender<PlaybackEvent>,
    metrics: Arc<SessionMetrics>,
    output: Option<(OutputStream, OutputStreamHandle)>,
}

impl PlaybackWorker {
    fn run(&mut self, cmd_rx: crossbeam_channel::Receiver<PlaybackCommand>) {
        info!(target: "playback", "Playback thread started");
        let mut pending = None;
        loop {
            let cmd = match pending.take() {
                Some(cmd) => cmd,
                None => match cmd_rx.recv() {
                    Ok(cmd) => cmd,
                    Err(_) => break,
                },
            };

            match cmd {
                PlaybackCommand::Play { bytes } => {
                    pending = self.play_session(bytes, &cmd_rx);
                }
                PlaybackCommand::Stop => {
                    trace!(target: "playback", "Stop with no active session, ignoring");
                }
                PlaybackCommand::Shutdown => break,
            }
        }
        info!(target: "playback", "Playback thread exiting");
    }

    /// Run one session to completion, interruption, or pre-emption by a new
    /// Play. Returns a command that pre-empted the session, if any.
    fn play_session(
        &mut self,
        bytes: Vec<u8>,
        cmd_rx: &crossbeam_channel::Receiver<PlaybackCommand>,
    ) -> Option<PlaybackCommand> {
        let sink = match self.new_sink() {
            Ok(sink) => sink,
            Err(e) => {
                warn!(target: "playback", "Playback rejected: {}", e);
                self.metrics
                    .playback_rejections
                    .fetch_add(1, Ordering::Relaxed);
                let _ = self.event_tx.blocking_send(PlaybackEvent::Rejected(e));
                return None;
            }
        };

        let source = match Decoder::new(Cursor::new(bytes)) {
            Ok(source) => source,
            Err(e) => {
                let err = PlaybackError::Decode(e.to_string());
                warn!(target: "playback", "Playback rejected: {}", err);
                self.metrics
                    .playback_rejections
                    .fetch_add(1, Ordering::Relaxed);
                let _ = self.event_tx.blocking_send(PlaybackEvent::Rejected(err));
                return None;
            }
        };

        sink.append(source.convert_samples::<f32>());
        debug!(target: "playback", "Playback session started");
        let _ = self.event_tx.blocking_send(PlaybackEvent::Started);

        loop {
            if sink.empty() {
                debug!(target: "playback", "Playback session finished");
                self.metrics.replies_played.fetch_add(1, Ordering::Relaxed);
                let _ = self.event_tx.blocking_send(PlaybackEvent::Finished);
                return None;
            }
            match cmd_rx.recv_timeout(SINK_POLL_INTERVAL) {
                Ok(PlaybackCommand::Stop) => {
                    debug!(target: "playback", "Playback session interrupted");
                    sink.stop();
                    self.metrics
                        .playback_interrupts
                        .fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                Ok(next @ PlaybackCommand::Play { .. }) => {
                    // Drain the live session fully before the next start.
                    debug!(target: "playback", "Pre-empted by a new play request");
                    sink.stop();
                    return Some(next);
                }
                Ok(PlaybackCommand::Shutdown) => {
                    sink.stop();
                    return Some(PlaybackCommand::Shutdown);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    sink.stop();
                    return Some(PlaybackCommand::Shutdown);
                }
            }
        }
    }

    fn new_sink(&mut self) -> Result<Sink, PlaybackError> {
        if self.output.is_none() {
            let (stream, handle) = OutputStream::try_default()
                .map_err(|e| PlaybackError::DeviceUnavailable(e.to_string()))?;
            self.output = Some((stream, handle));
        }
        let (_, handle) = self
            .output
            .as_ref()
            .ok_or_else(|| PlaybackError::DeviceUnavailable("no output stream".to_string()))?;
        Sink::try_new(handle).map_err(|e| PlaybackError::Rejected(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn undecodable_bytes_are_rejected() {
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let handle =
            PlaybackHandle::spawn(event_tx, Arc::new(SessionMetrics::default())).unwrap();

        handle.play(vec![0u8; 32]);
        // Either no output device (headless) or a decode failure; both
        // surface as Rejected and never as Started/Finished.
        match event_rx.recv().await {
            Some(PlaybackEvent::Rejected(_)) => {}
            other => panic!("expected Rejected, got {other:?}"),
        }
        handle.shutdown();
    }

    #[tokio::test]
    async fn stop_before_any_play_is_a_noop() {
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let handle =
            PlaybackHandle::spawn(event_tx, Arc::new(SessionMetrics::default())).unwrap();

        handle.stop();
        handle.shutdown();
        assert!(event_rx.recv().await.is_none());
    }
}
