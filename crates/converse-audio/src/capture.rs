//! Microphone session lifecycle on a dedicated OS thread.
//!
//! cpal streams are not `Send`, so the stream lives on one named thread
//! driven by a command channel. At most one session is open at any time;
//! acquire-while-open releases the old session first, and release is
//! idempotent. Frames are downmixed to mono i16, chunked to a fixed
//! duration, and forwarded without ever blocking the audio callback.

use converse_foundation::{AudioFrame, CaptureConfig, CaptureError};
use converse_telemetry::SessionMetrics;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::SampleFormat;
use crossbeam_channel::RecvTimeoutError;
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::device::{candidate_order, DeviceManager};

const DEVICE_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub enum CaptureCommand {
    Acquire { device: Option<String> },
    Release,
    Shutdown,
}

#[derive(Debug)]
pub enum CaptureEvent {
    Opened {
        device: String,
        sample_rate_hz: u32,
    },
    Denied(CaptureError),
    Closed,
    DevicesChanged(Vec<String>),
}

/// Handle to the capture thread.
pub struct CaptureHandle {
    cmd_tx: crossbeam_channel::Sender<CaptureCommand>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    pub fn spawn(
        cfg: CaptureConfig,
        frame_tx: mpsc::Sender<AudioFrame>,
        event_tx: mpsc::Sender<CaptureEvent>,
        metrics: Arc<SessionMetrics>,
    ) -> Result<Self, CaptureError> {
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let mut worker = CaptureWorker {
                    cfg,
                    frame_tx,
                    event_tx,
                    metrics,
                    devices: DeviceManager::new(),
                    session: None,
                    known_devices: Vec::new(),
                };
                worker.known_devices = worker.sorted_device_names();
                worker.run(cmd_rx);
            })
            .map_err(|e| CaptureError::Fatal(format!("spawn audio-capture thread: {e}")))?;

        Ok(Self {
            cmd_tx,
            handle: Some(handle),
        })
    }

    pub fn acquire(&self, device: Option<String>) {
        let _ = self.cmd_tx.send(CaptureCommand::Acquire { device });
    }

    pub fn release(&self) {
        let _ = self.cmd_tx.send(CaptureCommand::Release);
    }

    pub fn shutdown(mut self) {
        let _ = self.cmd_tx.send(CaptureCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct OpenSession {
    _stream: cpal::Stream,
    device_name: String,
}

struct CaptureWorker {
    cfg: CaptureConfig,
    frame_tx: mpsc::Sender<AudioFrame>,
    event_tx: mpsc::Sender<CaptureEvent>,
    metrics: Arc<SessionMetrics>,
    devices: DeviceManager,
    session: Option<OpenSession>,
    known_devices: Vec<String>,
}

impl CaptureWorker {
    fn run(&mut self, cmd_rx: crossbeam_channel::Receiver<CaptureCommand>) {
        info!(target: "capture", "Capture thread started");
        loop {
            match cmd_rx.recv_timeout(DEVICE_POLL_INTERVAL) {
                Ok(CaptureCommand::Acquire { device }) => self.acquire(device),
                Ok(CaptureCommand::Release) => self.release(),
                Ok(CaptureCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    self.release();
                    break;
                }
                Err(RecvTimeoutError::Timeout) => self.poll_devices(),
            }
        }
        info!(target: "capture", "Capture thread exiting");
    }

    fn acquire(&mut self, device: Option<String>) {
        if self.session.is_some() {
            warn!(target: "capture", "Acquire while a session is open; releasing first");
            self.release();
        }

        info!(
            target: "capture",
            "Acquiring microphone (device={:?}, constraints={:?})",
            device, self.cfg.constraints
        );

        // A named device is honored exactly; the default request may fall
        // back through the candidate list until one produces a stream.
        let attempts: Vec<Option<String>> = match device {
            Some(name) => vec![Some(name)],
            None => {
                let candidates = candidate_order(
                    None,
                    self.devices.default_input_name().as_deref(),
                    &self.devices.input_names(),
                );
                if candidates.is_empty() {
                    vec![None]
                } else {
                    candidates.into_iter().map(Some).collect()
                }
            }
        };

        let mut last_err = None;
        for attempt in attempts {
            match self.open_stream(attempt.as_deref()) {
                Ok((stream, device_name, sample_rate_hz)) => {
                    self.session = Some(OpenSession {
                        _stream: stream,
                        device_name: device_name.clone(),
                    });
                    let _ = self.event_tx.blocking_send(CaptureEvent::Opened {
                        device: device_name,
                        sample_rate_hz,
                    });
                    return;
                }
                Err(e) => {
                    warn!(target: "capture", "Failed to open {:?}: {}", attempt, e);
                    last_err = Some(e);
                }
            }
        }
        let err = last_err.unwrap_or(CaptureError::DeviceNotFound { name: None });
        let _ = self.event_tx.blocking_send(CaptureEvent::Denied(err));
    }

    /// Idempotent: releasing with no open session does nothing. Dropping the
    /// stream stops the underlying hardware tracks synchronously.
    fn release(&mut self) {
        if let Some(session) = self.session.take() {
            info!(target: "capture", "Releasing microphone ({})", session.device_name);
            drop(session);
            let _ = self.event_tx.blocking_send(CaptureEvent::Closed);
        }
    }

    fn open_stream(
        &self,
        requested: Option<&str>,
    ) -> Result<(cpal::Stream, String, u32), CaptureError> {
        let device = self.devices.resolve(requested)?;
        let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());
        let supported = device.default_input_config()?;
        let sample_rate_hz = supported.sample_rate().0;
        let channels = supported.channels();
        let config: cpal::StreamConfig = supported.config();

        let frame_size = (sample_rate_hz as u64 * self.cfg.frame_ms as u64 / 1000).max(1) as usize;
        let accumulator = Arc::new(Mutex::new(FrameAccumulator::new(
            frame_size,
            sample_rate_hz,
            channels,
            self.frame_tx.clone(),
            self.metrics.clone(),
        )));

        let err_fn = |e: cpal::StreamError| {
            warn!(target: "capture", "Stream error: {}", e);
        };

        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                let acc = accumulator.clone();
                device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| acc.lock().push_f32(data),
                    err_fn,
                    None,
                )
            }
            SampleFormat::I16 => {
                let acc = accumulator.clone();
                device.build_input_stream(
                    &config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| acc.lock().push_i16(data),
                    err_fn,
                    None,
                )
            }
            SampleFormat::U16 => {
                let acc = accumulator.clone();
                device.build_input_stream(
                    &config,
                    move |data: &[u16], _: &cpal::InputCallbackInfo| acc.lock().push_u16(data),
                    err_fn,
                    None,
                )
            }
            other => {
                return Err(CaptureError::FormatNotSupported {
                    format: format!("{other:?}"),
                })
            }
        }
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => CaptureError::PermissionDenied {
                reason: "input device not available (in use or access denied)".to_string(),
            },
            other => CaptureError::BuildStream(other),
        })?;

        stream.play()?;
        debug!(
            target: "capture",
            "Stream open on '{}' at {} Hz, {} ch, {} samples/frame",
            device_name, sample_rate_hz, channels, frame_size
        );
        Ok((stream, device_name, sample_rate_hz))
    }

    fn sorted_device_names(&self) -> Vec<String> {
        let mut names = self.devices.input_names();
        names.sort();
        names
    }

    fn poll_devices(&mut self) {
        let names = self.sorted_device_names();
        if names != self.known_devices {
            debug!(target: "capture", "Input device list changed: {:?}", names);
            self.known_devices = names.clone();
            let _ = self
                .event_tx
                .blocking_send(CaptureEvent::DevicesChanged(names));
        }
    }
}

/// Accumulates interleaved samples from the audio callback into fixed-size
/// mono frames. Runs inside the callback, so sends are non-blocking and
/// overflow is counted rather than waited out.
struct FrameAccumulator {
    frame_size: usize,
    sample_rate_hz: u32,
    channels: u16,
    pending: Vec<i16>,
    samples_emitted: u64,
    frame_tx: mpsc::Sender<AudioFrame>,
    metrics: Arc<SessionMetrics>,
}

impl FrameAccumulator {
    fn new(
        frame_size: usize,
        sample_rate_hz: u32,
        channels: u16,
        frame_tx: mpsc::Sender<AudioFrame>,
        metrics: Arc<SessionMetrics>,
    ) -> Self {
        Self {
            frame_size,
            sample_rate_hz,
            channels,
            pending: Vec::with_capacity(frame_size * 2),
            samples_emitted: 0,
            frame_tx,
            metrics,
        }
    }

    fn push_f32(&mut self, interleaved: &[f32]) {
        let channels = self.channels.max(1) as usize;
        for group in interleaved.chunks_exact(channels) {
            let sum: f32 = group.iter().sum();
            let mono = (sum / channels as f32).clamp(-1.0, 1.0);
            self.pending.push((mono * 32767.0) as i16);
        }
        self.drain_frames();
    }

    fn push_i16(&mut self, interleaved: &[i16]) {
        let channels = self.channels.max(1) as usize;
        for group in interleaved.chunks_exact(channels) {
            let sum: i32 = group.iter().map(|&s| s as i32).sum();
            self.pending.push((sum / channels as i32) as i16);
        }
        self.drain_frames();
    }

    fn push_u16(&mut self, interleaved: &[u16]) {
        let channels = self.channels.max(1) as usize;
        for group in interleaved.chunks_exact(channels) {
            let sum: i32 = group.iter().map(|&s| s as i32 - 32768).sum();
            self.pending.push((sum / channels as i32) as i16);
        }
        self.drain_frames();
    }

    fn drain_frames(&mut self) {
        while self.pending.len() >= self.frame_size {
            let samples: Vec<i16> = self.pending.drain(..self.frame_size).collect();
            let timestamp_ms = self.samples_emitted * 1000 / self.sample_rate_hz as u64;
            self.samples_emitted += samples.len() as u64;

            let frame = AudioFrame {
                samples,
                sample_rate_hz: self.sample_rate_hz,
                timestamp_ms,
            };
            match self.frame_tx.try_send(frame) {
                Ok(()) => {
                    self.metrics.frames_captured.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    self.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accumulator(
        frame_size: usize,
        channels: u16,
        capacity: usize,
    ) -> (FrameAccumulator, mpsc::Receiver<AudioFrame>, Arc<SessionMetrics>) {
        let (tx, rx) = mpsc::channel(capacity);
        let metrics = Arc::new(SessionMetrics::default());
        (
            FrameAccumulator::new(frame_size, 16_000, channels, tx, metrics.clone()),
            rx,
            metrics,
        )
    }

    #[test]
    fn stereo_f32_downmixes_to_mono_frames() {
        let (mut acc, mut rx, _) = accumulator(4, 2, 8);
        // 8 stereo sample pairs -> 8 mono samples -> 2 frames of 4
        let data: Vec<f32> = vec![0.5; 16];
        acc.push_f32(&data);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.samples.len(), 4);
        assert_eq!(first.sample_rate_hz, 16_000);
        assert_eq!(first.timestamp_ms, 0);
        assert!(first.samples.iter().all(|&s| s > 16_000));

        let second = rx.try_recv().unwrap();
        assert_eq!(second.timestamp_ms, 4 * 1000 / 16_000);
    }

    #[test]
    fn overflow_counts_dropped_frames() {
        let (mut acc, _rx, metrics) = accumulator(2, 1, 1);
        acc.push_i16(&[1, 2, 3, 4, 5, 6]);
        // capacity 1: first frame queued, the rest dropped
        assert_eq!(metrics.frames_captured.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.frames_dropped.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn u16_samples_center_on_zero() {
        let (mut acc, mut rx, _) = accumulator(2, 1, 4);
        acc.push_u16(&[32768, 32768]);
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.samples, vec![0, 0]);
    }
}
