//! One duplex connection to the conversational backend.
//!
//! The socket is split on connect: the write half backs `send`, the read
//! half runs a reader task that parses inbound messages and delivers them,
//! in arrival order, over a single event channel. Connection loss closes
//! the turn with one terminal `Closed` event; reconnection is the caller's
//! concern.

use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::error::LinkError;
use crate::protocol::{parse_message, TranscriptEvent};
use converse_vad::Utterance;

type WsSink = futures::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = futures::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug)]
pub enum LinkEvent {
    Transcript(TranscriptEvent),
    /// An outbound send failed; the utterance was not delivered.
    SendFailed(LinkError),
    /// Terminal for this connection. No further events follow.
    Closed,
}

#[derive(Debug)]
pub enum LinkCommand {
    SendUtterance(Utterance),
}

pub struct TranscriptStreamer {
    sink: WsSink,
    connected: Arc<AtomicBool>,
}

impl TranscriptStreamer {
    /// Connect and start the reader task. Inbound events and the terminal
    /// `Closed` arrive on `event_tx`.
    pub async fn connect(
        url: &str,
        event_tx: mpsc::Sender<LinkEvent>,
    ) -> Result<Self, LinkError> {
        info!(target: "link", "Connecting to backend at {}", url);
        let (socket, _) = connect_async(url).await?;
        let (sink, stream) = socket.split();
        let connected = Arc::new(AtomicBool::new(true));

        tokio::spawn(read_loop(stream, event_tx, connected.clone()));

        Ok(Self { sink, connected })
    }

    /// Transmit one utterance as a binary frame. Fails fast with
    /// `NotConnected` when the connection has closed; nothing is queued.
    pub async fn send(&mut self, utterance: &Utterance) -> Result<(), LinkError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(LinkError::NotConnected);
        }
        debug!(
            target: "link",
            "Sending utterance {} ({} bytes)", utterance.id, utterance.bytes.len()
        );
        match self
            .sink
            .send(Message::binary(utterance.bytes.clone()))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                Err(LinkError::WebSocket(e))
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

async fn read_loop(
    mut stream: WsStream,
    event_tx: mpsc::Sender<LinkEvent>,
    connected: Arc<AtomicBool>,
) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(raw)) => match parse_message(raw.as_str()) {
                Ok(event) => {
                    if event_tx.send(LinkEvent::Transcript(event)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    // Backends grow message kinds; skip what we don't know.
                    warn!(target: "link", "Skipping unparseable message: {}", e);
                }
            },
            Ok(Message::Close(frame)) => {
                info!(target: "link", "Backend closed the connection: {:?}", frame);
                break;
            }
            Ok(other) => {
                trace!(target: "link", "Ignoring non-text frame: {:?}", other);
            }
            Err(e) => {
                warn!(target: "link", "Connection error: {}", e);
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
    let _ = event_tx.send(LinkEvent::Closed).await;
}

/// Forward orchestrator send requests to the streamer, surfacing failures
/// on the shared event channel. Keeps all socket writes on one task.
pub fn spawn_link_sender(
    mut streamer: TranscriptStreamer,
    mut cmd_rx: mpsc::Receiver<LinkCommand>,
    event_tx: mpsc::Sender<LinkEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(LinkCommand::SendUtterance(utterance)) = cmd_rx.recv().await {
            if let Err(e) = streamer.send(&utterance).await {
                warn!(target: "link", "Utterance {} send failed: {}", utterance.id, e);
                if event_tx.send(LinkEvent::SendFailed(e)).await.is_err() {
                    break;
                }
            }
        }
    })
}
