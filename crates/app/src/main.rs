use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriterExt;

use converse_app::orchestrator::{OrchestratorConfig, UserCommand};
use converse_app::runtime::{self, RuntimeOptions};
use converse_audio::DeviceManager;
use converse_foundation::{CaptureConfig, ConversationTurn};
use converse_vad::{SegmenterConfig, VadConfig};

#[derive(Parser, Debug)]
#[command(name = "converse", about = "Real-time turn-taking voice conversation client")]
struct Args {
    /// Backend WebSocket endpoint
    #[arg(long, env = "CONVERSE_BACKEND_URL", default_value = "ws://127.0.0.1:8000/voice-chat")]
    url: String,

    /// Input device name (system default when omitted)
    #[arg(long, short = 'D', env = "CONVERSE_DEVICE")]
    device: Option<String>,

    /// List input devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Start listening immediately instead of waiting for a toggle
    #[arg(long)]
    auto_start: bool,

    /// Capture frame length in milliseconds
    #[arg(long, default_value_t = 32)]
    frame_ms: u32,

    /// Speech probability at or above which a frame counts as speech
    #[arg(long, default_value_t = 0.8)]
    positive_speech_threshold: f32,

    /// Speech probability below which a frame counts toward silence
    #[arg(long, default_value_t = 0.3)]
    negative_speech_threshold: f32,

    /// Speech frames required before a segment is considered real
    #[arg(long, default_value_t = 5)]
    min_speech_frames: u32,

    /// Grace frames of silence tolerated inside a segment
    #[arg(long, default_value_t = 30)]
    redemption_frames: u32,

    /// Context frames kept from before speech onset
    #[arg(long, default_value_t = 10)]
    pre_speech_pad_frames: usize,

    /// Manual stops earlier than this discard the segment (ms)
    #[arg(long, default_value_t = 5_000)]
    min_turn_ms: u64,

    /// Cooldown after a short manual stop (ms)
    #[arg(long, default_value_t = 1_500)]
    cooldown_ms: u64,

    /// Maximum capture length without a detected speech end (ms)
    #[arg(long, default_value_t = 10_000)]
    silence_timeout_ms: u64,

    /// Maximum wait for playback completion before forced recovery (ms)
    #[arg(long, default_value_t = 60_000)]
    failsafe_timeout_ms: u64,

    /// Pause between reply playback ending and the mic reopening (ms)
    #[arg(long, default_value_t = 300)]
    resume_delay_ms: u64,
}

fn init_logging() -> anyhow::Result<()> {
    std::fs::create_dir_all("logs")?;
    let file_appender = RollingFileAppender::new(Rotation::DAILY, "logs", "converse.log");
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr.and(non_blocking_file))
        .with_env_filter(log_level)
        .init();
    std::mem::forget(guard);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging()?;

    if args.list_devices {
        let manager = DeviceManager::new();
        for device in manager.enumerate() {
            let marker = if device.is_default { " (default)" } else { "" };
            println!("{}{}", device.name, marker);
        }
        return Ok(());
    }

    let opts = RuntimeOptions {
        backend_url: args.url.clone(),
        capture: CaptureConfig {
            frame_ms: args.frame_ms,
            ..Default::default()
        },
        segmenter: SegmenterConfig {
            vad: VadConfig {
                positive_speech_threshold: args.positive_speech_threshold,
                negative_speech_threshold: args.negative_speech_threshold,
                min_speech_frames: args.min_speech_frames,
                redemption_frames: args.redemption_frames,
            },
            pre_speech_pad_frames: args.pre_speech_pad_frames,
            ..Default::default()
        },
        orchestrator: OrchestratorConfig {
            device: args.device.clone(),
            min_turn: Duration::from_millis(args.min_turn_ms),
            cooldown: Duration::from_millis(args.cooldown_ms),
            silence_timeout: Duration::from_millis(args.silence_timeout_ms),
            failsafe_timeout: Duration::from_millis(args.failsafe_timeout_ms),
            resume_delay: Duration::from_millis(args.resume_delay_ms),
        },
    };

    let handle = runtime::start(opts).await?;
    tracing::info!("Connected to {}", args.url);

    if args.auto_start {
        let _ = handle.user_tx.send(UserCommand::Start).await;
    }

    // Status line mirror.
    let mut status_rx = handle.status_rx.clone();
    let status_task = tokio::spawn(async move {
        loop {
            println!("[{}]", *status_rx.borrow_and_update());
            if status_rx.changed().await.is_err() {
                break;
            }
        }
    });

    println!("Press Enter to toggle the conversation, or type 'quit' to exit.");
    let user_tx = handle.user_tx.clone();
    let turn_rx = handle.turn_rx.clone();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(input)) => {
                        let input = input.trim().to_lowercase();
                        if input == "quit" || input == "q" {
                            break;
                        }
                        let cmd = match *turn_rx.borrow() {
                            ConversationTurn::Idle => UserCommand::Start,
                            ConversationTurn::Speaking => UserCommand::Interrupt,
                            _ => UserCommand::Stop,
                        };
                        let _ = user_tx.send(cmd).await;
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            _ = runtime::AppHandle::wait_for_shutdown_signal() => break,
        }
    }

    status_task.abort();
    handle.shutdown().await;
    Ok(())
}
