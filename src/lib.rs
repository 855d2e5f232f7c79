//! Relay Call - P2P Voice/Video Call Client
//!
//! Ein Voice/Video-Call-Client, der über einen gemeinsamen Relay-Server
//! signalisiert und Medien überträgt:
//! - WebSocket-Relay für Signaling und Medien (Flood-Broadcast)
//! - ffmpeg-Prozesse für Kamera und Mikrofon
//! - zstd-Kompression für jeden Audio-Chunk und Video-Frame
//! - Interaktive Kommandozeile

pub mod call_engine;
pub mod codec;
pub mod config;
pub mod console;
pub mod devices;
pub mod media;
pub mod signaling;

use anyhow::Context;
use call_engine::{Command, SessionConfig, SessionController};
use codec::Compressor;
use config::Config;
use console::Outcome;
use media::{FfmpegCapture, MediaReceiver, PlaybackOptions, ProcessPlayback};
use signaling::{detect_local_ip, LocalIdentity, Registration, RelayClient, SignalingEvent};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

/// Standard-Filter für das Logging (überschreibbar mit RUST_LOG)
pub const DEFAULT_LOG_FILTER: &str = "relay_call=info";

/// Wartezeit für ausstehende Nachrichten beim Beenden
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Länge der Mikrofon-Testaufnahme
const MIC_TEST_DURATION_SECS: usize = 3;

/// Initialisiert das Logging (stderr, damit die Konsole lesbar bleibt)
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));

    // Zweiter Aufruf (z.B. in Tests) ist kein Fehler
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Startet den Client mit Konfiguration aus Umgebung und Argumenten
pub async fn run() -> anyhow::Result<()> {
    init_tracing();
    let config = Config::from_env().context("Invalid configuration")?;
    run_with(config).await
}

/// Hauptschleife: Befehle, Relay-Events, Capture-Frames und Timer
///
/// Gibt einen Fehler zurück, wenn die Relay-Verbindung abbricht.
pub async fn run_with(config: Config) -> anyhow::Result<()> {
    tracing::info!("Starting relay-call as '{}'", config.nickname);

    let identity = LocalIdentity::new(config.nickname.clone(), detect_local_ip());
    tracing::info!("Node id {} ({})", identity.node_id, identity.ip);

    let ffmpeg = config.ffmpeg.clone();
    let devices = tokio::task::spawn_blocking(move || devices::discover(&ffmpeg))
        .await
        .context("Device discovery failed")?;

    // Relay verbinden (Registrierung wird sofort gesendet)
    let registration = Registration::new(
        &identity,
        config.channel.clone(),
        config.port,
        config.mode.clone(),
    );
    let client = RelayClient::new(config.relay_url.clone(), registration);
    let mut connection = client
        .connect()
        .await
        .with_context(|| format!("Relay server {} unreachable", config.relay_url))?;
    let keepalive = connection.handle.start_keepalive(config.keepalive_interval);

    // Medien
    let compressor = Compressor::new(config.compression_level);
    let capture = FfmpegCapture::new(config.ffmpeg.clone(), config.video, config.audio);
    let playback = ProcessPlayback::new(PlaybackOptions {
        player: config.player.clone(),
        viewer: config.viewer.clone(),
        frame_path: config.frame_path.clone(),
        sample_rate: config.audio.sample_rate,
        serial: config.serial_playback,
    });
    tracing::info!("Received video frames go to {}", playback.frame_path().display());
    let receiver = MediaReceiver::new(Box::new(playback), compressor);

    let session_config = SessionConfig {
        call_timeout: config.call_timeout,
        ring_interval: config.ring_interval,
        mic_test_bytes: config.audio.bytes_per_second() * MIC_TEST_DURATION_SECS,
        compressor,
        ffmpeg: config.ffmpeg.clone(),
    };
    let (mut controller, mut channels) = SessionController::new(
        identity,
        connection.handle.clone(),
        devices,
        Box::new(capture),
        receiver,
        session_config,
    );

    // Event-Ausgabe
    let mut events = controller.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(line) = console::render_event(&event) {
                        println!("{line}");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Console lagged, {} events skipped", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    println!(
        "Connected to {} as {} (channel #{}). Type /help for commands.",
        config.relay_url, config.nickname, config.channel
    );

    let mut input = console::spawn_line_reader(std::io::BufReader::new(std::io::stdin()))
        .context("Failed to start console input")?;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let result = loop {
        tokio::select! {
            line = input.recv() => match line {
                Some(Ok(line)) => match console::execute(&mut controller, Command::parse(&line)) {
                    Ok(Outcome::Quit) => break Ok(()),
                    Ok(Outcome::Continue(Some(reply))) => println!("{reply}"),
                    Ok(Outcome::Continue(None)) => {}
                    Err(e) => println!("{e}"),
                },
                None => {
                    tracing::info!("Input closed");
                    break Ok(());
                }
                Some(Err(e)) => break Err(anyhow::Error::new(e).context("Failed to read input")),
            },
            Some(event) = connection.events.recv() => {
                if let SignalingEvent::Disconnected { reason } = &event {
                    let reason = reason.clone().unwrap_or_else(|| "connection closed".to_string());
                    controller.handle_signaling(event);
                    break Err(anyhow::anyhow!("Relay connection lost: {reason}"));
                }
                controller.handle_signaling(event);
            }
            Some(event) = channels.capture_rx.recv() => controller.handle_capture(event),
            Some(event) = channels.timer_rx.recv() => controller.handle_timer(event),
            _ = &mut ctrl_c => {
                tracing::info!("Interrupted");
                break Ok(());
            }
        }
    };

    // Pipelines stoppen und Partner/Gruppe benachrichtigen, dann schließen
    controller.shutdown();
    keepalive.abort();
    connection.shutdown(SHUTDOWN_GRACE).await;

    drop(controller);
    let _ = printer.await;

    if let Err(e) = &result {
        tracing::error!("{:#}", e);
    }
    result
}
