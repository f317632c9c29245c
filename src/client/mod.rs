//! Client side of the live session: connection lifecycle, capture, and the
//! event stream a UI consumes.
//!
//! The client is a small state machine reacting to inbound protocol
//! messages. Everything observable comes out as [`ClientEvent`]s on a
//! channel; everything the UI wants done goes in as [`ClientCommand`]s.
//! The reconnection backoff and the intentional-close flag are the only
//! state that survives across connections.

pub mod capture;
pub mod connection;
pub mod reconnect;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{info, warn};
use tungstenite::Message;

use crate::error::{DeviceError, LiveError};
use crate::protocol::{ClientMessage, MatchType, ServerMessage, SessionMode, CLOSE_NORMAL};
use crate::settings::Settings;

use capture::{AudioChunk, CapturePipeline};
use connection::{Heartbeat, LiveSocket};
use reconnect::{BackoffController, BackoffPolicy};

/// Where the connection currently stands, for UI polling. The event stream
/// carries the transitions; this is the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Retry budget exhausted or closed with a terminal code after a fault.
    Error,
}

/// UI-facing view of the server's `session_info` message.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub presentation_id: u64,
    pub total_slides: u32,
    pub current_slide: u32,
    pub mode: SessionMode,
    pub language: String,
}

/// Everything the UI can observe about the live session.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected(SessionSnapshot),
    Transcript { text: String, is_empty: bool },
    SlideChanged {
        slide: u32,
        match_type: MatchType,
        confidence: f32,
    },
    Status(String),
    ServerError(String),
    /// Microphone could not be opened; the session continues receive-only.
    CaptureFailed(DeviceError),
    /// A retry is scheduled after a lost connection.
    Reconnecting { attempt: u32, delay: Duration },
    /// Retry budget exhausted. Terminal.
    GaveUp,
    /// Session over, intentionally or by a terminal close code.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCommand {
    PauseListening,
    ResumeListening,
    SetSlide(u32),
    EndSession,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Full `ws://` or `wss://` endpoint including query credentials.
    pub url: String,
    pub capture_window: Duration,
    pub capture_min_chunk_bytes: usize,
    pub heartbeat_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl ClientConfig {
    /// Build from the shared settings, pointed at the given endpoint.
    pub fn from_settings(settings: &Settings, url: String) -> Self {
        ClientConfig {
            url,
            capture_window: settings.capture_window,
            capture_min_chunk_bytes: settings.capture_min_chunk_bytes,
            heartbeat_interval: settings.heartbeat_interval,
            backoff: BackoffPolicy {
                base: settings.backoff_base,
                cap: settings.backoff_cap,
                max_attempts: settings.backoff_max_attempts,
            },
        }
    }
}

/// Lets another thread end the session cleanly.
#[derive(Clone)]
pub struct CloseHandle(Arc<AtomicBool>);

impl CloseHandle {
    pub fn close(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

enum SessionEnd {
    Intentional,
    Lost(Option<u16>),
}

pub struct LiveClient {
    config: ClientConfig,
    intentional: Arc<AtomicBool>,
    state: Arc<Mutex<ConnectionState>>,
}

impl LiveClient {
    pub fn new(config: ClientConfig) -> Self {
        LiveClient {
            config,
            intentional: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
        }
    }

    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle(Arc::clone(&self.intentional))
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    /// Blocking connect-and-reconnect loop. Returns when the session ends
    /// intentionally, by a terminal close code, or after the retry budget.
    pub fn run(
        &self,
        commands: mpsc::Receiver<ClientCommand>,
        events: mpsc::Sender<ClientEvent>,
    ) -> Result<(), LiveError> {
        let mut backoff = BackoffController::new(self.config.backoff);
        loop {
            if self.intentional.load(Ordering::Relaxed) {
                self.set_state(ConnectionState::Disconnected);
                let _ = events.send(ClientEvent::Closed);
                return Ok(());
            }
            self.set_state(ConnectionState::Connecting);
            match connection::connect(&self.config.url) {
                Ok(mut socket) => {
                    backoff.reset();
                    self.set_state(ConnectionState::Connected);
                    match self.session_loop(&mut socket, &commands, &events) {
                        SessionEnd::Intentional => {
                            self.set_state(ConnectionState::Disconnected);
                            let _ = events.send(ClientEvent::Closed);
                            return Ok(());
                        }
                        SessionEnd::Lost(code) => {
                            if !BackoffController::should_retry(code) {
                                info!("closed with terminal code {code:?}, not retrying");
                                // 1000 leaves Disconnected; the fault codes
                                // (bad auth, unknown presentation) surface
                                // as Error.
                                self.set_state(match code {
                                    Some(c) if c != CLOSE_NORMAL => ConnectionState::Error,
                                    _ => ConnectionState::Disconnected,
                                });
                                let _ = events.send(ClientEvent::Closed);
                                return Ok(());
                            }
                            warn!("connection lost (code {code:?})");
                        }
                    }
                }
                Err(e) => warn!("connect failed: {e}"),
            }
            match backoff.next_delay() {
                Some(delay) => {
                    self.set_state(ConnectionState::Reconnecting);
                    let _ = events.send(ClientEvent::Reconnecting {
                        attempt: backoff.attempt(),
                        delay,
                    });
                    std::thread::sleep(delay);
                }
                None => {
                    self.set_state(ConnectionState::Error);
                    let _ = events.send(ClientEvent::GaveUp);
                    return Err(LiveError::Connection(
                        "reconnect attempts exhausted".to_string(),
                    ));
                }
            }
        }
    }

    fn session_loop(
        &self,
        socket: &mut LiveSocket,
        commands: &mpsc::Receiver<ClientCommand>,
        events: &mpsc::Sender<ClientEvent>,
    ) -> SessionEnd {
        // Capture failures degrade to receive-only rather than killing the
        // session; the server can still be driven by set_slide controls.
        let (chunk_tx, chunk_rx) = mpsc::channel::<AudioChunk>();
        let mut pipeline = match CapturePipeline::start(
            self.config.capture_window,
            self.config.capture_min_chunk_bytes,
            chunk_tx,
        ) {
            Ok(pipeline) => Some(pipeline),
            Err(e) => {
                warn!("capture unavailable: {e}");
                let _ = events.send(ClientEvent::CaptureFailed(e));
                None
            }
        };
        if send_control(socket, "set_content_type", None, Some(AudioChunk::CONTENT_TYPE)).is_err()
        {
            return SessionEnd::Lost(None);
        }

        let mut heartbeat = Heartbeat::new(self.config.heartbeat_interval);
        let end = loop {
            if self.intentional.load(Ordering::Relaxed) {
                let _ = send_control(socket, "end_session", None, None);
                let _ = socket.close(None);
                break SessionEnd::Intentional;
            }

            while let Ok(command) = commands.try_recv() {
                if self.apply_command(socket, pipeline.as_ref(), command).is_some() {
                    break;
                }
            }
            if self.intentional.load(Ordering::Relaxed) {
                // Loop back to run the intentional-close path.
                continue;
            }

            while let Ok(chunk) = chunk_rx.try_recv() {
                if socket.send(Message::Binary(chunk.payload.into())).is_err() {
                    break;
                }
            }

            let now = Instant::now();
            if heartbeat.due(now) && send_json(socket, &ClientMessage::Ping).is_err() {
                break SessionEnd::Lost(None);
            }
            if heartbeat.is_dead(now) {
                warn!("no pong for two heartbeat intervals, reconnecting");
                break SessionEnd::Lost(None);
            }

            match socket.read() {
                Ok(Message::Text(text)) => {
                    self.handle_server_message(socket, events, &mut heartbeat, text.as_str());
                }
                Ok(Message::Close(frame)) => {
                    break SessionEnd::Lost(frame.map(|f| f.code.into()));
                }
                Ok(_) => {}
                Err(ref e) if connection::is_timeout(e) => {}
                Err(tungstenite::Error::ConnectionClosed)
                | Err(tungstenite::Error::AlreadyClosed) => break SessionEnd::Lost(None),
                Err(e) => {
                    warn!("read failed: {e}");
                    break SessionEnd::Lost(None);
                }
            }
        };

        if let Some(pipeline) = pipeline.as_mut() {
            pipeline.stop();
        }
        end
    }

    /// Returns `Some(())` when the command ends the session.
    fn apply_command(
        &self,
        socket: &mut LiveSocket,
        pipeline: Option<&CapturePipeline>,
        command: ClientCommand,
    ) -> Option<()> {
        match command {
            ClientCommand::PauseListening => {
                if let Some(p) = pipeline {
                    p.pause();
                }
                let _ = send_control(socket, "pause", None, None);
            }
            ClientCommand::ResumeListening => {
                if let Some(p) = pipeline {
                    p.resume();
                }
                let _ = send_control(socket, "resume", None, None);
            }
            ClientCommand::SetSlide(slide) => {
                let _ = send_control(socket, "set_slide", Some(slide), None);
            }
            ClientCommand::EndSession => {
                self.intentional.store(true, Ordering::Relaxed);
                return Some(());
            }
        }
        None
    }

    fn handle_server_message(
        &self,
        socket: &mut LiveSocket,
        events: &mpsc::Sender<ClientEvent>,
        heartbeat: &mut Heartbeat,
        text: &str,
    ) {
        let message = match serde_json::from_str::<ServerMessage>(text) {
            Ok(m) => m,
            Err(e) => {
                warn!("unparseable server message: {e}");
                return;
            }
        };
        match message {
            ServerMessage::SessionInfo {
                session_id,
                presentation_id,
                total_slides,
                current_slide,
                mode,
                language,
            } => {
                let _ = events.send(ClientEvent::Connected(SessionSnapshot {
                    session_id,
                    presentation_id,
                    total_slides,
                    current_slide,
                    mode,
                    language,
                }));
            }
            ServerMessage::Transcript { text, is_empty, .. } => {
                let _ = events.send(ClientEvent::Transcript { text, is_empty });
            }
            ServerMessage::SlideChange {
                slide,
                match_type,
                confidence,
                ..
            } => {
                let _ = events.send(ClientEvent::SlideChanged {
                    slide,
                    match_type,
                    confidence,
                });
            }
            ServerMessage::Status { status } => {
                let _ = events.send(ClientEvent::Status(status));
            }
            ServerMessage::Error { message } => {
                let _ = events.send(ClientEvent::ServerError(message));
            }
            ServerMessage::Ping => {
                let _ = send_json(socket, &ClientMessage::Pong);
            }
            ServerMessage::Pong => heartbeat.note_pong(Instant::now()),
        }
    }
}

fn send_json(socket: &mut LiveSocket, message: &ClientMessage) -> Result<(), tungstenite::Error> {
    let json = serde_json::to_string(message).map_err(|e| {
        tungstenite::Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?;
    socket.send(Message::Text(json.into()))
}

fn send_control(
    socket: &mut LiveSocket,
    action: &str,
    slide: Option<u32>,
    content_type: Option<&str>,
) -> Result<(), tungstenite::Error> {
    send_json(
        socket,
        &ClientMessage::Control {
            action: action.to_string(),
            slide,
            content_type: content_type.map(str::to_string),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_carries_the_tuned_knobs() {
        let mut settings = Settings::default();
        settings.capture_window = Duration::from_millis(1500);
        settings.capture_min_chunk_bytes = 256;
        settings.heartbeat_interval = Duration::from_secs(10);
        settings.backoff_base = Duration::from_millis(250);
        settings.backoff_cap = Duration::from_secs(4);
        settings.backoff_max_attempts = 3;

        let config = ClientConfig::from_settings(&settings, "ws://localhost:9/ws".to_string());
        assert_eq!(config.capture_window, Duration::from_millis(1500));
        assert_eq!(config.capture_min_chunk_bytes, 256);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.backoff.base, Duration::from_millis(250));
        assert_eq!(config.backoff.cap, Duration::from_secs(4));
        assert_eq!(config.backoff.max_attempts, 3);
    }

    #[test]
    fn events_are_cloneable_for_fan_out() {
        let event = ClientEvent::CaptureFailed(DeviceError::PermissionDenied);
        assert_eq!(event.clone(), event);
    }
}
