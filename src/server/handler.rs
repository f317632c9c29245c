//! Per-connection protocol handler.
//!
//! Binary frames are raw audio chunks; text frames are JSON messages with a
//! `type` discriminator. Everything for one connection runs on one thread,
//! so chunks and transcripts are processed strictly in arrival order.

use std::io::ErrorKind;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tungstenite::handshake::server::{Request, Response};
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::CloseFrame;
use tungstenite::{Message, WebSocket};
use tracing::{debug, info, warn};

use crate::command::phrase::{locales_for_language, match_phrase, Locale};
use crate::error::LiveError;
use crate::protocol::{ClientMessage, ServerMessage, CLOSE_NORMAL, CLOSE_NOT_FOUND};
use crate::session::{ApplyOutcome, SessionHandle, SessionPhase, SlideStateMachine};

use super::{ConnectRequest, ServerContext};

/// Read timeout per poll; keeps the loop responsive to supersede and idle
/// checks without burning CPU.
const READ_TICK: Duration = Duration::from_millis(100);

enum LoopExit {
    /// Client asked to end the session.
    Ended,
    /// A newer connection took over this session.
    Superseded,
    /// Nothing heard for the idle window.
    IdleTimeout,
    /// Transport closed; the session record stays for resume.
    Disconnected,
}

pub fn handle_connection(stream: TcpStream, context: Arc<ServerContext>) -> Result<()> {
    let mut request_uri = String::new();
    let mut socket = tungstenite::accept_hdr(stream, |req: &Request, response: Response| {
        request_uri = req.uri().to_string();
        Ok(response)
    })
    .map_err(|e| anyhow::anyhow!("websocket handshake failed: {e}"))?;
    socket.get_ref().set_read_timeout(Some(READ_TICK))?;

    let Some(connect) = ConnectRequest::parse(&request_uri) else {
        send(&mut socket, &ServerMessage::Error {
            message: format!("unknown endpoint {request_uri}"),
        })?;
        close_with(&mut socket, CLOSE_NOT_FOUND, "unknown endpoint");
        return Ok(());
    };

    let identity = match context
        .auth
        .authenticate(connect.token.as_deref(), connect.guest_token.as_deref())
    {
        Ok(identity) => identity,
        Err(e) => return reject(&mut socket, e),
    };
    let presentation = match context.presentations.fetch(connect.presentation_id) {
        Ok(p) => p,
        Err(e) => return reject(&mut socket, e),
    };

    let mode = crate::protocol::SessionMode::parse(&connect.mode);
    let handle =
        context
            .sessions
            .create_or_resume(&presentation, identity, mode, &connect.language);
    let mut session = handle.session.clone();
    session.mode = mode;
    session.language = connect.language.clone();

    let mut machine = SlideStateMachine::new(
        presentation.total_slides,
        handle.starting_slide,
        context.settings.command_cooldown,
    );
    machine.start();

    send(&mut socket, &ServerMessage::SessionInfo {
        session_id: session.id.clone(),
        presentation_id: session.presentation_id,
        total_slides: session.total_slides,
        current_slide: machine.current_slide(),
        mode: session.mode,
        language: session.language.clone(),
    })?;
    send(&mut socket, &ServerMessage::Status {
        status: "connected".to_string(),
    })?;
    send(&mut socket, &ServerMessage::Status {
        status: "listening".to_string(),
    })?;
    info!(
        "session {} connected (presentation {}, slide {}, resumed={})",
        session.id, session.presentation_id, machine.current_slide(), handle.resumed
    );

    let locales = locales_for_language(&session.language);
    let idle_timeout = context.settings.idle_timeout;
    let mut chunk_index: u64 = 0;
    let mut last_activity = Instant::now();

    let exit = loop {
        if handle.is_superseded() {
            break LoopExit::Superseded;
        }
        match socket.read() {
            Ok(Message::Binary(data)) => {
                last_activity = Instant::now();
                process_audio(
                    &mut socket,
                    &context,
                    &handle,
                    &session,
                    &mut machine,
                    &locales,
                    data.as_ref(),
                    chunk_index,
                )?;
                chunk_index += 1;
            }
            Ok(Message::Text(text)) => {
                last_activity = Instant::now();
                if let Some(exit) = dispatch_text(
                    &mut socket,
                    &context,
                    &handle,
                    &mut session,
                    &mut machine,
                    text.as_str(),
                )? {
                    break exit;
                }
            }
            Ok(Message::Close(_)) => break LoopExit::Disconnected,
            Ok(_) => {}
            Err(tungstenite::Error::Io(ref e))
                if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
            {
                if last_activity.elapsed() > idle_timeout {
                    break LoopExit::IdleTimeout;
                }
            }
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                break LoopExit::Disconnected;
            }
            Err(e) => {
                warn!("session {}: read failed: {e}", session.id);
                break LoopExit::Disconnected;
            }
        }
    };

    // No-op for a superseded handle; the record now tracks the successor's
    // position and a stale slide must not clobber it.
    context.sessions.save_position(&handle, machine.current_slide());
    machine.end();
    match exit {
        LoopExit::Ended => {
            close_with(&mut socket, CLOSE_NORMAL, "session ended");
            context.sessions.end_session(&handle);
            info!("session {} ended by client", session.id);
        }
        LoopExit::IdleTimeout => {
            close_with(&mut socket, CLOSE_NORMAL, "idle timeout");
            context.sessions.end_session(&handle);
            info!("session {} timed out idle", session.id);
        }
        LoopExit::Superseded => {
            // end_session is a no-op for a superseded handle; the record now
            // belongs to the newer connection.
            close_with(&mut socket, CLOSE_NORMAL, "superseded by a new connection");
            info!("session {} superseded", session.id);
        }
        LoopExit::Disconnected => {
            // Keep the record so a reconnect resumes on the same slide.
            info!(
                "session {} disconnected on slide {}",
                session.id,
                machine.current_slide()
            );
        }
    }
    Ok(())
}

/// One audio chunk through the whole pipeline: gate, transcribe, classify,
/// apply, notify.
fn process_audio(
    socket: &mut WebSocket<TcpStream>,
    context: &ServerContext,
    handle: &SessionHandle,
    session: &crate::session::Session,
    machine: &mut SlideStateMachine,
    locales: &[Locale],
    audio: &[u8],
    chunk_index: u64,
) -> Result<()> {
    if machine.phase() != SessionPhase::Active {
        debug!("dropping chunk #{chunk_index} while {:?}", machine.phase());
        return Ok(());
    }
    if audio.len() < context.settings.server_min_chunk_bytes {
        debug!("dropping {}-byte chunk #{chunk_index} as silence", audio.len());
        return Ok(());
    }

    send(socket, &ServerMessage::Status {
        status: "processing".to_string(),
    })?;

    match context.stt.transcribe(
        audio,
        &session.audio_content_type,
        &session.language,
        chunk_index,
    ) {
        Ok(segment) => {
            send(socket, &ServerMessage::Transcript {
                text: segment.text.clone(),
                chunk_index: segment.chunk_index,
                duration_ms: segment.duration_ms,
                is_empty: segment.is_empty(),
            })?;
            if segment.is_final && !segment.is_empty() {
                let command = match_phrase(&segment.text, locales).or_else(|| {
                    context.classifier.classify(
                        &segment.text,
                        machine.current_slide(),
                        session.total_slides,
                    )
                });
                if let Some(command) = command {
                    apply_command(socket, context, handle, session, machine, &command)?;
                }
            }
        }
        Err(e) => {
            warn!("session {}: chunk #{chunk_index} failed: {e}", session.id);
            send(socket, &ServerMessage::Error {
                message: format!("transcription failed: {e}"),
            })?;
        }
    }

    send(socket, &ServerMessage::Status {
        status: "listening".to_string(),
    })
}

fn apply_command(
    socket: &mut WebSocket<TcpStream>,
    context: &ServerContext,
    handle: &SessionHandle,
    session: &crate::session::Session,
    machine: &mut SlideStateMachine,
    command: &crate::command::Command,
) -> Result<()> {
    match machine.apply(command) {
        ApplyOutcome::Accepted {
            slide,
            match_type,
            confidence,
            matched_keywords,
        } => {
            send(socket, &ServerMessage::SlideChange {
                slide,
                match_type,
                confidence,
                matched_keywords,
            })?;
            context.sessions.save_position(handle, slide);
        }
        outcome => debug!(
            "session {}: {:?} not applied: {:?}",
            session.id, command.kind, outcome
        ),
    }
    Ok(())
}

/// Returns `Some(exit)` when the message ends the read loop.
fn dispatch_text(
    socket: &mut WebSocket<TcpStream>,
    context: &ServerContext,
    handle: &SessionHandle,
    session: &mut crate::session::Session,
    machine: &mut SlideStateMachine,
    text: &str,
) -> Result<Option<LoopExit>> {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("session {}: unparseable text frame: {e}", session.id);
            return Ok(None);
        }
    };
    match message {
        ClientMessage::Control {
            action,
            slide,
            content_type,
        } => match action.as_str() {
            "start" => {
                machine.start();
                send(socket, &ServerMessage::Status {
                    status: "listening".to_string(),
                })?;
            }
            "stop" | "end_session" => return Ok(Some(LoopExit::Ended)),
            "pause" => {
                machine.pause();
                send(socket, &ServerMessage::Status {
                    status: "paused".to_string(),
                })?;
            }
            "resume" => {
                machine.resume();
                send(socket, &ServerMessage::Status {
                    status: "listening".to_string(),
                })?;
            }
            "set_slide" => {
                if let Some(target) = slide {
                    match machine.force_set(target) {
                        ApplyOutcome::Accepted {
                            slide,
                            match_type,
                            confidence,
                            matched_keywords,
                        } => {
                            send(socket, &ServerMessage::SlideChange {
                                slide,
                                match_type,
                                confidence,
                                matched_keywords,
                            })?;
                            context.sessions.save_position(handle, slide);
                        }
                        outcome => debug!(
                            "session {}: set_slide {} rejected: {:?}",
                            session.id, target, outcome
                        ),
                    }
                }
            }
            "set_content_type" => {
                if let Some(ct) = content_type {
                    session.audio_content_type = ct;
                }
            }
            other => warn!("session {}: unknown control action '{other}'", session.id),
        },
        ClientMessage::Ping => send(socket, &ServerMessage::Pong)?,
        ClientMessage::Pong => {}
        ClientMessage::Unknown => {
            warn!("session {}: unknown message type ignored", session.id);
        }
    }
    Ok(None)
}

fn send(socket: &mut WebSocket<TcpStream>, message: &ServerMessage) -> Result<()> {
    let json = serde_json::to_string(message)?;
    socket.send(Message::Text(json.into()))?;
    Ok(())
}

/// Send a rejection and close with the error's protocol code.
fn reject(socket: &mut WebSocket<TcpStream>, error: LiveError) -> Result<()> {
    warn!("rejecting connection: {error}");
    send(socket, &ServerMessage::Error {
        message: error.to_string(),
    })?;
    close_with(
        socket,
        error.close_code().unwrap_or(CLOSE_NORMAL),
        "rejected",
    );
    Ok(())
}

fn close_with(socket: &mut WebSocket<TcpStream>, code: u16, reason: &str) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    };
    let _ = socket.close(Some(frame));
    // Drain until the peer acknowledges the close, bounded so a vanished
    // peer can't pin the thread.
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        match socket.read() {
            Ok(_) => {}
            Err(tungstenite::Error::Io(ref e))
                if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
            Err(_) => break,
        }
    }
}
