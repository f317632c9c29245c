//! Loopback integration tests: a real server on an ephemeral port with
//! scripted transcription, driven by a plain tungstenite client.

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use tungstenite::{Message, WebSocket};

use podium::client::reconnect::BackoffPolicy;
use podium::client::{ClientCommand, ClientConfig, ClientEvent, ConnectionState, LiveClient};
use podium::command::intent::{IntentClassifier, NullClassifier};
use podium::command::{Command, CommandKind};
use podium::error::SttError;
use podium::presentations::{Authenticator, InMemoryPresentationStore, PresentationStore, TokenAuthenticator};
use podium::protocol::{MatchType, ServerMessage};
use podium::server::{run_server, ServerContext};
use podium::session::SessionManager;
use podium::stt::{SpeechToText, TranscriptSegment};
use podium::Settings;

/// Pretends the audio bytes are the words that were spoken.
struct EchoStt;

impl SpeechToText for EchoStt {
    fn transcribe(
        &self,
        audio: &[u8],
        _content_type: &str,
        _language: &str,
        chunk_index: u64,
    ) -> Result<TranscriptSegment, SttError> {
        Ok(TranscriptSegment {
            text: String::from_utf8_lossy(audio).trim().to_string(),
            is_final: true,
            chunk_index,
            duration_ms: 1.0,
            confidence: 1.0,
        })
    }
}

/// Recognizes one fixed utterance the phrase tables don't cover.
struct ScriptedClassifier;

impl IntentClassifier for ScriptedClassifier {
    fn classify(&self, transcript: &str, _current: u32, _total: u32) -> Option<Command> {
        if transcript.contains("could we see the fifth slide") {
            Some(Command::semantic(CommandKind::Jump, Some(5), 0.9))
        } else {
            None
        }
    }
}

fn spawn_server(settings: Settings, classifier: Arc<dyn IntentClassifier>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let presentations: Arc<dyn PresentationStore> =
        Arc::new(InMemoryPresentationStore::from_seed("1:10"));
    let auth: Arc<dyn Authenticator> = Arc::new(TokenAuthenticator::new(None));
    let context = Arc::new(ServerContext {
        settings,
        stt: Arc::new(EchoStt),
        classifier,
        auth,
        presentations: Arc::clone(&presentations),
        sessions: SessionManager::new(presentations),
    });
    std::thread::spawn(move || {
        let _ = run_server(listener, context);
    });
    port
}

fn connect(port: u16, query: &str) -> WebSocket<TcpStream> {
    let url = format!("ws://127.0.0.1:{port}/ws/presentation/1?{query}");
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let (socket, _response) = tungstenite::client::client(&url, stream).unwrap();
    socket
}

/// Next text frame, parsed. Panics if the connection closes first.
fn next_message(socket: &mut WebSocket<TcpStream>) -> ServerMessage {
    loop {
        match socket.read().unwrap() {
            Message::Text(text) => {
                return serde_json::from_str(text.as_str()).unwrap();
            }
            Message::Close(frame) => panic!("connection closed: {frame:?}"),
            _ => {}
        }
    }
}

/// Read until a message satisfies the predicate, bounded to avoid hanging a
/// broken test forever.
fn wait_for(
    socket: &mut WebSocket<TcpStream>,
    mut pred: impl FnMut(&ServerMessage) -> bool,
) -> ServerMessage {
    for _ in 0..32 {
        let msg = next_message(socket);
        if pred(&msg) {
            return msg;
        }
    }
    panic!("message never arrived");
}

/// Pad an utterance with spaces so it clears the server's silence floor.
fn audio(text: &str) -> Vec<u8> {
    let mut bytes = text.as_bytes().to_vec();
    bytes.resize(bytes.len().max(600), b' ');
    bytes
}

#[test]
fn handshake_sends_session_info_before_anything_else() {
    let port = spawn_server(Settings::default(), Arc::new(NullClassifier));
    let mut socket = connect(port, "guest_token=g-1&language=en");

    match next_message(&mut socket) {
        ServerMessage::SessionInfo {
            presentation_id,
            total_slides,
            current_slide,
            ..
        } => {
            assert_eq!(presentation_id, 1);
            assert_eq!(total_slides, 10);
            assert_eq!(current_slide, 1);
        }
        other => panic!("expected session_info first, got {other:?}"),
    }
    assert_eq!(
        next_message(&mut socket),
        ServerMessage::Status {
            status: "connected".into()
        }
    );
    assert_eq!(
        next_message(&mut socket),
        ServerMessage::Status {
            status: "listening".into()
        }
    );
}

#[test]
fn protocol_ping_gets_a_pong() {
    let port = spawn_server(Settings::default(), Arc::new(NullClassifier));
    let mut socket = connect(port, "guest_token=g-1&language=en");

    socket
        .send(Message::Text(r#"{"type":"ping"}"#.into()))
        .unwrap();
    wait_for(&mut socket, |m| matches!(m, ServerMessage::Pong));
}

#[test]
fn keyword_next_advances_and_cooldown_suppresses_the_echo() {
    let port = spawn_server(Settings::default(), Arc::new(NullClassifier));
    let mut socket = connect(port, "guest_token=g-1&language=en");

    socket
        .send(Message::Binary(audio("next slide").into()))
        .unwrap();
    let change = wait_for(&mut socket, |m| matches!(m, ServerMessage::SlideChange { .. }));
    match change {
        ServerMessage::SlideChange {
            slide, match_type, ..
        } => {
            assert_eq!(slide, 2);
            assert_eq!(match_type, MatchType::Keyword);
        }
        _ => unreachable!(),
    }

    // A second NEXT right behind the first lands inside the cooldown: the
    // transcript still arrives, but no second slide_change does.
    socket
        .send(Message::Binary(audio("next slide").into()))
        .unwrap();
    let mut saw_transcript = false;
    loop {
        match next_message(&mut socket) {
            ServerMessage::Transcript { text, .. } => {
                assert_eq!(text, "next slide");
                saw_transcript = true;
            }
            ServerMessage::SlideChange { slide, .. } => {
                panic!("cooldown should have suppressed the change to {slide}");
            }
            ServerMessage::Status { status } if status == "listening" && saw_transcript => break,
            _ => {}
        }
    }
}

#[test]
fn semantic_fallback_handles_a_jump() {
    let settings = Settings {
        command_cooldown: Duration::ZERO,
        ..Settings::default()
    };
    let port = spawn_server(settings, Arc::new(ScriptedClassifier));
    let mut socket = connect(port, "guest_token=g-1&language=en");

    socket
        .send(Message::Binary(audio("could we see the fifth slide").into()))
        .unwrap();
    let change = wait_for(&mut socket, |m| matches!(m, ServerMessage::SlideChange { .. }));
    match change {
        ServerMessage::SlideChange {
            slide,
            match_type,
            confidence,
            ..
        } => {
            assert_eq!(slide, 5);
            assert_eq!(match_type, MatchType::Semantic);
            assert!((confidence - 0.9).abs() < 1e-6);
        }
        _ => unreachable!(),
    }

    // Conversational speech with no intent changes nothing.
    socket
        .send(Message::Binary(audio("this quarter went well").into()))
        .unwrap();
    let mut saw_transcript = false;
    loop {
        match next_message(&mut socket) {
            ServerMessage::Transcript { .. } => saw_transcript = true,
            ServerMessage::SlideChange { .. } => panic!("no command expected"),
            ServerMessage::Status { status } if status == "listening" && saw_transcript => break,
            _ => {}
        }
    }
}

#[test]
fn missing_credentials_close_with_auth_code() {
    let port = spawn_server(Settings::default(), Arc::new(NullClassifier));
    let mut socket = connect(port, "mode=live");

    match next_message(&mut socket) {
        ServerMessage::Error { message } => {
            assert!(message.contains("authentication"), "got '{message}'");
        }
        other => panic!("expected error, got {other:?}"),
    }
    loop {
        match socket.read() {
            Ok(Message::Close(Some(frame))) => {
                assert_eq!(u16::from(frame.code), 4001);
                break;
            }
            Ok(_) => {}
            Err(e) => panic!("expected close frame, got {e}"),
        }
    }
}

#[test]
fn unknown_presentation_closes_with_not_found() {
    let port = spawn_server(Settings::default(), Arc::new(NullClassifier));
    let url = format!("ws://127.0.0.1:{port}/ws/presentation/999?guest_token=g-1");
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let (mut socket, _) = tungstenite::client::client(&url, stream).unwrap();

    match next_message(&mut socket) {
        ServerMessage::Error { .. } => {}
        other => panic!("expected error, got {other:?}"),
    }
    loop {
        match socket.read() {
            Ok(Message::Close(Some(frame))) => {
                assert_eq!(u16::from(frame.code), 4004);
                break;
            }
            Ok(_) => {}
            Err(e) => panic!("expected close frame, got {e}"),
        }
    }
}

#[test]
fn reconnect_resumes_on_the_saved_slide() {
    let port = spawn_server(Settings::default(), Arc::new(NullClassifier));

    let first_id;
    {
        let mut socket = connect(port, "guest_token=resumer&language=en");
        first_id = match next_message(&mut socket) {
            ServerMessage::SessionInfo { session_id, .. } => session_id,
            other => panic!("expected session_info, got {other:?}"),
        };
        socket
            .send(Message::Binary(audio("next slide").into()))
            .unwrap();
        wait_for(&mut socket, |m| {
            matches!(m, ServerMessage::SlideChange { slide: 2, .. })
        });
        // Drop the transport without ending the session.
    }

    // Give the server thread a moment to notice the disconnect.
    std::thread::sleep(Duration::from_millis(300));

    let mut socket = connect(port, "guest_token=resumer&language=en");
    match next_message(&mut socket) {
        ServerMessage::SessionInfo {
            session_id,
            current_slide,
            ..
        } => {
            assert_eq!(session_id, first_id);
            assert_eq!(current_slide, 2);
        }
        other => panic!("expected session_info, got {other:?}"),
    }
}

#[test]
fn manual_set_slide_control_is_authoritative() {
    let port = spawn_server(Settings::default(), Arc::new(NullClassifier));
    let mut socket = connect(port, "guest_token=g-1&language=en");

    socket
        .send(Message::Text(
            r#"{"type":"control","action":"set_slide","slide":7}"#.into(),
        ))
        .unwrap();
    let change = wait_for(&mut socket, |m| matches!(m, ServerMessage::SlideChange { .. }));
    match change {
        ServerMessage::SlideChange {
            slide, match_type, ..
        } => {
            assert_eq!(slide, 7);
            assert_eq!(match_type, MatchType::Manual);
        }
        _ => unreachable!(),
    }
}

#[test]
fn paused_sessions_drop_audio() {
    let port = spawn_server(Settings::default(), Arc::new(NullClassifier));
    let mut socket = connect(port, "guest_token=g-1&language=en");
    wait_for(&mut socket, |m| {
        matches!(m, ServerMessage::Status { status } if status == "listening")
    });

    socket
        .send(Message::Text(r#"{"type":"control","action":"pause"}"#.into()))
        .unwrap();
    wait_for(&mut socket, |m| {
        matches!(m, ServerMessage::Status { status } if status == "paused")
    });

    socket
        .send(Message::Binary(audio("next slide").into()))
        .unwrap();
    socket
        .send(Message::Text(r#"{"type":"control","action":"resume"}"#.into()))
        .unwrap();
    // The chunk sent while paused produced nothing; the first thing after
    // the resume is its listening status.
    loop {
        match next_message(&mut socket) {
            ServerMessage::SlideChange { .. } | ServerMessage::Transcript { .. } => {
                panic!("paused audio should be dropped")
            }
            ServerMessage::Status { status } if status == "listening" => break,
            _ => {}
        }
    }
}

/// The full session narrative: manual jump puts the presenter on slide 3,
/// a semantic jump lands on 5, a keyword NEXT moves to 6, and a stuttered
/// double NEXT inside the cooldown advances exactly once to 7.
#[test]
fn full_session_scenario() {
    let port = spawn_server(Settings::default(), Arc::new(ScriptedClassifier));
    let mut socket = connect(port, "guest_token=g-1&language=en");

    socket
        .send(Message::Text(
            r#"{"type":"control","action":"set_slide","slide":3}"#.into(),
        ))
        .unwrap();
    wait_for(&mut socket, |m| {
        matches!(m, ServerMessage::SlideChange { slide: 3, .. })
    });

    socket
        .send(Message::Binary(audio("could we see the fifth slide").into()))
        .unwrap();
    wait_for(&mut socket, |m| {
        matches!(
            m,
            ServerMessage::SlideChange {
                slide: 5,
                match_type: MatchType::Semantic,
                ..
            }
        )
    });

    std::thread::sleep(Duration::from_millis(2100));
    socket
        .send(Message::Binary(audio("next slide").into()))
        .unwrap();
    wait_for(&mut socket, |m| {
        matches!(m, ServerMessage::SlideChange { slide: 6, .. })
    });

    std::thread::sleep(Duration::from_millis(2100));
    socket
        .send(Message::Binary(audio("next slide").into()))
        .unwrap();
    socket
        .send(Message::Binary(audio("next slide").into()))
        .unwrap();
    wait_for(&mut socket, |m| {
        matches!(m, ServerMessage::SlideChange { slide: 7, .. })
    });
    // The trailing duplicate is absorbed; the chunk still produces its
    // transcript and listening status, but no change to 8.
    let mut saw_transcript = false;
    loop {
        match next_message(&mut socket) {
            ServerMessage::Transcript { .. } => saw_transcript = true,
            ServerMessage::SlideChange { slide, .. } => {
                panic!("duplicate NEXT advanced to {slide}")
            }
            ServerMessage::Status { status } if status == "listening" && saw_transcript => break,
            _ => {}
        }
    }
}

fn client_config(port: u16) -> ClientConfig {
    ClientConfig {
        url: format!("ws://127.0.0.1:{port}/ws/presentation/1?guest_token=c-1&language=en"),
        capture_window: Duration::from_millis(3000),
        capture_min_chunk_bytes: 1000,
        heartbeat_interval: Duration::from_secs(30),
        backoff: BackoffPolicy::default(),
    }
}

/// Drive the full client state machine against the loopback server. Capture
/// may or may not open depending on the host; either way the session runs.
#[test]
fn live_client_connects_navigates_and_closes() {
    let port = spawn_server(Settings::default(), Arc::new(NullClassifier));
    let client = Arc::new(LiveClient::new(client_config(port)));
    let close = client.close_handle();
    let (command_tx, command_rx) = std::sync::mpsc::channel();
    let (event_tx, event_rx) = std::sync::mpsc::channel();

    let runner = {
        let client = Arc::clone(&client);
        std::thread::spawn(move || client.run(command_rx, event_tx))
    };

    let deadline = Duration::from_secs(5);
    loop {
        match event_rx.recv_timeout(deadline).unwrap() {
            ClientEvent::Connected(snapshot) => {
                assert_eq!(snapshot.presentation_id, 1);
                assert_eq!(snapshot.total_slides, 10);
                break;
            }
            ClientEvent::CaptureFailed(_) | ClientEvent::Status(_) => {}
            other => panic!("unexpected event before connect: {other:?}"),
        }
    }

    command_tx.send(ClientCommand::SetSlide(4)).unwrap();
    loop {
        match event_rx.recv_timeout(deadline).unwrap() {
            ClientEvent::SlideChanged { slide, .. } => {
                assert_eq!(slide, 4);
                break;
            }
            ClientEvent::Status(_) | ClientEvent::Transcript { .. } => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    close.close();
    loop {
        match event_rx.recv_timeout(deadline).unwrap() {
            ClientEvent::Closed => break,
            _ => {}
        }
    }
    runner.join().unwrap().unwrap();
}

/// With nothing listening, the client retries on the backoff schedule and
/// then surfaces an explicit terminal state.
#[test]
fn live_client_gives_up_after_the_retry_budget() {
    // Bind and drop to get a port that refuses connections.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut config = client_config(port);
    config.backoff = BackoffPolicy {
        base: Duration::from_millis(10),
        cap: Duration::from_millis(40),
        max_attempts: 3,
    };
    let client = LiveClient::new(config);
    let (_command_tx, command_rx) = std::sync::mpsc::channel();
    let (event_tx, event_rx) = std::sync::mpsc::channel();

    assert!(client.run(command_rx, event_tx).is_err());

    let mut attempts = 0;
    let mut gave_up = false;
    while let Ok(event) = event_rx.try_recv() {
        match event {
            ClientEvent::Reconnecting { attempt, .. } => {
                attempts = attempt;
            }
            ClientEvent::GaveUp => gave_up = true,
            _ => {}
        }
    }
    assert_eq!(attempts, 3);
    assert!(gave_up);
}

/// A fault close (bad credentials, 4001) ends the client without retries
/// and leaves it in an explicit error state for the UI to show.
#[test]
fn live_client_stops_on_auth_rejection() {
    let port = spawn_server(Settings::default(), Arc::new(NullClassifier));
    let mut settings = Settings::default();
    settings.backoff_base = Duration::from_millis(10);
    settings.backoff_cap = Duration::from_millis(40);
    let url = format!("ws://127.0.0.1:{port}/ws/presentation/1?language=en");
    let client = Arc::new(LiveClient::new(ClientConfig::from_settings(&settings, url)));
    let (_command_tx, command_rx) = std::sync::mpsc::channel();
    let (event_tx, event_rx) = std::sync::mpsc::channel();

    let runner = {
        let client = Arc::clone(&client);
        std::thread::spawn(move || client.run(command_rx, event_tx))
    };
    runner.join().unwrap().unwrap();
    assert_eq!(client.connection_state(), ConnectionState::Error);

    let mut closed = false;
    let mut retried = false;
    while let Ok(event) = event_rx.try_recv() {
        match event {
            ClientEvent::Closed => closed = true,
            ClientEvent::Reconnecting { .. } => retried = true,
            _ => {}
        }
    }
    assert!(closed);
    assert!(!retried);
}

#[test]
fn end_session_closes_normally() {
    let port = spawn_server(Settings::default(), Arc::new(NullClassifier));
    let mut socket = connect(port, "guest_token=g-1&language=en");
    wait_for(&mut socket, |m| {
        matches!(m, ServerMessage::Status { status } if status == "listening")
    });

    socket
        .send(Message::Text(
            r#"{"type":"control","action":"end_session"}"#.into(),
        ))
        .unwrap();
    loop {
        match socket.read() {
            Ok(Message::Close(Some(frame))) => {
                assert_eq!(u16::from(frame.code), 1000);
                break;
            }
            Ok(_) => {}
            Err(e) => panic!("expected close frame, got {e}"),
        }
    }
}
