//! WebSocket server wiring.
//!
//! One OS thread per connection. Sessions are handed out by the
//! [`SessionManager`]; per-session state never crosses threads, only the
//! manager's lookup table is shared.

pub mod handler;

use std::net::TcpListener;
use std::sync::Arc;
use std::thread;

use anyhow::Result;
use tracing::{error, info};
use url::Url;

use crate::command::intent::IntentClassifier;
use crate::presentations::{Authenticator, PresentationStore};
use crate::session::SessionManager;
use crate::settings::Settings;
use crate::stt::SpeechToText;

pub struct ServerContext {
    pub settings: Settings,
    pub stt: Arc<dyn SpeechToText>,
    pub classifier: Arc<dyn IntentClassifier>,
    pub auth: Arc<dyn Authenticator>,
    pub presentations: Arc<dyn PresentationStore>,
    pub sessions: SessionManager,
}

/// What the client asked for in the handshake URI:
/// `/ws/presentation/{id}?token=..|guest_token=..&mode=..&language=..`
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    pub presentation_id: u64,
    pub token: Option<String>,
    pub guest_token: Option<String>,
    pub mode: String,
    pub language: String,
}

impl ConnectRequest {
    pub fn parse(uri: &str) -> Option<ConnectRequest> {
        // The handshake carries only the path; borrow a dummy base to
        // get url's query parsing.
        let url = Url::parse(&format!("ws://localhost{uri}")).ok()?;
        let mut segments = url.path_segments()?;
        if segments.next()? != "ws" || segments.next()? != "presentation" {
            return None;
        }
        let presentation_id = segments.next()?.parse::<u64>().ok()?;

        let mut token = None;
        let mut guest_token = None;
        let mut mode = "live".to_string();
        let mut language = "auto".to_string();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "token" => token = Some(value.into_owned()),
                "guest_token" => guest_token = Some(value.into_owned()),
                "mode" => mode = value.into_owned(),
                "language" => language = value.into_owned(),
                _ => {}
            }
        }
        Some(ConnectRequest {
            presentation_id,
            token,
            guest_token,
            mode,
            language,
        })
    }
}

/// Accept loop. Blocks until the listener fails.
pub fn run_server(listener: TcpListener, context: Arc<ServerContext>) -> Result<()> {
    info!("listening on {}", listener.local_addr()?);
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                error!("accept failed: {e}");
                continue;
            }
        };
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let context = Arc::clone(&context);
        thread::spawn(move || {
            if let Err(e) = handler::handle_connection(stream, context) {
                info!("connection from {peer} ended: {e}");
            }
        });
    }
    Ok(())
}
