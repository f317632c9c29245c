//! Wire protocol for the live presentation WebSocket.
//!
//! Binary frames carry raw encoded audio, one chunk per frame, no envelope;
//! sequencing is implicit in arrival order over the single connection. Text
//! frames are JSON with a `type` discriminator. Unknown types are logged and
//! ignored, never fatal.

use serde::{Deserialize, Serialize};

/// Normal / intentional close.
pub const CLOSE_NORMAL: u16 = 1000;
/// Authentication failed. Terminal, the client must not retry.
pub const CLOSE_AUTH_FAILED: u16 = 4001;
/// Presentation not found or inaccessible. Terminal, no retry.
pub const CLOSE_NOT_FOUND: u16 = 4004;

/// Whether a close code ends the session for good. Anything else is treated
/// as an abnormal close and handed to the reconnection controller.
pub fn is_terminal_close(code: u16) -> bool {
    matches!(code, CLOSE_NORMAL | CLOSE_AUTH_FAILED | CLOSE_NOT_FOUND)
}

/// How a slide transition was triggered, reported in `slide_change` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Keyword,
    Semantic,
    Manual,
}

/// Session mode requested at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Live,
    Rehearsal,
}

impl SessionMode {
    pub fn parse(s: &str) -> SessionMode {
        match s {
            "rehearsal" => SessionMode::Rehearsal,
            _ => SessionMode::Live,
        }
    }
}

/// Server → client text messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once on every (re)connect, before any audio is accepted, so a
    /// reconnecting client can resynchronize its UI state immediately.
    SessionInfo {
        session_id: String,
        presentation_id: u64,
        total_slides: u32,
        current_slide: u32,
        mode: SessionMode,
        language: String,
    },
    /// Live transcript segment, interim or final, for subtitle display.
    Transcript {
        text: String,
        chunk_index: u64,
        duration_ms: f64,
        is_empty: bool,
    },
    /// Authoritative slide navigation command.
    SlideChange {
        slide: u32,
        match_type: MatchType,
        confidence: f32,
        #[serde(skip_serializing_if = "Option::is_none")]
        matched_keywords: Option<Vec<String>>,
    },
    /// Free-form backend state string: connected, listening, processing, ...
    Status { status: String },
    Error { message: String },
    Ping,
    Pong,
}

/// Client → server text messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Control {
        action: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        slide: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content_type: Option<String>,
    },
    Ping,
    Pong,
    /// Anything with an unrecognized `type` value.
    #[serde(other)]
    Unknown,
}
