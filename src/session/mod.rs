//! Live session records and lifecycle.

pub mod machine;
pub mod manager;

pub use machine::{ApplyOutcome, SessionPhase, SlideStateMachine};
pub use manager::{SessionHandle, SessionManager};

use chrono::{DateTime, Utc};

use crate::presentations::Identity;
use crate::protocol::SessionMode;

/// Everything the server tracks about one viewer on one presentation.
/// Survives reconnects; a new connection for the same viewer/presentation
/// resumes this record instead of creating a fresh one.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub presentation_id: u64,
    pub identity: Identity,
    pub mode: SessionMode,
    pub language: String,
    pub total_slides: u32,
    pub started_at: DateTime<Utc>,
    /// MIME type of the audio the client is sending.
    pub audio_content_type: String,
}

impl Session {
    pub fn resume_key(&self) -> (u64, String) {
        (self.presentation_id, self.identity.key().to_string())
    }
}
