//! Session manager.
//!
//! One lookup table for all live sessions, keyed by (presentation, viewer).
//! Connections come and go; the session record persists so a reconnecting
//! client lands back on the slide it left. If a second connection arrives
//! for a key that already has a live one, the newer connection wins and the
//! older one is flagged for shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::presentations::{Identity, Presentation, PresentationStore};
use crate::protocol::SessionMode;
use crate::session::Session;

struct ManagedSession {
    session: Session,
    last_slide: u32,
    /// Set when a newer connection takes over this session. The owning
    /// connection thread polls it and closes itself.
    supersede: Arc<AtomicBool>,
}

/// Handed to a connection thread; ties it to its session record.
pub struct SessionHandle {
    pub session: Session,
    /// Slide the session starts (or resumes) on.
    pub starting_slide: u32,
    /// True when this connection resumed an existing session record.
    pub resumed: bool,
    superseded: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn is_superseded(&self) -> bool {
        self.superseded.load(Ordering::Relaxed)
    }
}

pub struct SessionManager {
    store: Arc<dyn PresentationStore>,
    sessions: Mutex<HashMap<(u64, String), ManagedSession>>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn PresentationStore>) -> Self {
        SessionManager {
            store,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Open (or resume) the session for this viewer on this presentation.
    /// Any previous connection holding the same session is told to go away.
    pub fn create_or_resume(
        &self,
        presentation: &Presentation,
        identity: Identity,
        mode: SessionMode,
        language: &str,
    ) -> SessionHandle {
        let key = (presentation.id, identity.key().to_string());
        let mut sessions = self.sessions.lock().unwrap();

        if let Some(existing) = sessions.get_mut(&key) {
            existing.supersede.store(true, Ordering::Relaxed);
            let supersede = Arc::new(AtomicBool::new(false));
            existing.supersede = Arc::clone(&supersede);
            existing.session.mode = mode;
            existing.session.language = language.to_string();
            info!(
                "resuming session {} on slide {}",
                existing.session.id, existing.last_slide
            );
            return SessionHandle {
                session: existing.session.clone(),
                starting_slide: existing.last_slide,
                resumed: true,
                superseded: supersede,
            };
        }

        let starting_slide = self
            .store
            .load_position(presentation.id, &identity)
            .unwrap_or(1)
            .clamp(1, presentation.total_slides.max(1));
        let session = Session {
            id: Uuid::new_v4().to_string(),
            presentation_id: presentation.id,
            identity,
            mode,
            language: language.to_string(),
            total_slides: presentation.total_slides,
            started_at: Utc::now(),
            audio_content_type: "audio/webm".to_string(),
        };
        info!(
            "new session {} for presentation {} starting on slide {}",
            session.id, presentation.id, starting_slide
        );
        let supersede = Arc::new(AtomicBool::new(false));
        sessions.insert(
            key,
            ManagedSession {
                session: session.clone(),
                last_slide: starting_slide,
                supersede: Arc::clone(&supersede),
            },
        );
        SessionHandle {
            session,
            starting_slide,
            resumed: false,
            superseded: supersede,
        }
    }

    /// Record where the viewer is, both in the live table and in the store.
    /// A superseded handle's slide is stale relative to its successor, so
    /// its saves are dropped.
    pub fn save_position(&self, handle: &SessionHandle, slide: u32) {
        if handle.is_superseded() {
            return;
        }
        let session = &handle.session;
        let key = session.resume_key();
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(managed) = sessions.get_mut(&key) {
            managed.last_slide = slide;
        }
        drop(sessions);
        self.store
            .save_position(session.presentation_id, &session.identity, slide);
    }

    /// Remove the session record. Idempotent; a superseded connection
    /// ending late must not tear down the record its successor is using.
    pub fn end_session(&self, handle: &SessionHandle) {
        if handle.is_superseded() {
            return;
        }
        let mut sessions = self.sessions.lock().unwrap();
        if sessions
            .get(&handle.session.resume_key())
            .is_some_and(|m| m.session.id == handle.session.id)
        {
            info!("session {} ended", handle.session.id);
            sessions.remove(&handle.session.resume_key());
        }
    }

    pub fn active_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}
