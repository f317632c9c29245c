//! Presentation metadata and access control.
//!
//! The live server needs two things from the wider platform: "does this
//! presentation exist and how many slides does it have", and "is this caller
//! allowed in". Both sit behind traits so tests and standalone deployments
//! can run without the platform backend.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use crate::error::LiveError;

#[derive(Debug, Clone, PartialEq)]
pub struct Presentation {
    pub id: u64,
    pub total_slides: u32,
    /// Opaque pointer to the stored deck, if the backend exposes one.
    pub file_ref: Option<String>,
}

/// Who is on the other end of the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Identity {
    /// Registered user, keyed by the subject the auth backend returned.
    User(String),
    /// Guest identified only by their self-supplied token.
    Guest(String),
}

impl Identity {
    pub fn key(&self) -> &str {
        match self {
            Identity::User(id) => id,
            Identity::Guest(token) => token,
        }
    }
}

pub trait Authenticator: Send + Sync {
    /// Resolve credentials to an identity. Exactly one of `token` /
    /// `guest_token` is expected; guests win if both are present.
    fn authenticate(
        &self,
        token: Option<&str>,
        guest_token: Option<&str>,
    ) -> Result<Identity, LiveError>;
}

pub trait PresentationStore: Send + Sync {
    fn fetch(&self, id: u64) -> Result<Presentation, LiveError>;
    /// Persist the viewer's position so a later session can resume there.
    fn save_position(&self, id: u64, identity: &Identity, slide: u32);
    /// Last saved position for this viewer, if any.
    fn load_position(&self, id: u64, identity: &Identity) -> Option<u32>;
}

/// Accepts any non-empty guest token; registered tokens are delegated to the
/// auth backend when one is configured, otherwise rejected.
pub struct TokenAuthenticator {
    agent: ureq::Agent,
    auth_api: Option<String>,
}

impl TokenAuthenticator {
    pub fn new(auth_api: Option<String>) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(5)))
            .build();
        TokenAuthenticator {
            agent: config.into(),
            auth_api,
        }
    }
}

impl Authenticator for TokenAuthenticator {
    fn authenticate(
        &self,
        token: Option<&str>,
        guest_token: Option<&str>,
    ) -> Result<Identity, LiveError> {
        if let Some(guest) = guest_token {
            if !guest.trim().is_empty() {
                return Ok(Identity::Guest(guest.to_string()));
            }
        }
        let token = token
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| LiveError::Auth("missing credentials".into()))?;

        let api = self
            .auth_api
            .as_deref()
            .ok_or_else(|| LiveError::Auth("registered login not configured".into()))?;

        let resp = self
            .agent
            .get(&format!("{}/verify", api.trim_end_matches('/')))
            .header("Authorization", &format!("Bearer {token}"))
            .call()
            .map_err(|e| LiveError::Auth(format!("token verification failed: {e}")))?;
        let body: Value = resp
            .into_body()
            .read_json()
            .map_err(|e| LiveError::Auth(format!("bad auth response: {e}")))?;
        let subject = body
            .get("user_id")
            .and_then(Value::as_str)
            .or_else(|| body.get("sub").and_then(Value::as_str))
            .ok_or_else(|| LiveError::Auth("auth response missing subject".into()))?;
        Ok(Identity::User(subject.to_string()))
    }
}

/// Seeded in-process store. Positions live only as long as the process.
pub struct InMemoryPresentationStore {
    presentations: HashMap<u64, Presentation>,
    positions: Mutex<HashMap<(u64, String), u32>>,
}

impl InMemoryPresentationStore {
    pub fn new(presentations: Vec<Presentation>) -> Self {
        InMemoryPresentationStore {
            presentations: presentations.into_iter().map(|p| (p.id, p)).collect(),
            positions: Mutex::new(HashMap::new()),
        }
    }

    /// Parse a `id:total_slides,id:total_slides` seed string.
    pub fn from_seed(seed: &str) -> Self {
        let mut presentations = Vec::new();
        for entry in seed.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let mut parts = entry.splitn(2, ':');
            let id = parts.next().and_then(|s| s.trim().parse::<u64>().ok());
            let total = parts.next().and_then(|s| s.trim().parse::<u32>().ok());
            match (id, total) {
                (Some(id), Some(total_slides)) if total_slides > 0 => {
                    presentations.push(Presentation {
                        id,
                        total_slides,
                        file_ref: None,
                    });
                }
                _ => warn!("ignoring malformed presentation seed entry '{entry}'"),
            }
        }
        Self::new(presentations)
    }
}

impl PresentationStore for InMemoryPresentationStore {
    fn fetch(&self, id: u64) -> Result<Presentation, LiveError> {
        self.presentations
            .get(&id)
            .cloned()
            .ok_or_else(|| LiveError::NotFound(format!("presentation {id} not found")))
    }

    fn save_position(&self, id: u64, identity: &Identity, slide: u32) {
        let mut positions = self.positions.lock().unwrap();
        positions.insert((id, identity.key().to_string()), slide);
    }

    fn load_position(&self, id: u64, identity: &Identity) -> Option<u32> {
        let positions = self.positions.lock().unwrap();
        positions.get(&(id, identity.key().to_string())).copied()
    }
}

/// Backend-hosted store. Position writes are best-effort; a failed save must
/// not interrupt a running session.
pub struct HttpPresentationStore {
    agent: ureq::Agent,
    base_url: String,
}

impl HttpPresentationStore {
    pub fn new(base_url: &str) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(10)))
            .build();
        HttpPresentationStore {
            agent: config.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl PresentationStore for HttpPresentationStore {
    fn fetch(&self, id: u64) -> Result<Presentation, LiveError> {
        let url = format!("{}/presentations/{}", self.base_url, id);
        let resp = self.agent.get(&url).call().map_err(|e| {
            if e.to_string().contains("404") {
                LiveError::NotFound(format!("presentation {id} not found"))
            } else {
                LiveError::Connection(format!("presentation lookup failed: {e}"))
            }
        })?;
        let body: Value = resp
            .into_body()
            .read_json()
            .map_err(|e| LiveError::Connection(format!("bad presentation response: {e}")))?;
        let total_slides = body
            .get("total_slides")
            .and_then(Value::as_u64)
            .ok_or_else(|| LiveError::NotFound(format!("presentation {id} has no slides")))?;
        Ok(Presentation {
            id,
            total_slides: total_slides as u32,
            file_ref: body
                .get("file_ref")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    fn save_position(&self, id: u64, identity: &Identity, slide: u32) {
        let url = format!("{}/presentations/{}/position", self.base_url, id);
        let payload = serde_json::json!({
            "viewer": identity.key(),
            "slide": slide,
        });
        if let Err(e) = self.agent.post(&url).send_json(payload) {
            warn!("failed to persist position for presentation {id}: {e}");
        }
    }

    fn load_position(&self, id: u64, identity: &Identity) -> Option<u32> {
        let url = format!(
            "{}/presentations/{}/position?viewer={}",
            self.base_url,
            id,
            identity.key()
        );
        let resp = self.agent.get(&url).call().ok()?;
        let body: Value = resp.into_body().read_json().ok()?;
        body.get("slide").and_then(Value::as_u64).map(|s| s as u32)
    }
}
