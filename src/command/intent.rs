//! Semantic intent classification fallback.
//!
//! Invoked only when the phrase matcher abstains. One call costs latency and
//! money, so the session loop keeps at most one classification in flight and
//! queues later transcripts behind it (the loop is strictly sequential).
//! Timeouts and provider errors fail open to "no command", never to a stale
//! command.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use super::{Command, CommandKind};

/// External collaborator contract. Given the transcript and the slide
/// context, return a structured command or nothing.
pub trait IntentClassifier: Send + Sync {
    fn classify(&self, transcript: &str, current_slide: u32, total_slides: u32)
        -> Option<Command>;
}

/// Classifier used when no provider is configured. Always abstains.
pub struct NullClassifier;

impl IntentClassifier for NullClassifier {
    fn classify(&self, _transcript: &str, _current: u32, _total: u32) -> Option<Command> {
        None
    }
}

/// OpenAI-compatible chat-completion classifier.
pub struct ChatIntentClassifier {
    agent: ureq::Agent,
    endpoint: String,
    api_key: String,
    model: String,
}

impl ChatIntentClassifier {
    pub fn new(endpoint: &str, api_key: &str, model: &str, timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        ChatIntentClassifier {
            agent: config.into(),
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    fn system_prompt(current_slide: u32, total_slides: u32) -> String {
        format!(
            "You are a presentation assistant. Analyze the speaker's transcript and \
             identify whether they want to navigate the presentation.\n\
             Current slide: {current}\nTotal slides: {total}\n\
             Respond with JSON only, with fields:\n\
             - intent: one of [NEXT_SLIDE, PREVIOUS_SLIDE, FIRST_SLIDE, LAST_SLIDE, \
             JUMP_TO_SLIDE, GENERAL_QUERY, UNKNOWN]\n\
             - confidence: a float between 0 and 1\n\
             - slide_number: the target slide number for JUMP_TO_SLIDE, otherwise null\n\
             Guidelines:\n\
             - NEXT_SLIDE: \"next slide\", \"let's move on\", \"forward\".\n\
             - PREVIOUS_SLIDE: \"go back\", \"let's look at that again\", \
             \"return to the last part\".\n\
             - JUMP_TO_SLIDE: \"go to slide 5\", \"jump to page 10\".\n\
             - GENERAL_QUERY: a question about the content.\n\
             - UNKNOWN: general speech with no navigation intent.",
            current = current_slide,
            total = total_slides,
        )
    }

    fn parse_result(content: &str) -> Option<(CommandKind, Option<u32>, f32)> {
        let data: Value = serde_json::from_str(content).ok()?;
        let intent = data.get("intent")?.as_str()?;
        let confidence = data
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.0) as f32;
        let slide_number = data
            .get("slide_number")
            .and_then(Value::as_u64)
            .map(|n| n as u32);

        let kind = match intent {
            "NEXT_SLIDE" => CommandKind::Next,
            "PREVIOUS_SLIDE" => CommandKind::Previous,
            "FIRST_SLIDE" => CommandKind::First,
            "LAST_SLIDE" => CommandKind::Last,
            "JUMP_TO_SLIDE" => CommandKind::Jump,
            // GENERAL_QUERY, UNKNOWN, or anything unexpected.
            _ => return None,
        };
        Some((kind, slide_number, confidence))
    }
}

impl IntentClassifier for ChatIntentClassifier {
    fn classify(&self, transcript: &str, current_slide: u32, total_slides: u32)
        -> Option<Command> {
        if transcript.trim().is_empty() {
            return None;
        }

        let payload = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": Self::system_prompt(current_slide, total_slides) },
                { "role": "user", "content": format!("Transcript: {}", transcript) }
            ],
            "response_format": { "type": "json_object" },
            "temperature": 0,
            "max_tokens": 60
        });

        let resp = self
            .agent
            .post(&self.endpoint)
            .header("Authorization", &format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .send_json(payload);

        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                // Timeouts and provider errors both land here: no command.
                warn!("intent classification failed: {e}");
                return None;
            }
        };

        let body: Value = match resp.into_body().read_json() {
            Ok(v) => v,
            Err(e) => {
                warn!("intent response unreadable: {e}");
                return None;
            }
        };

        let content = body
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)?;

        debug!("intent raw response: {content}");

        let (kind, slide_number, confidence) = Self::parse_result(content)?;
        let target = if kind == CommandKind::Jump {
            slide_number
        } else {
            None
        };
        // A jump without an extractable target is unusable.
        if kind == CommandKind::Jump && target.is_none() {
            return None;
        }
        Some(Command::semantic(kind, target, confidence))
    }
}
