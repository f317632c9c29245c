//! Navigation commands extracted from speech.
//!
//! A [`Command`] is a transient value: it exists only between classification
//! and application to the slide state machine, and is never persisted.

pub mod intent;
pub mod phrase;

pub use intent::{ChatIntentClassifier, IntentClassifier, NullClassifier};
pub use phrase::{locales_for_language, match_phrase, Locale};

use crate::protocol::MatchType;

/// What the presenter asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Next,
    Previous,
    First,
    Last,
    /// Absolute navigation; carries the target in [`Command::target_slide`].
    Jump,
}

/// Which layer produced the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSource {
    /// Deterministic phrase table hit.
    Keyword,
    /// Intent classifier fallback.
    Semantic,
}

impl CommandSource {
    pub fn match_type(self) -> MatchType {
        match self {
            CommandSource::Keyword => MatchType::Keyword,
            CommandSource::Semantic => MatchType::Semantic,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub kind: CommandKind,
    /// Present only for [`CommandKind::Jump`].
    pub target_slide: Option<u32>,
    pub confidence: f32,
    pub source: CommandSource,
    /// The literal phrase that triggered a keyword match, for the
    /// `matched_keywords` field of `slide_change` events.
    pub matched_phrase: Option<String>,
}

impl Command {
    pub fn keyword(kind: CommandKind, phrase: &str) -> Command {
        Command {
            kind,
            target_slide: None,
            confidence: 1.0,
            source: CommandSource::Keyword,
            matched_phrase: Some(phrase.to_string()),
        }
    }

    pub fn semantic(kind: CommandKind, target_slide: Option<u32>, confidence: f32) -> Command {
        Command {
            kind,
            target_slide,
            confidence,
            source: CommandSource::Semantic,
            matched_phrase: None,
        }
    }
}
