//! Deterministic phrase matching on transcript fragments.
//!
//! This is the fastest detection layer: plain substring containment over
//! per-locale trigger tables, checked before the intent classifier is ever
//! consulted. Matching order over command kinds is fixed so results are
//! reproducible.

use lazy_static::lazy_static;

use super::{Command, CommandKind};

/// Locales with shipped trigger tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locale {
    Turkish,
    English,
}

/// Transcripts longer than this are conversational speech, not commands, and
/// must not accidentally match a contained phrase.
pub const MAX_COMMAND_CHARS: usize = 100;

/// Fixed iteration order: Next, Previous, First, Last.
const KIND_ORDER: [CommandKind; 4] = [
    CommandKind::Next,
    CommandKind::Previous,
    CommandKind::First,
    CommandKind::Last,
];

lazy_static! {
    static ref TURKISH: Vec<(CommandKind, Vec<&'static str>)> = vec![
        (
            CommandKind::Next,
            vec![
                "sonraki slayt",
                "sonraki sayfa",
                "ileri",
                "sonrakine geç",
                "devam et",
                "devam",
                "bir sonraki",
                "ilerle",
                "geç",
            ],
        ),
        (
            CommandKind::Previous,
            vec![
                "önceki slayt",
                "önceki sayfa",
                "geri",
                "bir önceki",
                "geri dön",
                "geri git",
            ],
        ),
        (
            CommandKind::First,
            vec!["ilk slayt", "başa dön", "en başa"],
        ),
        (
            CommandKind::Last,
            vec!["son slayt", "sona git", "en sona"],
        ),
    ];
    static ref ENGLISH: Vec<(CommandKind, Vec<&'static str>)> = vec![
        (
            CommandKind::Next,
            vec![
                "next slide",
                "next page",
                "go forward",
                "move on",
                "continue",
                "next one",
                "advance",
            ],
        ),
        (
            CommandKind::Previous,
            vec![
                "previous slide",
                "previous page",
                "go back",
                "go backward",
                "back one",
            ],
        ),
        (
            CommandKind::First,
            vec!["first slide", "go to start", "beginning"],
        ),
        (CommandKind::Last, vec!["last slide", "go to end"]),
    ];
}

fn table_for(locale: Locale) -> &'static [(CommandKind, Vec<&'static str>)] {
    match locale {
        Locale::Turkish => &TURKISH,
        Locale::English => &ENGLISH,
    }
}

/// Map a session language tag to the locales to try. `auto` and anything
/// unrecognized get both shipped tables.
pub fn locales_for_language(language: &str) -> Vec<Locale> {
    let lang = language.to_lowercase();
    if lang.starts_with("tr") {
        vec![Locale::Turkish]
    } else if lang.starts_with("en") {
        vec![Locale::English]
    } else {
        vec![Locale::Turkish, Locale::English]
    }
}

/// Pure, synchronous, stateless phrase lookup.
///
/// Lower-cases and trims the input, rejects long transcripts outright, then
/// checks each command kind in fixed order across the requested locales.
/// First matching kind wins. Returns `None` when nothing matches, deferring
/// to the intent classifier.
pub fn match_phrase(text: &str, locales: &[Locale]) -> Option<Command> {
    let text = text.trim().to_lowercase();
    if text.is_empty() || text.chars().count() > MAX_COMMAND_CHARS {
        return None;
    }

    for kind in KIND_ORDER {
        for locale in locales {
            let table = table_for(*locale);
            let phrases = table
                .iter()
                .find(|(k, _)| *k == kind)
                .map(|(_, p)| p.as_slice())
                .unwrap_or(&[]);
            for phrase in phrases {
                if text.contains(phrase) {
                    return Some(Command::keyword(kind, phrase));
                }
            }
        }
    }

    None
}
