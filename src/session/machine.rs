//! Slide state machine.
//!
//! Owns the current slide index for one session. Commands are only applied
//! while the session is active, and an accepted command starts a cooldown
//! window during which further commands are suppressed. That absorbs the
//! trailing fragments of one utterance getting re-classified as a second
//! command half a second later.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::command::{Command, CommandKind};
use crate::protocol::MatchType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Active,
    Paused,
    Ended,
}

/// What happened to a command handed to [`SlideStateMachine::apply_at`].
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Index moved; the client should be told.
    Accepted {
        slide: u32,
        match_type: MatchType,
        confidence: f32,
        matched_keywords: Option<Vec<String>>,
    },
    /// NEXT at the last slide or PREVIOUS at the first. Logged, no event.
    AtBoundary,
    /// JUMP target outside `1..=total_slides`. Logged, no event.
    OutOfBounds { target: u32 },
    /// Inside the cooldown window of the last accepted command.
    CoolingDown,
    /// Session is idle, paused, or ended.
    NotActive,
}

pub struct SlideStateMachine {
    phase: SessionPhase,
    current_slide: u32,
    total_slides: u32,
    cooldown: Duration,
    last_accepted: Option<Instant>,
}

impl SlideStateMachine {
    pub fn new(total_slides: u32, starting_slide: u32, cooldown: Duration) -> Self {
        SlideStateMachine {
            phase: SessionPhase::Idle,
            current_slide: starting_slide.clamp(1, total_slides.max(1)),
            total_slides,
            cooldown,
            last_accepted: None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn current_slide(&self) -> u32 {
        self.current_slide
    }

    pub fn start(&mut self) {
        if self.phase == SessionPhase::Idle {
            self.phase = SessionPhase::Active;
        }
    }

    pub fn pause(&mut self) {
        if self.phase == SessionPhase::Active {
            self.phase = SessionPhase::Paused;
        }
    }

    pub fn resume(&mut self) {
        if self.phase == SessionPhase::Paused {
            self.phase = SessionPhase::Active;
        }
    }

    /// Terminal; no transition leaves `Ended`.
    pub fn end(&mut self) {
        self.phase = SessionPhase::Ended;
    }

    /// Manual slide selection from the client UI. Bypasses the cooldown but
    /// still respects bounds and the terminal state.
    pub fn force_set(&mut self, target: u32) -> ApplyOutcome {
        if self.phase == SessionPhase::Ended {
            return ApplyOutcome::NotActive;
        }
        if target < 1 || target > self.total_slides {
            return ApplyOutcome::OutOfBounds { target };
        }
        self.current_slide = target;
        ApplyOutcome::Accepted {
            slide: target,
            match_type: MatchType::Manual,
            confidence: 1.0,
            matched_keywords: None,
        }
    }

    pub fn apply(&mut self, command: &Command) -> ApplyOutcome {
        self.apply_at(command, Instant::now())
    }

    /// Apply a voice command at a given instant. Taking the instant as a
    /// parameter keeps the cooldown testable without sleeping.
    pub fn apply_at(&mut self, command: &Command, now: Instant) -> ApplyOutcome {
        if self.phase != SessionPhase::Active {
            debug!(
                "ignoring {:?} while {:?} on slide {}",
                command.kind, self.phase, self.current_slide
            );
            return ApplyOutcome::NotActive;
        }
        if let Some(last) = self.last_accepted {
            if now.duration_since(last) < self.cooldown {
                debug!("suppressing {:?} inside cooldown window", command.kind);
                return ApplyOutcome::CoolingDown;
            }
        }

        let target = match command.kind {
            CommandKind::Next => {
                if self.current_slide >= self.total_slides {
                    info!("already at last slide {}", self.total_slides);
                    return ApplyOutcome::AtBoundary;
                }
                self.current_slide + 1
            }
            CommandKind::Previous => {
                if self.current_slide <= 1 {
                    info!("already at first slide");
                    return ApplyOutcome::AtBoundary;
                }
                self.current_slide - 1
            }
            CommandKind::First => 1,
            CommandKind::Last => self.total_slides,
            CommandKind::Jump => {
                let Some(target) = command.target_slide else {
                    return ApplyOutcome::OutOfBounds { target: 0 };
                };
                if target < 1 || target > self.total_slides {
                    info!(
                        "rejecting jump to {} (deck has {} slides)",
                        target, self.total_slides
                    );
                    return ApplyOutcome::OutOfBounds { target };
                }
                target
            }
        };

        self.current_slide = target;
        self.last_accepted = Some(now);
        ApplyOutcome::Accepted {
            slide: target,
            match_type: command.source.match_type(),
            confidence: command.confidence,
            matched_keywords: command.matched_phrase.clone().map(|p| vec![p]),
        }
    }
}
