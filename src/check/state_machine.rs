//! Finite state machine for the lifecycle of a single environment check.
//!
//! A check handle moves `Idle -> Started -> Completed` and never goes back.
//! Any other (phase, event) pair is rejected, which is how a handle is kept
//! single-use.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle phase of a check handle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckPhase {
    /// Not yet begun
    #[default]
    Idle,
    /// Before-snapshot captured, test running
    Started,
    /// Ended; the handle cannot be used again
    Completed,
}

impl fmt::Display for CheckPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckPhase::Idle => write!(f, "Idle"),
            CheckPhase::Started => write!(f, "Started"),
            CheckPhase::Completed => write!(f, "Completed"),
        }
    }
}

/// Events that drive a check through its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckEvent {
    /// Capture the before-snapshot
    Begin,
    /// Capture the after-snapshot and compare
    End,
}

impl fmt::Display for CheckEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckEvent::Begin => write!(f, "Begin"),
            CheckEvent::End => write!(f, "End"),
        }
    }
}

/// A state transition definition
#[derive(Debug)]
pub struct Transition {
    /// Source phase
    pub from: CheckPhase,
    /// Target phase
    pub to: CheckPhase,
    /// Triggering event
    pub event: CheckEvent,
    /// Human-readable description
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: CheckPhase,
        to: CheckPhase,
        event: CheckEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a transition
#[derive(Debug, PartialEq, Eq)]
pub enum TransitionResult {
    /// The transition is allowed
    Success {
        from: CheckPhase,
        to: CheckPhase,
        event: CheckEvent,
        description: &'static str,
    },
    /// No transition exists for this pair
    InvalidTransition {
        current: CheckPhase,
        event: CheckEvent,
    },
}

static TRANSITIONS: [Transition; 2] = [
    Transition::new(
        CheckPhase::Idle,
        CheckPhase::Started,
        CheckEvent::Begin,
        "Before-snapshot captured",
    ),
    Transition::new(
        CheckPhase::Started,
        CheckPhase::Completed,
        CheckEvent::End,
        "Check ended",
    ),
];

/// Transition table for check handles
#[derive(Debug, Default, Clone, Copy)]
pub struct CheckStateMachine;

impl CheckStateMachine {
    /// Create the state machine
    pub fn new() -> Self {
        Self
    }

    /// Look up the transition for `event` from `current`.
    pub fn transition(&self, current: CheckPhase, event: CheckEvent) -> TransitionResult {
        match TRANSITIONS
            .iter()
            .find(|t| t.from == current && t.event == event)
        {
            Some(t) => TransitionResult::Success {
                from: t.from,
                to: t.to,
                event,
                description: t.description,
            },
            None => TransitionResult::InvalidTransition { current, event },
        }
    }

    /// Check if a transition is valid
    pub fn can_transition(&self, from: CheckPhase, event: CheckEvent) -> bool {
        TRANSITIONS.iter().any(|t| t.from == from && t.event == event)
    }

    /// Get all valid events for a given phase
    pub fn valid_events(&self, phase: CheckPhase) -> Vec<CheckEvent> {
        TRANSITIONS
            .iter()
            .filter(|t| t.from == phase)
            .map(|t| t.event)
            .collect()
    }
}
