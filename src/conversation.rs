//! Per-call conversation state.
//!
//! Owned exclusively by one orchestrator (or IVR flow) instance; there are
//! no concurrent writers, so no interior locking is needed here.

use crate::call::{Speaker, Utterance};

/// Mutable record of one conversation: transcript, completed-turn counter,
/// extracted facts, and the one-way dispatch latch.
#[derive(Debug, Default)]
pub struct ConversationState {
    turns: Vec<Utterance>,
    turn_count: u32,
    location: Option<String>,
    incident_category: Option<String>,
    dispatch_triggered: bool,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finalized caller utterance.
    pub fn record_caller(&mut self, text: impl Into<String>) {
        self.turns.push(Utterance::new(Speaker::Caller, text));
    }

    /// Record a finalized agent utterance.
    pub fn record_agent(&mut self, text: impl Into<String>) {
        self.turns.push(Utterance::new(Speaker::Agent, text));
    }

    /// Count one completed caller/agent exchange. Returns the new count.
    pub fn complete_turn(&mut self) -> u32 {
        self.turn_count += 1;
        self.turn_count
    }

    pub fn turn_count(&self) -> u32 {
        self.turn_count
    }

    /// Capture the utterance that named a location. First capture wins.
    pub fn note_location(&mut self, text: &str) {
        if self.location.is_none() {
            self.location = Some(text.to_owned());
        }
    }

    /// Fix the incident category. First capture wins.
    pub fn note_incident(&mut self, category: &str) {
        if self.incident_category.is_none() {
            self.incident_category = Some(category.to_owned());
        }
    }

    pub fn has_location(&self) -> bool {
        self.location.is_some()
    }

    pub fn has_incident_category(&self) -> bool {
        self.incident_category.is_some()
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    pub fn incident_category(&self) -> Option<&str> {
        self.incident_category.as_deref()
    }

    /// Flip the dispatch latch. One-way: never reset for the call.
    pub fn latch_dispatch(&mut self) {
        self.dispatch_triggered = true;
    }

    pub fn dispatch_triggered(&self) -> bool {
        self.dispatch_triggered
    }

    pub fn turns(&self) -> &[Utterance] {
        &self.turns
    }

    /// Most recent caller utterance, if any.
    pub fn last_caller_utterance(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|u| u.speaker == Speaker::Caller)
            .map(|u| u.text.as_str())
    }
}
