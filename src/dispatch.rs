//! Dispatch-readiness decisions.
//!
//! A deliberately conservative keyword heuristic, not a semantic
//! classifier: it trades the occasional premature dispatch for a hard
//! bound on conversation length. Kept as an explicit pure policy so it can
//! be replaced by a classifier without touching the orchestrator.

use crate::config::{DispatchConfig, IncidentTerm};
use crate::conversation::ConversationState;

/// Result of scanning one caller utterance for facts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactScan {
    /// The utterance appears to name a location.
    pub location: bool,
    /// Incident category fixed by the first matching term, if any.
    pub incident_category: Option<String>,
}

/// Keyword tables plus turn thresholds, built once per call from config.
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    min_turns: u32,
    max_turns: u32,
    location_terms: Vec<String>,
    incident_terms: Vec<IncidentTerm>,
}

impl DispatchPolicy {
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            min_turns: config.min_turns,
            max_turns: config.max_turns,
            location_terms: config
                .location_terms
                .iter()
                .map(|t| t.to_lowercase())
                .collect(),
            incident_terms: config
                .incident_terms
                .iter()
                .map(|t| IncidentTerm {
                    term: t.term.to_lowercase(),
                    category: t.category.clone(),
                })
                .collect(),
        }
    }

    /// Case-insensitive substring scan of one utterance.
    ///
    /// The incident table is consulted in order and the first matching
    /// term wins.
    pub fn scan_utterance(&self, text: &str) -> FactScan {
        let lower = text.to_lowercase();
        let location = self.location_terms.iter().any(|t| lower.contains(t));
        let incident_category = self
            .incident_terms
            .iter()
            .find(|t| lower.contains(&t.term))
            .map(|t| t.category.clone());
        FactScan {
            location,
            incident_category,
        }
    }

    /// Scan an utterance and record any facts it yields.
    pub fn scan_into(&self, text: &str, state: &mut ConversationState) {
        let scan = self.scan_utterance(text);
        if scan.location {
            state.note_location(text);
        }
        if let Some(category) = scan.incident_category {
            state.note_incident(&category);
        }
    }

    /// The dispatch rule, evaluated after every completed response turn:
    /// dispatch once the hard turn ceiling is reached, or earlier when the
    /// minimum turn count has passed and both facts are known.
    ///
    /// Latching the result is the caller's job and is one-way.
    pub fn should_dispatch(&self, state: &ConversationState) -> bool {
        let turns = state.turn_count();
        turns >= self.max_turns
            || (turns >= self.min_turns
                && state.has_location()
                && state.has_incident_category())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::config::DispatchConfig;

    fn policy() -> DispatchPolicy {
        DispatchPolicy::new(&DispatchConfig::default())
    }

    #[test]
    fn both_facts_dispatch_at_min_turns_not_later() {
        let policy = policy();
        let mut state = ConversationState::new();
        state.note_location("fire at Oak Street");
        state.note_incident("Fire");

        for turn in 1..=3 {
            state.complete_turn();
            assert!(
                !policy.should_dispatch(&state),
                "must not dispatch at turn {turn}"
            );
        }
        state.complete_turn();
        assert!(policy.should_dispatch(&state), "must dispatch at turn 4");
    }

    #[test]
    fn no_facts_dispatch_exactly_at_max_turns() {
        let policy = policy();
        let mut state = ConversationState::new();

        for turn in 1..=5 {
            state.complete_turn();
            assert!(
                !policy.should_dispatch(&state),
                "must not dispatch at turn {turn}"
            );
        }
        state.complete_turn();
        assert!(policy.should_dispatch(&state), "must dispatch at turn 6");
    }

    #[test]
    fn one_fact_alone_never_dispatches_early() {
        let policy = policy();
        let mut state = ConversationState::new();
        state.note_location("on Main Street");
        for _ in 0..5 {
            state.complete_turn();
        }
        assert!(!policy.should_dispatch(&state));
    }

    #[test]
    fn scan_is_case_insensitive() {
        let scan = policy().scan_utterance("THERE IS A FIRE ON OAK STREET");
        assert!(scan.location);
        assert_eq!(scan.incident_category.as_deref(), Some("Fire"));
    }

    #[test]
    fn first_incident_table_entry_wins() {
        // Table order decides, not position in the utterance.
        let scan = policy().scan_utterance("a car accident started a fire");
        assert_eq!(scan.incident_category.as_deref(), Some("Fire"));
    }

    #[test]
    fn at_with_trailing_space_marks_location() {
        let scan = policy().scan_utterance("we are at 5th and Main");
        assert!(scan.location);
    }

    #[test]
    fn unrelated_text_yields_no_facts() {
        let scan = policy().scan_utterance("please hurry");
        assert!(!scan.location);
        assert!(scan.incident_category.is_none());
    }

    #[test]
    fn scan_into_records_first_capture_only() {
        let policy = policy();
        let mut state = ConversationState::new();
        policy.scan_into("there's a fire on Oak Street", &mut state);
        policy.scan_into("also a medical emergency on Elm Road", &mut state);
        assert_eq!(state.location(), Some("there's a fire on Oak Street"));
        assert_eq!(state.incident_category(), Some("Fire"));
    }
}
