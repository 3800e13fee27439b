//! Call records: the persistent view of one phone call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default priority for a new call (1 = critical … 5 = low).
pub const DEFAULT_PRIORITY: u8 = 3;

/// Clamp a priority value into the valid 1..=5 range.
pub fn clamp_priority(priority: u8) -> u8 {
    priority.clamp(1, 5)
}

/// Lifecycle status of a call.
///
/// Transitions move forward only, with one administrative exception:
/// `Dispatched → Active` when an officer assignment is withdrawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    /// Webhook received, no media yet.
    Initiating,
    /// Automated intake in progress.
    Processing,
    /// Dispatch-ready: enough information gathered, waiting for an officer.
    Active,
    /// Officer assigned and notified.
    Dispatched,
    /// Officer arrived on scene.
    OnScene,
    /// Terminal. A closed call is immutable.
    Closed,
}

impl CallStatus {
    fn rank(self) -> u8 {
        match self {
            CallStatus::Initiating => 0,
            CallStatus::Processing => 1,
            CallStatus::Active => 2,
            CallStatus::Dispatched => 3,
            CallStatus::OnScene => 4,
            CallStatus::Closed => 5,
        }
    }

    /// Whether a transition to `next` is allowed.
    ///
    /// Same-status transitions are allowed (idempotent upserts).
    pub fn can_transition_to(self, next: CallStatus) -> bool {
        if self == next {
            return true;
        }
        if self == CallStatus::Dispatched && next == CallStatus::Active {
            return true;
        }
        next.rank() > self.rank()
    }
}

/// Who produced an utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Caller,
    Agent,
}

/// One speaker-tagged line of the conversation transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Utterance {
    pub speaker: Speaker,
    pub text: String,
    pub at: DateTime<Utc>,
}

impl Utterance {
    pub fn new(speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            speaker,
            text: text.into(),
            at: Utc::now(),
        }
    }
}

/// One phone call, from webhook to closure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    /// Provider call identifier, stable for the call's lifetime.
    pub call_id: String,
    /// Media stream identifier, assigned when the provider opens the audio
    /// channel. Outbound audio requires this.
    pub stream_id: Option<String>,
    /// Caller address (phone number).
    pub caller: String,
    pub status: CallStatus,
    /// Extracted location, if any.
    pub location: Option<String>,
    /// Extracted incident category, if any.
    pub incident_category: Option<String>,
    /// Free-text description accumulated over the conversation.
    pub description: String,
    /// 1 = critical … 5 = low.
    pub priority: u8,
    /// Ordered conversation transcript.
    pub transcript: Vec<Utterance>,
    /// Officer assigned by an operator, if any.
    pub assigned_officer: Option<String>,
    /// Set on assignment; cleared once the caller has been told.
    pub officer_notified: bool,
    /// Officer has arrived on scene.
    pub on_scene: bool,
    pub recording_url: Option<String>,
    pub recording_duration_secs: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Call {
    /// Create a fresh call record in the `Initiating` state.
    pub fn new(call_id: impl Into<String>, caller: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            call_id: call_id.into(),
            stream_id: None,
            caller: caller.into(),
            status: CallStatus::Initiating,
            location: None,
            incident_category: None,
            description: String::new(),
            priority: DEFAULT_PRIORITY,
            transcript: Vec::new(),
            assigned_officer: None,
            officer_notified: false,
            on_scene: false,
            recording_url: None,
            recording_duration_secs: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append one transcript line and bump `updated_at`.
    pub fn append_utterance(&mut self, utterance: Utterance) {
        self.transcript.push(utterance);
        self.touch();
    }

    /// Append to the free-text description with a `" | "` separator.
    pub fn push_description(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if self.description.is_empty() {
            self.description = text.to_owned();
        } else {
            self.description.push_str(" | ");
            self.description.push_str(text);
        }
        self.touch();
    }

    /// Refresh the modification timestamp.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn forward_transitions_are_allowed() {
        use CallStatus::*;
        let order = [Initiating, Processing, Active, Dispatched, OnScene, Closed];
        for window in order.windows(2) {
            assert!(
                window[0].can_transition_to(window[1]),
                "{:?} -> {:?} should be allowed",
                window[0],
                window[1]
            );
        }
        // Skipping intermediate states forward is fine.
        assert!(Processing.can_transition_to(Closed));
        assert!(Active.can_transition_to(OnScene));
    }

    #[test]
    fn backward_transitions_are_rejected() {
        use CallStatus::*;
        assert!(!Closed.can_transition_to(OnScene));
        assert!(!Active.can_transition_to(Processing));
        assert!(!Processing.can_transition_to(Initiating));
        assert!(!OnScene.can_transition_to(Dispatched));
    }

    #[test]
    fn dispatched_can_revert_to_active() {
        assert!(CallStatus::Dispatched.can_transition_to(CallStatus::Active));
        // But not further back.
        assert!(!CallStatus::Dispatched.can_transition_to(CallStatus::Processing));
    }

    #[test]
    fn same_status_transition_is_allowed() {
        assert!(CallStatus::Active.can_transition_to(CallStatus::Active));
    }

    #[test]
    fn transcript_preserves_order() {
        let mut call = Call::new("CA1", "+15550100");
        call.append_utterance(Utterance::new(Speaker::Agent, "What is your emergency?"));
        call.append_utterance(Utterance::new(Speaker::Caller, "There is a fire"));
        assert_eq!(call.transcript.len(), 2);
        assert_eq!(call.transcript[0].speaker, Speaker::Agent);
        assert_eq!(call.transcript[1].text, "There is a fire");
    }

    #[test]
    fn description_accumulates_with_separator() {
        let mut call = Call::new("CA1", "+15550100");
        call.push_description("fire reported");
        call.push_description("two people inside");
        call.push_description("   ");
        assert_eq!(call.description, "fire reported | two people inside");
    }

    #[test]
    fn new_call_defaults() {
        let call = Call::new("CA1", "+15550100");
        assert_eq!(call.status, CallStatus::Initiating);
        assert_eq!(call.priority, DEFAULT_PRIORITY);
        assert!(call.stream_id.is_none());
        assert!(!call.officer_notified);
    }

    #[test]
    fn priority_clamps_into_range() {
        assert_eq!(clamp_priority(0), 1);
        assert_eq!(clamp_priority(3), 3);
        assert_eq!(clamp_priority(9), 5);
    }

    #[test]
    fn status_serializes_kebab_case() {
        let json = serde_json::to_string(&CallStatus::OnScene).unwrap();
        assert_eq!(json, "\"on-scene\"");
    }
}
