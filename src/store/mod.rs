//! Call record persistence.
//!
//! The orchestrator and IVR flow treat storage as an external collaborator
//! behind [`CallStore`]; operations are idempotent and keyed by call id,
//! which is safe because no two orchestrator instances ever own the same
//! call. [`MemoryStore`] is the in-process implementation backing the
//! operator API.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::call::{Call, CallStatus, Utterance, clamp_priority};
use crate::error::{Result, SirenError};

/// Partial update for one call record. Unset fields are left untouched.
#[derive(Debug, Default, Clone)]
pub struct CallPatch {
    pub stream_id: Option<String>,
    pub status: Option<CallStatus>,
    pub location: Option<String>,
    pub incident_category: Option<String>,
    /// Appended to the description with a `" | "` separator.
    pub description_append: Option<String>,
    pub priority: Option<u8>,
    pub recording_url: Option<String>,
    pub recording_duration_secs: Option<u32>,
    pub officer_notified: Option<bool>,
}

impl CallPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stream_id(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = Some(stream_id.into());
        self
    }

    pub fn with_status(mut self, status: CallStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_incident_category(mut self, category: impl Into<String>) -> Self {
        self.incident_category = Some(category.into());
        self
    }

    pub fn with_description_append(mut self, text: impl Into<String>) -> Self {
        self.description_append = Some(text.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_recording(mut self, url: impl Into<String>, duration_secs: u32) -> Self {
        self.recording_url = Some(url.into());
        self.recording_duration_secs = Some(duration_secs);
        self
    }

    pub fn with_officer_notified(mut self, notified: bool) -> Self {
        self.officer_notified = Some(notified);
        self
    }
}

/// Persistence operations the intake paths and the operator API rely on.
#[async_trait]
pub trait CallStore: Send + Sync {
    /// Create the record if absent. Repeats are no-ops (webhook retries).
    async fn create(&self, call: Call) -> Result<()>;

    async fn fetch(&self, call_id: &str) -> Result<Option<Call>>;

    /// Apply a partial update and return the updated record.
    ///
    /// Fails with [`SirenError::UnknownCall`] for missing ids and
    /// [`SirenError::Persistence`] for closed calls or invalid status
    /// transitions.
    async fn patch(&self, call_id: &str, patch: CallPatch) -> Result<Call>;

    /// Append one transcript line.
    async fn append_utterance(&self, call_id: &str, utterance: Utterance) -> Result<()>;

    /// Operator action: assign an officer. Status moves to `Dispatched`
    /// and the caller-notification flag is armed.
    async fn assign_officer(&self, call_id: &str, officer_id: &str) -> Result<Call>;

    /// Operator action: the assigned officer arrived.
    async fn mark_on_scene(&self, call_id: &str) -> Result<Call>;

    /// Operator action: close the call. Terminal.
    async fn close_call(&self, call_id: &str) -> Result<Call>;

    /// All non-closed calls, most urgent first (priority, then age).
    async fn active_calls(&self) -> Result<Vec<Call>>;
}

/// In-process store backing the operator API.
#[derive(Default)]
pub struct MemoryStore {
    calls: RwLock<HashMap<String, Call>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard_mutable(call: &Call) -> Result<()> {
        if call.status == CallStatus::Closed {
            return Err(SirenError::Persistence(format!(
                "call {} is closed",
                call.call_id
            )));
        }
        Ok(())
    }

    fn transition(call: &mut Call, next: CallStatus) -> Result<()> {
        if !call.status.can_transition_to(next) {
            return Err(SirenError::Persistence(format!(
                "invalid status transition {:?} -> {next:?} for call {}",
                call.status, call.call_id
            )));
        }
        call.status = next;
        Ok(())
    }
}

#[async_trait]
impl CallStore for MemoryStore {
    async fn create(&self, call: Call) -> Result<()> {
        let mut calls = self.calls.write().await;
        if calls.contains_key(&call.call_id) {
            tracing::debug!(call_id = %call.call_id, "call already exists; keeping record");
            return Ok(());
        }
        calls.insert(call.call_id.clone(), call);
        Ok(())
    }

    async fn fetch(&self, call_id: &str) -> Result<Option<Call>> {
        let calls = self.calls.read().await;
        Ok(calls.get(call_id).cloned())
    }

    async fn patch(&self, call_id: &str, patch: CallPatch) -> Result<Call> {
        let mut calls = self.calls.write().await;
        let call = calls
            .get_mut(call_id)
            .ok_or_else(|| SirenError::UnknownCall(call_id.to_owned()))?;
        Self::guard_mutable(call)?;

        if let Some(status) = patch.status {
            Self::transition(call, status)?;
        }
        if let Some(stream_id) = patch.stream_id {
            call.stream_id = Some(stream_id);
        }
        if let Some(location) = patch.location {
            call.location = Some(location);
        }
        if let Some(category) = patch.incident_category {
            call.incident_category = Some(category);
        }
        if let Some(text) = patch.description_append {
            call.push_description(&text);
        }
        if let Some(priority) = patch.priority {
            call.priority = clamp_priority(priority);
        }
        if let Some(url) = patch.recording_url {
            call.recording_url = Some(url);
        }
        if let Some(duration) = patch.recording_duration_secs {
            call.recording_duration_secs = Some(duration);
        }
        if let Some(notified) = patch.officer_notified {
            call.officer_notified = notified;
        }
        call.touch();
        Ok(call.clone())
    }

    async fn append_utterance(&self, call_id: &str, utterance: Utterance) -> Result<()> {
        let mut calls = self.calls.write().await;
        let call = calls
            .get_mut(call_id)
            .ok_or_else(|| SirenError::UnknownCall(call_id.to_owned()))?;
        Self::guard_mutable(call)?;
        call.append_utterance(utterance);
        Ok(())
    }

    async fn assign_officer(&self, call_id: &str, officer_id: &str) -> Result<Call> {
        let mut calls = self.calls.write().await;
        let call = calls
            .get_mut(call_id)
            .ok_or_else(|| SirenError::UnknownCall(call_id.to_owned()))?;
        Self::guard_mutable(call)?;
        Self::transition(call, CallStatus::Dispatched)?;
        call.assigned_officer = Some(officer_id.to_owned());
        call.officer_notified = true;
        call.touch();
        Ok(call.clone())
    }

    async fn mark_on_scene(&self, call_id: &str) -> Result<Call> {
        let mut calls = self.calls.write().await;
        let call = calls
            .get_mut(call_id)
            .ok_or_else(|| SirenError::UnknownCall(call_id.to_owned()))?;
        Self::guard_mutable(call)?;
        Self::transition(call, CallStatus::OnScene)?;
        call.on_scene = true;
        call.touch();
        Ok(call.clone())
    }

    async fn close_call(&self, call_id: &str) -> Result<Call> {
        let mut calls = self.calls.write().await;
        let call = calls
            .get_mut(call_id)
            .ok_or_else(|| SirenError::UnknownCall(call_id.to_owned()))?;
        // Closing an already-closed call is a no-op, not an error.
        if call.status != CallStatus::Closed {
            Self::transition(call, CallStatus::Closed)?;
            call.touch();
        }
        Ok(call.clone())
    }

    async fn active_calls(&self) -> Result<Vec<Call>> {
        let calls = self.calls.read().await;
        let mut active: Vec<Call> = calls
            .values()
            .filter(|c| c.status != CallStatus::Closed)
            .cloned()
            .collect();
        active.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(active)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::call::Speaker;
    use chrono::Duration;

    #[tokio::test]
    async fn create_then_fetch() {
        let store = MemoryStore::new();
        store.create(Call::new("CA1", "+15550100")).await.unwrap();
        let call = store.fetch("CA1").await.unwrap().unwrap();
        assert_eq!(call.caller, "+15550100");
        assert_eq!(call.status, CallStatus::Initiating);
    }

    #[tokio::test]
    async fn duplicate_create_keeps_original_record() {
        let store = MemoryStore::new();
        store.create(Call::new("CA1", "+15550100")).await.unwrap();
        store
            .patch("CA1", CallPatch::new().with_location("Oak Street"))
            .await
            .unwrap();

        // Webhook retry: must not wipe what we already know.
        store.create(Call::new("CA1", "+15550100")).await.unwrap();
        let call = store.fetch("CA1").await.unwrap().unwrap();
        assert_eq!(call.location.as_deref(), Some("Oak Street"));
    }

    #[tokio::test]
    async fn patch_unknown_call_fails() {
        let store = MemoryStore::new();
        let err = store.patch("CA404", CallPatch::new()).await.unwrap_err();
        assert!(matches!(err, SirenError::UnknownCall(_)));
    }

    #[tokio::test]
    async fn backward_status_patch_is_rejected() {
        let store = MemoryStore::new();
        store.create(Call::new("CA1", "+15550100")).await.unwrap();
        store
            .patch("CA1", CallPatch::new().with_status(CallStatus::Active))
            .await
            .unwrap();
        let err = store
            .patch("CA1", CallPatch::new().with_status(CallStatus::Processing))
            .await
            .unwrap_err();
        assert!(matches!(err, SirenError::Persistence(_)));
    }

    #[tokio::test]
    async fn closed_call_is_immutable() {
        let store = MemoryStore::new();
        store.create(Call::new("CA1", "+15550100")).await.unwrap();
        store.close_call("CA1").await.unwrap();

        let err = store
            .patch("CA1", CallPatch::new().with_location("Elm Road"))
            .await
            .unwrap_err();
        assert!(matches!(err, SirenError::Persistence(_)));

        let err = store
            .append_utterance("CA1", Utterance::new(Speaker::Caller, "hello?"))
            .await
            .unwrap_err();
        assert!(matches!(err, SirenError::Persistence(_)));

        // Closing again is fine.
        assert!(store.close_call("CA1").await.is_ok());
    }

    #[tokio::test]
    async fn dispatched_reverts_to_active_when_assignment_withdrawn() {
        let store = MemoryStore::new();
        store.create(Call::new("CA1", "+15550100")).await.unwrap();
        store.assign_officer("CA1", "officer-7").await.unwrap();

        let call = store
            .patch(
                "CA1",
                CallPatch::new()
                    .with_status(CallStatus::Active)
                    .with_officer_notified(false),
            )
            .await
            .unwrap();
        assert_eq!(call.status, CallStatus::Active);
        assert!(!call.officer_notified);
    }

    #[tokio::test]
    async fn assign_officer_sets_dispatch_state() {
        let store = MemoryStore::new();
        store.create(Call::new("CA1", "+15550100")).await.unwrap();
        let call = store.assign_officer("CA1", "officer-7").await.unwrap();
        assert_eq!(call.status, CallStatus::Dispatched);
        assert_eq!(call.assigned_officer.as_deref(), Some("officer-7"));
        assert!(call.officer_notified);
    }

    #[tokio::test]
    async fn active_calls_sorted_by_priority_then_age() {
        let store = MemoryStore::new();

        let mut low = Call::new("CA-low", "+1");
        low.priority = 4;
        let mut critical = Call::new("CA-critical", "+2");
        critical.priority = 1;
        let mut older = Call::new("CA-older", "+3");
        older.priority = 4;
        older.created_at -= Duration::minutes(5);
        let mut closed = Call::new("CA-closed", "+4");
        closed.priority = 1;

        for call in [low, critical, older, closed] {
            store.create(call).await.unwrap();
        }
        store.close_call("CA-closed").await.unwrap();

        let active = store.active_calls().await.unwrap();
        let ids: Vec<&str> = active.iter().map(|c| c.call_id.as_str()).collect();
        assert_eq!(ids, vec!["CA-critical", "CA-older", "CA-low"]);
    }

    #[tokio::test]
    async fn patch_clamps_priority() {
        let store = MemoryStore::new();
        store.create(Call::new("CA1", "+15550100")).await.unwrap();
        let call = store
            .patch("CA1", CallPatch::new().with_priority(9))
            .await
            .unwrap();
        assert_eq!(call.priority, 5);
    }

    #[tokio::test]
    async fn transcript_appends_in_order() {
        let store = MemoryStore::new();
        store.create(Call::new("CA1", "+15550100")).await.unwrap();
        store
            .append_utterance("CA1", Utterance::new(Speaker::Agent, "What's your emergency?"))
            .await
            .unwrap();
        store
            .append_utterance("CA1", Utterance::new(Speaker::Caller, "A fire"))
            .await
            .unwrap();
        let call = store.fetch("CA1").await.unwrap().unwrap();
        assert_eq!(call.transcript.len(), 2);
        assert_eq!(call.transcript[1].text, "A fire");
    }
}
