//! Streaming call orchestration.
//!
//! One orchestrator instance owns one call: it relays companded audio
//! between the telephony media stream and the speech session, tracks the
//! conversation, and decides when enough is known to dispatch. The call
//! runs as a single task group (inbound relay, event relay, and in manual
//! turn mode a silence poll) scoped to one cancellation token, so teardown
//! is always joint: a provider `stop`, a dropped socket, or a closed
//! speech session each shut down the whole group.
//!
//! Persistence along the way is best effort. The in-memory conversation
//! state stays authoritative for the remainder of the call; a storage
//! hiccup is logged for operators, never surfaced to the caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::call::{Call, CallStatus, Speaker, Utterance};
use crate::config::{SirenConfig, TurnDetectionMode};
use crate::conversation::ConversationState;
use crate::dispatch::DispatchPolicy;
use crate::error::{Result, SirenError};
use crate::media::{InboundFrame, decode_frame, outbound_media};
use crate::speech::{SpeechChannel, SpeechEvent};
use crate::store::{CallPatch, CallStore};
use crate::turn::TurnDetector;

/// Buffer for raw frame text between the gateway socket pumps and the
/// relay loops, in each direction.
pub const FRAME_CHANNEL_SIZE: usize = 64;

/// Orchestrates one streaming call end to end.
pub struct CallOrchestrator {
    store: Arc<dyn CallStore>,
    config: Arc<SirenConfig>,
}

impl CallOrchestrator {
    pub fn new(store: Arc<dyn CallStore>, config: Arc<SirenConfig>) -> Self {
        Self { store, config }
    }

    /// Drive the call until either side hangs up.
    ///
    /// `inbound` carries raw frame text from the telephony socket,
    /// `outbound` carries frame text back to it. Returns an error only
    /// when the speech session cannot be established; everything after
    /// that degrades in place.
    pub async fn run(
        self,
        mut inbound: mpsc::Receiver<String>,
        outbound: mpsc::Sender<String>,
    ) -> Result<()> {
        let Some((call_id, stream_id)) = wait_for_start(&mut inbound).await else {
            debug!("media socket closed before start");
            return Ok(());
        };
        info!(call_id = %call_id, stream_id = %stream_id, "media stream opened");
        self.ensure_call(&call_id, &stream_id).await;

        let (speech, events) = match SpeechChannel::open(&self.config.speech).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(call_id = %call_id, error = %e, "speech session unavailable");
                let note = format!("streaming intake unavailable: {e}");
                if let Err(pe) = self
                    .store
                    .patch(&call_id, CallPatch::new().with_description_append(note))
                    .await
                {
                    warn!(call_id = %call_id, error = %pe, "call update failed");
                }
                return Err(e);
            }
        };
        let speech = Arc::new(speech);

        let cancel = CancellationToken::new();
        let detector = Arc::new(Mutex::new(TurnDetector::new(Duration::from_millis(
            self.config.turns.silence_threshold_ms,
        ))));
        let dispatch_done = Arc::new(AtomicBool::new(false));
        let policy = DispatchPolicy::new(&self.config.dispatch);

        let inbound_handle = {
            let speech = speech.clone();
            let detector = detector.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_inbound_relay(inbound, speech, detector, cancel).await;
            })
        };

        let event_handle = {
            let speech = speech.clone();
            let store = self.store.clone();
            let config = self.config.clone();
            let dispatch_done = dispatch_done.clone();
            let cancel = cancel.clone();
            let call_id = call_id.clone();
            let stream_id = stream_id.clone();
            tokio::spawn(async move {
                run_event_relay(
                    events,
                    speech,
                    outbound,
                    store,
                    policy,
                    config,
                    call_id,
                    stream_id,
                    dispatch_done,
                    cancel,
                )
                .await;
            })
        };

        // The speech service ends turns itself under server VAD; the local
        // silence poll only exists in manual mode.
        let poll_handle = match self.config.speech.turn_detection {
            TurnDetectionMode::Manual => {
                let speech = speech.clone();
                let detector = detector.clone();
                let dispatch_done = dispatch_done.clone();
                let cancel = cancel.clone();
                let poll_interval = Duration::from_millis(self.config.turns.poll_interval_ms);
                Some(tokio::spawn(async move {
                    run_silence_poll(speech, detector, poll_interval, dispatch_done, cancel).await;
                }))
            }
            TurnDetectionMode::ServerVad => None,
        };

        cancel.cancelled().await;
        if let Some(poll) = poll_handle {
            let _ = poll.await;
        }
        let _ = tokio::join!(inbound_handle, event_handle);
        speech.close();
        info!(call_id = %call_id, "call relay shut down");
        Ok(())
    }

    /// The call record normally exists before the media stream opens (the
    /// voice webhook created it); recover if the stream arrived first.
    async fn ensure_call(&self, call_id: &str, stream_id: &str) {
        let patch = CallPatch::new()
            .with_stream_id(stream_id)
            .with_status(CallStatus::Processing);
        match self.store.patch(call_id, patch.clone()).await {
            Ok(_) => {}
            Err(SirenError::UnknownCall(_)) => {
                warn!(call_id = %call_id, "media stream for a call with no webhook record");
                if let Err(e) = self.store.create(Call::new(call_id, "unknown")).await {
                    warn!(call_id = %call_id, error = %e, "call create failed");
                    return;
                }
                if let Err(e) = self.store.patch(call_id, patch).await {
                    warn!(call_id = %call_id, error = %e, "call update failed");
                }
            }
            Err(e) => warn!(call_id = %call_id, error = %e, "call update failed"),
        }
    }
}

/// Consume frames until the provider announces the stream, yielding the
/// call and stream identifiers. `None` means the socket ended first.
async fn wait_for_start(inbound: &mut mpsc::Receiver<String>) -> Option<(String, String)> {
    while let Some(text) = inbound.recv().await {
        match decode_frame(&text) {
            Ok(InboundFrame::Start { call_id, stream_id }) => {
                // Outbound frames echo this id; an empty one would tag
                // every response frame with an unroutable stream.
                if stream_id.is_empty() {
                    warn!(call_id = %call_id, "start frame with an empty stream id; waiting for a usable start");
                    continue;
                }
                return Some((call_id, stream_id));
            }
            Ok(InboundFrame::Stop) => return None,
            Ok(InboundFrame::Media { .. }) => {
                debug!("audio before start; dropping");
            }
            Ok(InboundFrame::Connected | InboundFrame::Ignored) => {}
            Err(e) => warn!(error = %e, "dropping malformed frame"),
        }
    }
    None
}

/// Telephony socket → speech session.
async fn run_inbound_relay(
    mut inbound: mpsc::Receiver<String>,
    speech: Arc<SpeechChannel>,
    detector: Arc<Mutex<TurnDetector>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            frame = inbound.recv() => {
                let Some(text) = frame else {
                    debug!("telephony socket closed");
                    break;
                };
                match decode_frame(&text) {
                    Ok(InboundFrame::Media { payload }) => {
                        detector.lock().await.note_audio(Instant::now());
                        speech.send_audio(&payload);
                    }
                    Ok(InboundFrame::Stop) => {
                        info!("provider closed the stream");
                        break;
                    }
                    Ok(InboundFrame::Start { .. }) => {
                        debug!("duplicate start frame; ignoring");
                    }
                    Ok(InboundFrame::Connected | InboundFrame::Ignored) => {}
                    // A single bad frame never takes the call down.
                    Err(e) => warn!(error = %e, "dropping malformed frame"),
                }
            }
        }
    }
    cancel.cancel();
}

/// Speech session → telephony socket, plus conversation tracking and the
/// dispatch decision.
#[allow(clippy::too_many_arguments)]
async fn run_event_relay(
    mut events: mpsc::UnboundedReceiver<SpeechEvent>,
    speech: Arc<SpeechChannel>,
    outbound: mpsc::Sender<String>,
    store: Arc<dyn CallStore>,
    policy: DispatchPolicy,
    config: Arc<SirenConfig>,
    call_id: String,
    stream_id: String,
    dispatch_done: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut state = ConversationState::new();
    let mut greeted = false;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => {
                let Some(event) = event else {
                    info!(call_id = %call_id, "speech session closed");
                    break;
                };
                match event {
                    SpeechEvent::SessionReady => {
                        if !greeted {
                            greeted = true;
                            info!(call_id = %call_id, "session ready; greeting caller");
                            speech.instruct(&config.speech.greeting_instruction);
                        }
                    }
                    SpeechEvent::AudioChunk(audio) => {
                        let frame = outbound_media(&stream_id, &audio);
                        if outbound.send(frame).await.is_err() {
                            info!(call_id = %call_id, "telephony socket gone; ending relay");
                            break;
                        }
                    }
                    SpeechEvent::TranscriptFinal(text) => {
                        debug!(call_id = %call_id, transcript = %text, "caller turn");
                        policy.scan_into(&text, &mut state);
                        if let Err(e) = store
                            .append_utterance(&call_id, Utterance::new(Speaker::Caller, text.as_str()))
                            .await
                        {
                            warn!(call_id = %call_id, error = %e, "transcript append failed");
                        }
                        state.record_caller(text);
                    }
                    SpeechEvent::AgentTranscript(text) => {
                        debug!(call_id = %call_id, transcript = %text, "agent turn");
                        if let Err(e) = store
                            .append_utterance(&call_id, Utterance::new(Speaker::Agent, text.as_str()))
                            .await
                        {
                            warn!(call_id = %call_id, error = %e, "transcript append failed");
                        }
                        state.record_agent(text);
                    }
                    SpeechEvent::ResponseComplete => {
                        let turns = state.complete_turn();
                        if !state.dispatch_triggered() && policy.should_dispatch(&state) {
                            state.latch_dispatch();
                            dispatch_done.store(true, Ordering::Relaxed);
                            info!(call_id = %call_id, turns, "dispatch conditions met");
                            speech.say(&closing_instruction(&config.speech.closing_line));
                            persist_facts(&store, &call_id, &state, true).await;
                        }
                    }
                    SpeechEvent::ServiceError(message) => {
                        warn!(call_id = %call_id, message = %message, "speech service reported an error");
                    }
                }
            }
        }
    }

    // Whatever is known survives the teardown, latched or not.
    persist_facts(&store, &call_id, &state, state.dispatch_triggered()).await;
    cancel.cancel();
}

/// Local end-of-turn detection for sessions negotiated without server VAD.
async fn run_silence_poll(
    speech: Arc<SpeechChannel>,
    detector: Arc<Mutex<TurnDetector>>,
    poll_interval: Duration,
    dispatch_done: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(poll_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = tick.tick() => {
                // Relay-only after dispatch: the closing line plays out,
                // no further turns are requested.
                if dispatch_done.load(Ordering::Relaxed) {
                    continue;
                }
                if detector.lock().await.should_commit(Instant::now()) {
                    speech.commit_and_respond();
                }
            }
        }
    }
}

fn closing_instruction(line: &str) -> String {
    format!("Say this to the caller now: {line}")
}

async fn persist_facts(
    store: &Arc<dyn CallStore>,
    call_id: &str,
    state: &ConversationState,
    mark_active: bool,
) {
    let mut patch = CallPatch::new();
    if let Some(location) = state.location() {
        patch = patch.with_location(location);
    }
    if let Some(category) = state.incident_category() {
        patch = patch.with_incident_category(category);
    }
    if mark_active {
        patch = patch.with_status(CallStatus::Active);
    }
    if let Err(e) = store.patch(call_id, patch).await {
        warn!(call_id = %call_id, error = %e, "dispatch record update failed; conversation state remains authoritative");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::store::MemoryStore;

    fn start_frame(call_id: &str, stream_id: &str) -> String {
        serde_json::json!({
            "event": "start",
            "start": { "callSid": call_id, "streamSid": stream_id },
        })
        .to_string()
    }

    #[tokio::test]
    async fn start_frame_yields_identifiers() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(r#"{"event":"connected"}"#.to_owned()).await.unwrap();
        tx.send("not json".to_owned()).await.unwrap();
        tx.send(r#"{"event":"mark"}"#.to_owned()).await.unwrap();
        tx.send(start_frame("CA1", "MZ1")).await.unwrap();

        let (call_id, stream_id) = wait_for_start(&mut rx).await.unwrap();
        assert_eq!(call_id, "CA1");
        assert_eq!(stream_id, "MZ1");
    }

    #[tokio::test]
    async fn empty_stream_id_is_not_a_usable_start() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(start_frame("CA1", "")).await.unwrap();
        tx.send(start_frame("CA1", "MZ1")).await.unwrap();

        let (_, stream_id) = wait_for_start(&mut rx).await.unwrap();
        assert_eq!(stream_id, "MZ1");
    }

    #[tokio::test]
    async fn stop_before_start_ends_the_wait() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(r#"{"event":"stop"}"#.to_owned()).await.unwrap();
        assert!(wait_for_start(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn socket_close_before_start_ends_the_wait() {
        let (tx, mut rx) = mpsc::channel::<String>(8);
        drop(tx);
        assert!(wait_for_start(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn run_marks_call_before_failing_without_speech_service() {
        let store = Arc::new(MemoryStore::new());
        store
            .create(Call::new("CA1", "+15550001111"))
            .await
            .unwrap();

        let mut config = SirenConfig::default();
        config.speech.api_key_env = "SIREN_TEST_UNSET_SPEECH_KEY".to_owned();
        let orchestrator = CallOrchestrator::new(store.clone(), Arc::new(config));

        let (in_tx, in_rx) = mpsc::channel(FRAME_CHANNEL_SIZE);
        let (out_tx, _out_rx) = mpsc::channel(FRAME_CHANNEL_SIZE);
        in_tx.send(start_frame("CA1", "MZ1")).await.unwrap();

        let err = orchestrator.run(in_rx, out_tx).await.unwrap_err();
        assert!(matches!(err, SirenError::Config(_)));

        let call = store.fetch("CA1").await.unwrap().unwrap();
        assert_eq!(call.stream_id.as_deref(), Some("MZ1"));
        assert_eq!(call.status, CallStatus::Processing);
        assert!(call.description.contains("streaming intake unavailable"));
    }

    #[tokio::test]
    async fn stream_without_webhook_record_creates_one() {
        let store = Arc::new(MemoryStore::new());
        let mut config = SirenConfig::default();
        config.speech.api_key_env = "SIREN_TEST_UNSET_SPEECH_KEY".to_owned();
        let orchestrator = CallOrchestrator::new(store.clone(), Arc::new(config));

        let (in_tx, in_rx) = mpsc::channel(FRAME_CHANNEL_SIZE);
        let (out_tx, _out_rx) = mpsc::channel(FRAME_CHANNEL_SIZE);
        in_tx.send(start_frame("CA-orphan", "MZ9")).await.unwrap();

        let _ = orchestrator.run(in_rx, out_tx).await;

        let call = store.fetch("CA-orphan").await.unwrap().unwrap();
        assert_eq!(call.stream_id.as_deref(), Some("MZ9"));
    }

    #[test]
    fn closing_instruction_embeds_the_line() {
        let line = "Okay, help is on the way.";
        assert!(closing_instruction(line).contains(line));
    }
}
