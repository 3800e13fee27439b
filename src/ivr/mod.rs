//! Fallback intake flow built from discrete webhook exchanges.
//!
//! When the streaming speech path is unavailable the call is driven as a
//! chain of gather/respond steps instead: ask, transcribe, interpret,
//! reply. Each step is one HTTP round trip; the telephony provider holds
//! the call open between them. The chain is
//! process-speech → followup-questions → question-2 → question-3, then a
//! hold loop until an operator closes the call.
//!
//! Interpretation failures never stall the flow: the keyword scan has
//! already banked whatever facts the utterance carried, and after a fixed
//! number of questions the flow completes with a scripted dispatch line.

pub mod interpret;
pub mod voice;

use std::sync::Arc;

use tracing::{info, warn};

use crate::call::{Call, CallStatus, Speaker, Utterance, clamp_priority};
use crate::config::SirenConfig;
use crate::dispatch::{DispatchPolicy, FactScan};
use crate::error::SirenError;
use crate::gateway::twiml::{Prompt, VoiceDocument};
use crate::store::{CallPatch, CallStore};

use self::interpret::{IntakeDecision, Interpreter};
use self::voice::Synthesizer;

/// Webhook paths shared between the rendered documents and the router.
pub const PROCESS_SPEECH_PATH: &str = "/webhooks/process-speech";
pub const FOLLOWUP_PATH: &str = "/webhooks/followup-questions";
pub const QUESTION_2_PATH: &str = "/webhooks/question-2";
pub const QUESTION_3_PATH: &str = "/webhooks/question-3";
pub const HOLD_PATH: &str = "/webhooks/hold-caller";

const GREETING_LINE: &str = "Nine one one. What is your emergency?";
const RETRY_LINE: &str = "I'm sorry, I didn't catch that. Could you say it again?";
const FORCED_DISPATCH_LINE: &str =
    "Thank you. Emergency services are being dispatched to your location now. \
     Please stay on the line.";
const HOLD_FALLBACK_LINE: &str = "Help is on the way. Please stay on the line and stay safe.";
const ARRIVAL_LINE: &str =
    "Responders have arrived at your location. You are in good hands now. You may hang up.";
const TROUBLE_LINE: &str =
    "I'm sorry, we are having trouble with this call. Please hang up and dial again.";

/// Which answer of the question chain a webhook carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IvrStep {
    ProcessSpeech,
    FollowupQuestions,
    QuestionTwo,
    QuestionThree,
}

impl IvrStep {
    /// Follow-up questions the flow had asked before this answer arrived.
    fn questions_asked(self) -> u32 {
        match self {
            IvrStep::ProcessSpeech => 0,
            IvrStep::FollowupQuestions => 1,
            IvrStep::QuestionTwo => 2,
            IvrStep::QuestionThree => 3,
        }
    }

    /// Path this step's answers are posted to.
    pub fn path(self) -> &'static str {
        match self {
            IvrStep::ProcessSpeech => PROCESS_SPEECH_PATH,
            IvrStep::FollowupQuestions => FOLLOWUP_PATH,
            IvrStep::QuestionTwo => QUESTION_2_PATH,
            IvrStep::QuestionThree => QUESTION_3_PATH,
        }
    }

    /// Where the next answer goes, if another question may still be asked.
    fn next_path(self) -> Option<&'static str> {
        match self {
            IvrStep::ProcessSpeech => Some(FOLLOWUP_PATH),
            IvrStep::FollowupQuestions => Some(QUESTION_2_PATH),
            IvrStep::QuestionTwo => Some(QUESTION_3_PATH),
            IvrStep::QuestionThree => None,
        }
    }
}

/// Drives one call through the fallback intake chain.
pub struct IvrFlow {
    store: Arc<dyn CallStore>,
    interpreter: Arc<Interpreter>,
    synthesizer: Arc<Synthesizer>,
    policy: DispatchPolicy,
    public_host: String,
    forced_completion_after: u32,
}

impl IvrFlow {
    pub fn new(
        store: Arc<dyn CallStore>,
        interpreter: Arc<Interpreter>,
        synthesizer: Arc<Synthesizer>,
        config: &SirenConfig,
    ) -> Self {
        Self {
            store,
            interpreter,
            synthesizer,
            policy: DispatchPolicy::new(&config.dispatch),
            public_host: config.server.public_host.clone(),
            forced_completion_after: config.interpreter.forced_completion_after,
        }
    }

    /// Opening document for a call entering the fallback path.
    pub async fn greet(&self) -> VoiceDocument {
        let prompt = self.prompt_for(GREETING_LINE).await;
        VoiceDocument::new()
            .gather_speech(PROCESS_SPEECH_PATH, prompt)
            .redirect(PROCESS_SPEECH_PATH)
    }

    /// Handle one answer in the question chain.
    pub async fn speech_step(
        &self,
        step: IvrStep,
        call_sid: &str,
        speech: Option<&str>,
    ) -> VoiceDocument {
        let speech = speech.map(str::trim).unwrap_or_default();
        if speech.is_empty() {
            let prompt = self.prompt_for(RETRY_LINE).await;
            return VoiceDocument::new()
                .gather_speech(step.path(), prompt)
                .redirect(step.path());
        }

        let call = match self.load_call(call_sid).await {
            Some(call) => call,
            None => return trouble_document(),
        };

        let scan = self.policy.scan_utterance(speech);
        self.record_caller_speech(&call, speech, &scan).await;

        let transcript = transcript_of(&call, Some(speech));
        match self
            .interpreter
            .interpret(&transcript, step.questions_asked())
            .await
        {
            Ok(decision) => self.apply_decision(step, &call.call_id, decision).await,
            Err(e) => {
                warn!(call_id = %call.call_id, error = %e, "interpretation failed; applying completion policy");
                let category = scan
                    .incident_category
                    .as_deref()
                    .or(call.incident_category.as_deref());
                self.forced_step(step, &call.call_id, category).await
            }
        }
    }

    /// One pass of the hold loop for a dispatch-ready call.
    pub async fn hold_step(&self, call_sid: &str, speech: Option<&str>) -> VoiceDocument {
        let call = match self.load_call(call_sid).await {
            Some(call) => call,
            None => return trouble_document(),
        };

        if let Some(text) = speech.map(str::trim).filter(|s| !s.is_empty()) {
            let scan = self.policy.scan_utterance(text);
            self.record_caller_speech(&call, text, &scan).await;
        }

        if call.on_scene {
            let prompt = self.prompt_for(ARRIVAL_LINE).await;
            return with_prompt(VoiceDocument::new(), prompt).hangup();
        }

        if call.officer_notified {
            let line = match call.assigned_officer.as_deref() {
                Some(officer) => {
                    format!("Officer {officer} has been dispatched and is on the way to you now.")
                }
                None => "An officer has been dispatched and is on the way to you now.".to_owned(),
            };
            // Clearing the flag only stops repeat announcements; the call
            // stays in its dispatched state.
            if let Err(e) = self
                .store
                .patch(&call.call_id, CallPatch::new().with_officer_notified(false))
                .await
            {
                warn!(call_id = %call.call_id, error = %e, "failed to clear officer notification");
            }
            let prompt = self.prompt_for(&line).await;
            return with_prompt(VoiceDocument::new(), prompt)
                .pause(5)
                .redirect(HOLD_PATH);
        }

        let transcript = transcript_of(&call, None);
        let line = match self.interpreter.hold_response(&transcript).await {
            Ok(line) => line,
            Err(e) => {
                warn!(call_id = %call.call_id, error = %e, "hold response failed; using scripted line");
                HOLD_FALLBACK_LINE.to_owned()
            }
        };
        let prompt = self.prompt_for(&line).await;
        VoiceDocument::new()
            .gather_speech(HOLD_PATH, prompt)
            .redirect(HOLD_PATH)
    }

    async fn load_call(&self, call_sid: &str) -> Option<Call> {
        match self.store.fetch(call_sid).await {
            Ok(Some(call)) => Some(call),
            Ok(None) => {
                warn!(call_id = %call_sid, "webhook step for unknown call");
                None
            }
            Err(e) => {
                warn!(call_id = %call_sid, error = %e, "failed to load call");
                None
            }
        }
    }

    /// Bank the utterance and any keyword-derived facts before the
    /// interpreter runs, so a malformed model reply loses nothing.
    async fn record_caller_speech(&self, call: &Call, speech: &str, scan: &FactScan) {
        if let Err(e) = self
            .store
            .append_utterance(&call.call_id, Utterance::new(Speaker::Caller, speech))
            .await
        {
            warn!(call_id = %call.call_id, error = %e, "transcript append failed");
        }

        let mut patch = CallPatch::new().with_description_append(speech);
        if scan.location && call.location.is_none() {
            patch = patch.with_location(speech);
        }
        if let Some(category) = scan.incident_category.as_deref()
            && call.incident_category.is_none()
        {
            patch = patch.with_incident_category(category);
        }
        if let Err(e) = self.store.patch(&call.call_id, patch).await {
            warn!(call_id = %call.call_id, error = %e, "call update failed");
        }
    }

    async fn apply_decision(
        &self,
        step: IvrStep,
        call_id: &str,
        decision: IntakeDecision,
    ) -> VoiceDocument {
        let mut patch = CallPatch::new();
        if let Some(location) = decision.location.as_deref().map(str::trim)
            && !location.is_empty()
        {
            patch = patch.with_location(location);
        }
        if let Some(category) = decision.incident_category.as_deref().map(str::trim)
            && !category.is_empty()
        {
            patch = patch.with_incident_category(category);
        }
        if let Some(priority) = decision.priority {
            patch = patch.with_priority(clamp_priority(priority));
        }

        let complete = decision.is_complete || step.next_path().is_none();
        if complete {
            patch = patch.with_status(CallStatus::Active);
        }
        if let Err(e) = self.store.patch(call_id, patch).await {
            warn!(call_id = %call_id, error = %e, "call update failed");
        }

        let reply = decision.response_text.trim();
        let reply = if reply.is_empty() {
            FORCED_DISPATCH_LINE
        } else {
            reply
        };
        let prompt = self.prompt_for(reply).await;

        if complete {
            info!(call_id = %call_id, "intake complete; moving caller to hold");
            return with_prompt(VoiceDocument::new(), prompt).redirect(HOLD_PATH);
        }
        let next = step.next_path().unwrap_or(HOLD_PATH);
        VoiceDocument::new()
            .gather_speech(next, prompt)
            .redirect(next)
    }

    /// Completion policy for steps whose interpretation failed.
    async fn forced_step(
        &self,
        step: IvrStep,
        call_id: &str,
        category: Option<&str>,
    ) -> VoiceDocument {
        let out_of_questions = step.next_path().is_none();
        if step.questions_asked() >= self.forced_completion_after || out_of_questions {
            info!(call_id = %call_id, "forcing intake completion");
            if let Err(e) = self
                .store
                .patch(call_id, CallPatch::new().with_status(CallStatus::Active))
                .await
            {
                warn!(call_id = %call_id, error = %e, "call update failed");
            }
            let prompt = self.prompt_for(FORCED_DISPATCH_LINE).await;
            return with_prompt(VoiceDocument::new(), prompt).redirect(HOLD_PATH);
        }

        let next = step.next_path().unwrap_or(HOLD_PATH);
        let prompt = self.prompt_for(followup_question(category)).await;
        VoiceDocument::new()
            .gather_speech(next, prompt)
            .redirect(next)
    }

    /// Synthesized prompt when possible, provider voice otherwise.
    async fn prompt_for(&self, text: &str) -> Prompt {
        match self.synthesizer.synthesize(text).await {
            Ok(path) => Prompt::Play(format!("https://{}{}", self.public_host, path)),
            Err(SirenError::Config(_)) => Prompt::Say(text.to_owned()),
            Err(e) => {
                warn!(error = %e, "synthesis failed; speaking with provider voice");
                Prompt::Say(text.to_owned())
            }
        }
    }
}

fn with_prompt(doc: VoiceDocument, prompt: Prompt) -> VoiceDocument {
    match prompt {
        Prompt::Say(text) => doc.say(text),
        Prompt::Play(url) => doc.play(url),
    }
}

fn trouble_document() -> VoiceDocument {
    VoiceDocument::new().say(TROUBLE_LINE).hangup()
}

/// Question to ask when the interpreter gave us nothing to say.
fn followup_question(category: Option<&str>) -> &'static str {
    match category.map(str::to_lowercase).as_deref() {
        Some(c) if c.contains("fire") => "Is anyone trapped or hurt, and is the fire spreading?",
        Some(c) if c.contains("medical") => "Is the person conscious and breathing?",
        Some(c) if c.contains("police") || c.contains("accident") => {
            "Is anyone in immediate danger right now?"
        }
        _ => "Can you tell me exactly where you are and what is happening?",
    }
}

fn transcript_of(call: &Call, latest: Option<&str>) -> String {
    let mut lines: Vec<String> = call
        .transcript
        .iter()
        .map(|u| match u.speaker {
            Speaker::Caller => format!("Caller: {}", u.text),
            Speaker::Agent => format!("Dispatcher: {}", u.text),
        })
        .collect();
    if let Some(latest) = latest {
        lines.push(format!("Caller: {latest}"));
    }
    lines.join("\n")
}
