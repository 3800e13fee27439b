//! Non-streaming speech interpretation for the fallback IVR path.
//!
//! One chat-completions call per IVR step: the accumulated transcript goes
//! in, a JSON [`IntakeDecision`] comes back. Model output is never trusted
//! to be well formed; a decode failure is a [`SirenError::DecisionParse`]
//! and the flow recovers with its forced-completion policy.

use serde::Deserialize;

use crate::config::InterpreterConfig;
use crate::error::{Result, SirenError};

const DECISION_PROMPT: &str = "You are an emergency intake analyst. Read the conversation \
transcript and respond with ONLY a JSON object, no prose, using exactly these keys: \
{\"incident_type\": string or null, \"location\": string or null, \"priority\": integer 1-5 \
with 1 most critical, \"response_text\": string, \"is_complete\": boolean}. response_text is \
the next sentence the dispatcher says to the caller. Set is_complete to true once both the \
incident type and the location are known, or when the caller has already answered several \
questions.";

const HOLD_PROMPT: &str = "You are an emergency dispatcher keeping a caller calm while help \
is on the way. Reply with one short reassuring sentence. Do not ask new questions.";

/// Structured outcome of one interpretation step.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IntakeDecision {
    #[serde(default, rename = "incident_type")]
    pub incident_category: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub priority: Option<u8>,
    /// What the dispatcher says next. Required: a decision without a reply
    /// is useless to the flow.
    #[serde(alias = "dispatcher_response")]
    pub response_text: String,
    #[serde(default)]
    pub is_complete: bool,
}

/// Chat-completions client for intake decisions and hold-loop replies.
pub struct Interpreter {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f64,
}

impl Interpreter {
    pub fn new(config: &InterpreterConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            api_key: config.api_key(),
            model: config.model.clone(),
            temperature: config.temperature,
        }
    }

    /// Inject an API key directly (overrides the environment lookup).
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Interpret the conversation so far into an [`IntakeDecision`].
    pub async fn interpret(&self, transcript: &str, questions_asked: u32) -> Result<IntakeDecision> {
        let user = format!(
            "Questions asked so far: {questions_asked}\n\nConversation transcript:\n{transcript}"
        );
        let content = self.complete(DECISION_PROMPT, &user).await?;
        let cleaned = strip_fences(&content);
        serde_json::from_str(cleaned)
            .map_err(|e| SirenError::DecisionParse(format!("{e}: {cleaned}")))
    }

    /// One reassuring sentence for the hold loop.
    pub async fn hold_response(&self, transcript: &str) -> Result<String> {
        let content = self.complete(HOLD_PROMPT, transcript).await?;
        let line = content.trim();
        if line.is_empty() {
            return Err(SirenError::Service("empty hold response".to_owned()));
        }
        Ok(line.to_owned())
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| SirenError::Config("interpreter API key is not set".to_owned()))?;

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "temperature": self.temperature,
        });

        let response = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| SirenError::Service(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SirenError::Service(format!(
                "interpreter returned {}",
                response.status()
            )));
        }

        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| SirenError::Service(e.to_string()))?;
        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| SirenError::DecisionParse("completion had no choices".to_owned()))
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

/// Strip a markdown code fence if the model wrapped its JSON in one.
fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix("```").unwrap_or(trimmed);
    trimmed.trim()
}
