//! Wire vocabulary for the realtime speech service.
//!
//! One outbound enum ([`ClientEvent`]) and one inbound enum
//! ([`ServerEvent`]), both tagged by the service's dotted `type` field.
//! Inbound events the relay does not act on fall into
//! [`ServerEvent::Other`] and are skipped.

use serde::{Deserialize, Serialize};

use crate::config::{SpeechConfig, TurnDetectionMode};

/// Messages sent to the speech service.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Session negotiation: codecs, voice, instructions, turn detection.
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionParams },
    /// Append one base64 audio chunk to the service input buffer.
    #[serde(rename = "input_audio_buffer.append")]
    AppendAudio { audio: String },
    /// Close the input buffer; the committed audio becomes the caller turn.
    #[serde(rename = "input_audio_buffer.commit")]
    CommitAudio,
    /// Inject a conversation item (used for the synthetic greeting).
    #[serde(rename = "conversation.item.create")]
    CreateItem { item: ConversationItem },
    /// Request a response turn, optionally overriding instructions.
    #[serde(rename = "response.create")]
    CreateResponse {
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<ResponseDirectives>,
    },
}

/// Negotiated session parameters.
///
/// Audio format matches the telephony stream bit-for-bit (`g711_ulaw`,
/// 8 kHz); no transcoding happens anywhere in the relay.
#[derive(Debug, Clone, Serialize)]
pub struct SessionParams {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub input_audio_transcription: TranscriptionParams,
    /// `None` serializes as JSON `null`, which turns service-side
    /// end-of-speech detection off (manual mode).
    pub turn_detection: Option<TurnDetection>,
    pub temperature: f32,
    pub max_response_output_tokens: u32,
}

impl SessionParams {
    pub fn from_config(config: &SpeechConfig) -> Self {
        Self {
            modalities: vec!["text".to_owned(), "audio".to_owned()],
            instructions: config.instructions.clone(),
            voice: config.voice.clone(),
            input_audio_format: "g711_ulaw".to_owned(),
            output_audio_format: "g711_ulaw".to_owned(),
            input_audio_transcription: TranscriptionParams {
                model: "whisper-1".to_owned(),
            },
            turn_detection: match config.turn_detection {
                TurnDetectionMode::ServerVad => Some(TurnDetection::server_vad()),
                TurnDetectionMode::Manual => None,
            },
            temperature: config.temperature,
            max_response_output_tokens: config.max_response_tokens,
        }
    }
}

/// Caller-audio transcription settings.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptionParams {
    pub model: String,
}

/// Service-side voice-activity detection settings.
#[derive(Debug, Clone, Serialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl TurnDetection {
    pub fn server_vad() -> Self {
        Self {
            kind: "server_vad".to_owned(),
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
        }
    }
}

/// One injected conversation item.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub role: String,
    pub content: Vec<ContentPart>,
}

impl ConversationItem {
    /// A user-text item, as used for the synthetic greeting instruction.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            kind: "message".to_owned(),
            role: "user".to_owned(),
            content: vec![ContentPart {
                kind: "input_text".to_owned(),
                text: text.into(),
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

/// Per-response instruction override.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseDirectives {
    pub instructions: String,
}

/// Messages received from the speech service.
///
/// Variants with payloads the relay ignores are empty-struct variants so
/// extra fields never fail decoding.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated {},
    #[serde(rename = "session.updated")]
    SessionUpdated {},
    /// One base64 chunk of synthesized response audio.
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },
    /// Incremental agent transcript. Informational only.
    #[serde(rename = "response.audio_transcript.delta")]
    TranscriptDelta { delta: String },
    /// Final transcript of the agent's spoken response.
    #[serde(rename = "response.audio_transcript.done")]
    TranscriptDone { transcript: String },
    /// Final transcription of the caller's committed audio.
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted { transcript: String },
    #[serde(rename = "response.done")]
    ResponseDone {},
    #[serde(rename = "error")]
    ErrorEvent { error: ErrorDetail },
    /// Anything else in the service vocabulary; skipped.
    #[serde(other)]
    Other,
}

/// Error payload of a service `error` event.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub message: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}
