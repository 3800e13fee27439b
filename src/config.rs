//! Configuration types for the call-intake service.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for the intake service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SirenConfig {
    /// HTTP/WebSocket listener settings.
    pub server: ServerConfig,
    /// Telephony provider REST settings (call recording).
    pub telephony: TelephonyConfig,
    /// Streaming speech service settings.
    pub speech: SpeechConfig,
    /// Silence-based turn taking (manual voice-activity detection).
    pub turns: TurnsConfig,
    /// Dispatch-readiness thresholds and keyword tables.
    pub dispatch: DispatchConfig,
    /// Non-streaming interpreter settings (fallback IVR path).
    pub interpreter: InterpreterConfig,
    /// Voice synthesis settings (fallback IVR path).
    pub synthesis: SynthesisConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address the gateway binds to.
    pub bind_addr: String,
    /// Externally reachable host (no scheme), used to build the media
    /// stream URL and audio playback URLs handed to the telephony provider.
    pub public_host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_owned(),
            public_host: "localhost:8080".to_owned(),
        }
    }
}

/// Telephony provider REST configuration.
///
/// Only used to start call recording; the media stream itself arrives on
/// the gateway's WebSocket endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelephonyConfig {
    /// Whether inbound calls are recorded.
    pub record_calls: bool,
    /// Provider REST base URL.
    pub api_base: String,
    /// Environment variable holding the provider account identifier.
    pub account_sid_env: String,
    /// Environment variable holding the provider auth token.
    pub auth_token_env: String,
}

impl Default for TelephonyConfig {
    fn default() -> Self {
        Self {
            record_calls: false,
            api_base: "https://api.twilio.com".to_owned(),
            account_sid_env: "TWILIO_ACCOUNT_SID".to_owned(),
            auth_token_env: "TWILIO_AUTH_TOKEN".to_owned(),
        }
    }
}

impl TelephonyConfig {
    /// Resolve provider REST credentials from the environment.
    pub fn credentials(&self) -> Option<(String, String)> {
        let sid = std::env::var(&self.account_sid_env)
            .ok()
            .filter(|v| !v.is_empty())?;
        let token = std::env::var(&self.auth_token_env)
            .ok()
            .filter(|v| !v.is_empty())?;
        Some((sid, token))
    }
}

/// Turn-detection mode negotiated with the speech service.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnDetectionMode {
    /// The service detects end of speech itself.
    #[default]
    ServerVad,
    /// Service detection disabled; the orchestrator commits the input
    /// buffer after a silence timeout (see [`TurnsConfig`]).
    Manual,
}

/// Streaming speech service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// WebSocket endpoint of the realtime speech service.
    pub url: String,
    /// Realtime model identifier, appended to the URL as `?model=`.
    pub model: String,
    /// Environment variable holding the service API key.
    ///
    /// When the variable is unset the streaming path is considered
    /// unconfigured and inbound calls take the fallback IVR flow.
    pub api_key_env: String,
    /// Synthesized voice name.
    pub voice: String,
    /// Standing instructions for the agent persona.
    pub instructions: String,
    /// One-shot instruction that makes the agent speak first.
    pub greeting_instruction: String,
    /// Line spoken once dispatch readiness is reached.
    pub closing_line: String,
    /// Turn-detection mode requested at session negotiation.
    pub turn_detection: TurnDetectionMode,
    /// Sampling temperature.
    pub temperature: f32,
    /// Cap on tokens per response turn. Keeps spoken replies short.
    pub max_response_tokens: u32,
    /// Seconds allowed for the WebSocket handshake before the streaming
    /// path is declared failed.
    pub handshake_timeout_secs: u64,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            url: "wss://api.openai.com/v1/realtime".to_owned(),
            model: "gpt-4o-realtime-preview-2024-10-01".to_owned(),
            api_key_env: "OPENAI_API_KEY".to_owned(),
            voice: "alloy".to_owned(),
            instructions: "You are a calm, professional emergency dispatch operator. \
                           Find out the caller's location and the nature of the emergency. \
                           Ask one question at a time and keep every reply under two short sentences."
                .to_owned(),
            greeting_instruction: "Greet the caller and ask what their emergency is."
                .to_owned(),
            closing_line: "Okay, help is on the way. Please stay calm and stay on the line."
                .to_owned(),
            turn_detection: TurnDetectionMode::ServerVad,
            temperature: 0.7,
            max_response_tokens: 150,
            handshake_timeout_secs: 10,
        }
    }
}

impl SpeechConfig {
    /// Resolve the API key from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
    }

    /// Whether the streaming path can be used at all.
    pub fn is_configured(&self) -> bool {
        self.api_key().is_some()
    }
}

/// Silence-based turn taking, used when [`TurnDetectionMode::Manual`]
/// is negotiated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnsConfig {
    /// Polling interval for the silence check, in ms.
    pub poll_interval_ms: u64,
    /// Silence duration after the last audio chunk that ends a caller
    /// turn, in ms. Lower values respond faster but cut slow speakers off.
    pub silence_threshold_ms: u64,
}

impl Default for TurnsConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            silence_threshold_ms: 1500,
        }
    }
}

/// One incident keyword and the category it fixes for the call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentTerm {
    /// Lowercase substring matched against caller utterances.
    pub term: String,
    /// Category recorded when the term matches.
    pub category: String,
}

impl IncidentTerm {
    fn new(term: &str, category: &str) -> Self {
        Self {
            term: term.to_owned(),
            category: category.to_owned(),
        }
    }
}

/// Dispatch-readiness thresholds and fact-extraction keyword tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Turn count at which a call with both facts becomes dispatch-ready.
    pub min_turns: u32,
    /// Hard ceiling: dispatch regardless of extracted facts.
    pub max_turns: u32,
    /// Substrings that indicate the utterance names a location.
    pub location_terms: Vec<String>,
    /// Ordered incident table; the first matching term fixes the category.
    pub incident_terms: Vec<IncidentTerm>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            min_turns: 4,
            max_turns: 6,
            location_terms: vec![
                "street".to_owned(),
                "avenue".to_owned(),
                "road".to_owned(),
                "address".to_owned(),
                // Trailing space on purpose: matches "at 5th and Main".
                "at ".to_owned(),
            ],
            incident_terms: vec![
                IncidentTerm::new("fire", "Fire"),
                IncidentTerm::new("medical", "Medical"),
                IncidentTerm::new("police", "Police"),
                IncidentTerm::new("accident", "Accident"),
                IncidentTerm::new("emergency", "Emergency"),
            ],
        }
    }
}

/// Non-streaming interpreter configuration (fallback IVR path).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    /// Chat-completions base URL (no trailing slash).
    pub base_url: String,
    /// Model identifier.
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Sampling temperature. Kept low so the JSON contract holds.
    pub temperature: f64,
    /// Number of answered questions after which a failed interpretation
    /// forces completion instead of asking again.
    pub forced_completion_after: u32,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_owned(),
            model: "gpt-4o-mini".to_owned(),
            api_key_env: "OPENAI_API_KEY".to_owned(),
            temperature: 0.3,
            forced_completion_after: 2,
        }
    }
}

impl InterpreterConfig {
    /// Resolve the API key from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
    }
}

/// Voice synthesis configuration (fallback IVR path).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Synthesis service base URL (no trailing slash).
    pub base_url: String,
    /// Environment variable holding the API key.
    ///
    /// Unset means synthesis is disabled and IVR prompts fall back to the
    /// telephony provider's built-in voice.
    pub api_key_env: String,
    /// Voice identifier.
    pub voice_id: String,
    /// Synthesis model identifier.
    pub model_id: String,
    /// Directory for content-addressed synthesized audio files.
    pub cache_dir: PathBuf,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.elevenlabs.io".to_owned(),
            api_key_env: "ELEVENLABS_API_KEY".to_owned(),
            voice_id: "21m00Tcm4TlvDq8ikWAM".to_owned(),
            model_id: "eleven_turbo_v2".to_owned(),
            cache_dir: default_audio_cache_dir(),
        }
    }
}

impl SynthesisConfig {
    /// Resolve the API key from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
    }
}

/// Application cache directory.
///
/// Resolves to `dirs::cache_dir()/siren/` by default. Override with the
/// `SIREN_CACHE_DIR` environment variable.
fn cache_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("SIREN_CACHE_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::cache_dir()
        .map(|d| d.join("siren"))
        .unwrap_or_else(|| PathBuf::from("/tmp/siren-cache"))
}

/// Synthesized audio cache (`cache_dir()/audio/`).
fn default_audio_cache_dir() -> PathBuf {
    cache_dir().join("audio")
}

/// Application config directory.
///
/// Resolves to `dirs::config_dir()/siren/` by default. Override with the
/// `SIREN_CONFIG_DIR` environment variable.
fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("SIREN_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("siren"))
        .unwrap_or_else(|| PathBuf::from("/tmp/siren-config"))
}

impl SirenConfig {
    /// Load configuration from a TOML file, falling back to defaults for
    /// missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::SirenError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot
    /// be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::SirenError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Main config file path (`config_dir()/config.toml`).
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        config_dir().join("config.toml")
    }
}
