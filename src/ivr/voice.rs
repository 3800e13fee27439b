//! Voice synthesis for IVR prompts, cached by content hash.
//!
//! Every distinct prompt is synthesized once and written to the cache
//! directory as `{blake3(text)}.mp3`; repeat prompts (greetings, canned
//! questions) play from cache without touching the synthesis service.
//! Callers treat any failure here as "use the provider's built-in voice
//! instead", so nothing in this module is fatal to a call.

use std::path::PathBuf;

use bytes::Bytes;

use crate::config::SynthesisConfig;
use crate::error::{Result, SirenError};

/// Hex content hash used as the cache file stem.
pub fn content_hash(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

/// Text-to-speech client with a content-addressed file cache.
pub struct Synthesizer {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    voice_id: String,
    model_id: String,
    cache_dir: PathBuf,
}

impl Synthesizer {
    pub fn new(config: &SynthesisConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            api_key: config.api_key(),
            voice_id: config.voice_id.clone(),
            model_id: config.model_id.clone(),
            cache_dir: config.cache_dir.clone(),
        }
    }

    /// Inject an API key directly (overrides the environment lookup).
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Whether synthesis can be attempted at all.
    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    /// Synthesize `text` and return its public playback path
    /// (`/audio/{hash}.mp3`).
    ///
    /// Cache hits return immediately and need no API key.
    pub async fn synthesize(&self, text: &str) -> Result<String> {
        let file_name = format!("{}.mp3", content_hash(text));
        let path = self.cache_dir.join(&file_name);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(format!("/audio/{file_name}"));
        }

        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| SirenError::Config("synthesis API key is not set".to_owned()))?;

        let response = self
            .http
            .post(format!(
                "{}/v1/text-to-speech/{}",
                self.base_url, self.voice_id
            ))
            .header("xi-api-key", api_key)
            .json(&serde_json::json!({
                "text": text,
                "model_id": self.model_id,
                "voice_settings": {"stability": 0.5, "similarity_boost": 0.75},
            }))
            .send()
            .await
            .map_err(|e| SirenError::Synthesis(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SirenError::Synthesis(format!(
                "synthesis service returned {}",
                response.status()
            )));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| SirenError::Synthesis(e.to_string()))?;

        tokio::fs::create_dir_all(&self.cache_dir).await?;
        tokio::fs::write(&path, &audio).await?;
        tracing::debug!(file = %file_name, bytes = audio.len(), "cached synthesized prompt");
        Ok(format!("/audio/{file_name}"))
    }

    /// Read a cached file by bare name, for the `/audio/{file}` route.
    ///
    /// Returns `None` for unknown names. Names with path separators or
    /// parent references are rejected outright.
    pub async fn read_cached(&self, file_name: &str) -> Result<Option<Bytes>> {
        if !is_safe_name(file_name) {
            return Ok(None);
        }
        let path = self.cache_dir.join(file_name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SirenError::Io(e)),
        }
    }
}

fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
}
