//! Call-control documents for the telephony provider.
//!
//! A small subset of the provider's XML vocabulary: speak, play, gather
//! speech, open a media stream, redirect, pause, hang up. Hand-rolled
//! string building with explicit escaping; the documents are flat enough
//! that a full XML library would be more code than this.

/// Spoken or played prompt nested inside a `<Gather>`.
#[derive(Debug, Clone)]
pub enum Prompt {
    /// Provider-voiced text.
    Say(String),
    /// Pre-synthesized audio by URL.
    Play(String),
}

impl Prompt {
    fn render(&self, out: &mut String) {
        match self {
            Prompt::Say(text) => {
                out.push_str("<Say>");
                out.push_str(&escape_text(text));
                out.push_str("</Say>");
            }
            Prompt::Play(url) => {
                out.push_str("<Play>");
                out.push_str(&escape_text(url));
                out.push_str("</Play>");
            }
        }
    }
}

#[derive(Debug, Clone)]
enum Verb {
    Prompt(Prompt),
    Pause(u32),
    Gather { action: String, prompt: Prompt },
    ConnectStream { url: String },
    Redirect(String),
    Hangup,
}

/// One `<Response>` document, built verb by verb.
#[derive(Debug, Clone, Default)]
pub struct VoiceDocument {
    verbs: Vec<Verb>,
}

impl VoiceDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Speak `text` with the provider's built-in voice.
    pub fn say(mut self, text: impl Into<String>) -> Self {
        self.verbs.push(Verb::Prompt(Prompt::Say(text.into())));
        self
    }

    /// Play pre-synthesized audio.
    pub fn play(mut self, url: impl Into<String>) -> Self {
        self.verbs.push(Verb::Prompt(Prompt::Play(url.into())));
        self
    }

    /// Silence for `seconds`.
    pub fn pause(mut self, seconds: u32) -> Self {
        self.verbs.push(Verb::Pause(seconds));
        self
    }

    /// Prompt the caller, collect speech, POST the result to `action`.
    pub fn gather_speech(mut self, action: impl Into<String>, prompt: Prompt) -> Self {
        self.verbs.push(Verb::Gather {
            action: action.into(),
            prompt,
        });
        self
    }

    /// Open a bidirectional media stream to `url`.
    pub fn connect_stream(mut self, url: impl Into<String>) -> Self {
        self.verbs.push(Verb::ConnectStream { url: url.into() });
        self
    }

    /// Continue the call at another webhook.
    pub fn redirect(mut self, url: impl Into<String>) -> Self {
        self.verbs.push(Verb::Redirect(url.into()));
        self
    }

    /// End the call.
    pub fn hangup(mut self) -> Self {
        self.verbs.push(Verb::Hangup);
        self
    }

    /// Render the full document.
    pub fn render(&self) -> String {
        let mut out = String::from(r#"<?xml version="1.0" encoding="UTF-8"?><Response>"#);
        for verb in &self.verbs {
            match verb {
                Verb::Prompt(prompt) => prompt.render(&mut out),
                Verb::Pause(seconds) => {
                    out.push_str(&format!(r#"<Pause length="{seconds}"/>"#));
                }
                Verb::Gather { action, prompt } => {
                    out.push_str(&format!(
                        r#"<Gather input="speech" action="{}" method="POST" speechTimeout="auto">"#,
                        escape_attr(action)
                    ));
                    prompt.render(&mut out);
                    out.push_str("</Gather>");
                }
                Verb::ConnectStream { url } => {
                    out.push_str(&format!(
                        r#"<Connect><Stream url="{}"/></Connect>"#,
                        escape_attr(url)
                    ));
                }
                Verb::Redirect(url) => {
                    out.push_str(r#"<Redirect method="POST">"#);
                    out.push_str(&escape_text(url));
                    out.push_str("</Redirect>");
                }
                Verb::Hangup => out.push_str("<Hangup/>"),
            }
        }
        out.push_str("</Response>");
        out
    }
}

fn escape_text(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

fn escape_attr(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
