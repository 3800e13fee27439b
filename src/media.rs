//! Telephony media stream frame codec.
//!
//! The provider sends JSON control frames over the media WebSocket:
//! `connected`, then `start` (carrying the call and stream identifiers),
//! then a stream of `media` frames with base64 audio payloads, then `stop`.
//! Outbound audio is a `media` frame that must echo the stream identifier
//! received in `start`. A single undecodable frame is dropped by the
//! caller; it never terminates the relay.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;

use crate::error::{Result, SirenError};

/// Decoded inbound control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Provider connected; the stream is not open yet.
    Connected,
    /// Media stream opened. Outbound audio is possible from here on.
    Start { call_id: String, stream_id: String },
    /// One audio chunk (8 kHz companded, base64 already removed).
    Media { payload: Vec<u8> },
    /// Stream closed by the provider.
    Stop,
    /// Well-formed frame with an event this relay does not act on
    /// (e.g. `mark`). Skipped without logging noise.
    Ignored,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum WireFrame {
    Connected,
    Start { start: StartFields },
    Media { media: MediaFields },
    Stop,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StartFields {
    #[serde(rename = "callSid")]
    call_sid: String,
    #[serde(rename = "streamSid")]
    stream_sid: String,
}

#[derive(Debug, Deserialize)]
struct MediaFields {
    payload: String,
}

/// Decode one inbound frame.
///
/// Unknown event types decode to [`InboundFrame::Ignored`]. Invalid JSON,
/// missing fields for a known event, or an undecodable audio payload fail
/// with [`SirenError::MalformedFrame`].
pub fn decode_frame(text: &str) -> Result<InboundFrame> {
    let wire: WireFrame =
        serde_json::from_str(text).map_err(|e| SirenError::MalformedFrame(e.to_string()))?;
    match wire {
        WireFrame::Connected => Ok(InboundFrame::Connected),
        WireFrame::Start { start } => Ok(InboundFrame::Start {
            call_id: start.call_sid,
            stream_id: start.stream_sid,
        }),
        WireFrame::Media { media } => {
            let payload = BASE64
                .decode(media.payload.as_bytes())
                .map_err(|e| SirenError::MalformedFrame(format!("bad audio payload: {e}")))?;
            Ok(InboundFrame::Media { payload })
        }
        WireFrame::Stop => Ok(InboundFrame::Stop),
        WireFrame::Other => Ok(InboundFrame::Ignored),
    }
}

/// Encode one outbound audio frame tagged with the stream identifier.
///
/// The caller must hold a stream id from a prior `start`; audio before
/// `start` has nowhere to go and is a protocol violation.
pub fn outbound_media(stream_id: &str, audio: &[u8]) -> String {
    serde_json::json!({
        "event": "media",
        "streamSid": stream_id,
        "media": { "payload": BASE64.encode(audio) },
    })
    .to_string()
}
