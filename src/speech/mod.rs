//! Streaming speech service client.
//!
//! One [`SpeechChannel`] per call: it owns the WebSocket session, accepts
//! fire-and-forget audio appends, enforces the one-response-in-flight
//! rule, and translates the service's event vocabulary into
//! [`SpeechEvent`]s for the orchestrator. There is no mid-call
//! reconnection: once the session drops, the streaming path is over and
//! the call is handed off with whatever was gathered.

pub mod protocol;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::SpeechConfig;
use crate::error::{Result, SirenError};
use protocol::{ClientEvent, ConversationItem, ResponseDirectives, ServerEvent, SessionParams};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Typed events surfaced to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum SpeechEvent {
    /// Session negotiation acknowledged; the agent may speak.
    SessionReady,
    /// Final transcription of a committed caller turn.
    TranscriptFinal(String),
    /// Final transcript of the agent's spoken response.
    AgentTranscript(String),
    /// One chunk of synthesized response audio (companded, 8 kHz).
    AudioChunk(Vec<u8>),
    /// The current response turn finished.
    ResponseComplete,
    /// Service-reported error. Non-fatal; the session continues.
    ServiceError(String),
}

/// Live connection to the speech service for one call.
///
/// Dropping the channel cancels the session task, so a call's exit always
/// releases the socket even on early-error paths.
pub struct SpeechChannel {
    outbound: mpsc::UnboundedSender<String>,
    response_in_flight: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl SpeechChannel {
    /// Connect and negotiate a session.
    ///
    /// The WebSocket handshake is bounded by `handshake_timeout_secs`;
    /// elapsing it yields [`SirenError::HandshakeTimeout`], any other
    /// failure [`SirenError::Connection`]. Both are fatal to the streaming
    /// path only. On success the `session.update` negotiation message has
    /// been sent and the returned receiver yields events until the
    /// connection closes.
    pub async fn open(
        config: &SpeechConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SpeechEvent>)> {
        let api_key = config
            .api_key()
            .ok_or_else(|| SirenError::Config(format!("{} is not set", config.api_key_env)))?;
        Self::open_with_key(config, &api_key).await
    }

    /// Connect with an explicit key, bypassing the environment lookup.
    pub async fn open_with_key(
        config: &SpeechConfig,
        api_key: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SpeechEvent>)> {
        let mut endpoint = Url::parse(&config.url)
            .map_err(|e| SirenError::Config(format!("bad speech url: {e}")))?;
        endpoint
            .query_pairs_mut()
            .append_pair("model", &config.model);

        let mut request = endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| SirenError::Connection(e.to_string()))?;
        let auth = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|e| SirenError::Connection(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, auth);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let timeout = Duration::from_secs(config.handshake_timeout_secs);
        let (ws_stream, _) = match tokio::time::timeout(timeout, connect_async(request)).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => return Err(SirenError::Connection(e.to_string())),
            Err(_) => return Err(SirenError::HandshakeTimeout(config.handshake_timeout_secs)),
        };
        let (mut write, read) = ws_stream.split();

        let session = ClientEvent::SessionUpdate {
            session: SessionParams::from_config(config),
        };
        let json =
            serde_json::to_string(&session).map_err(|e| SirenError::Connection(e.to_string()))?;
        write
            .send(Message::Text(json))
            .await
            .map_err(|e| SirenError::Connection(e.to_string()))?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let response_in_flight = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        tokio::spawn(run_session(
            write,
            read,
            outbound_rx,
            event_tx,
            Arc::clone(&response_in_flight),
            cancel.clone(),
        ));

        Ok((
            Self {
                outbound: outbound_tx,
                response_in_flight,
                cancel,
            },
            event_rx,
        ))
    }

    /// Append one inbound audio chunk to the service input buffer.
    ///
    /// Fire-and-forget: after the session has closed, in-flight audio from
    /// the telephony side is expected and harmless, so the chunk is
    /// dropped with a debug log instead of raising.
    pub fn send_audio(&self, chunk: &[u8]) {
        let event = ClientEvent::AppendAudio {
            audio: BASE64.encode(chunk),
        };
        if !self.send_event(&event) {
            tracing::debug!("speech session closed; dropping audio chunk");
        }
    }

    /// Close the input buffer and request a response turn.
    ///
    /// At most one response may be outstanding per call: a second request
    /// before `ResponseComplete` is a protocol violation and is dropped
    /// with a warning rather than forwarded.
    pub fn commit_and_respond(&self) {
        if self.response_in_flight.swap(true, Ordering::SeqCst) {
            tracing::warn!("response already in flight; dropping duplicate commit");
            return;
        }
        self.send_event(&ClientEvent::CommitAudio);
        self.send_event(&ClientEvent::CreateResponse { response: None });
    }

    /// Inject a user-text item and request a response (the synthetic
    /// greeting that makes the agent speak first).
    pub fn instruct(&self, text: &str) {
        if self.response_in_flight.swap(true, Ordering::SeqCst) {
            tracing::warn!("response already in flight; dropping instruction");
            return;
        }
        self.send_event(&ClientEvent::CreateItem {
            item: ConversationItem::user_text(text),
        });
        self.send_event(&ClientEvent::CreateResponse { response: None });
    }

    /// Request a response with a one-shot instruction override (the
    /// closing line once dispatch readiness is reached).
    pub fn say(&self, instructions: &str) {
        if self.response_in_flight.swap(true, Ordering::SeqCst) {
            tracing::warn!("response already in flight; dropping spoken line");
            return;
        }
        self.send_event(&ClientEvent::CreateResponse {
            response: Some(ResponseDirectives {
                instructions: instructions.to_owned(),
            }),
        });
    }

    /// Whether a response turn is currently outstanding.
    pub fn response_in_flight(&self) -> bool {
        self.response_in_flight.load(Ordering::SeqCst)
    }

    /// Tear the session down: the background task sends a close frame and
    /// exits.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    fn send_event(&self, event: &ClientEvent) -> bool {
        match serde_json::to_string(event) {
            Ok(json) => self.outbound.send(json).is_ok(),
            Err(e) => {
                tracing::warn!("failed to serialize client event: {e}");
                false
            }
        }
    }
}

impl Drop for SpeechChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Map a service event onto the orchestrator vocabulary.
///
/// Returns `None` for events the relay does not act on (incremental
/// transcript deltas, acknowledgements, unknown types).
fn map_server_event(event: ServerEvent) -> Option<SpeechEvent> {
    match event {
        ServerEvent::SessionCreated {} => {
            tracing::debug!("speech session created");
            None
        }
        ServerEvent::SessionUpdated {} => Some(SpeechEvent::SessionReady),
        ServerEvent::AudioDelta { delta } => match BASE64.decode(delta.as_bytes()) {
            Ok(bytes) => Some(SpeechEvent::AudioChunk(bytes)),
            Err(e) => {
                tracing::warn!("undecodable response audio chunk: {e}");
                None
            }
        },
        ServerEvent::TranscriptDelta { .. } => None,
        ServerEvent::TranscriptDone { transcript } => Some(SpeechEvent::AgentTranscript(transcript)),
        ServerEvent::InputTranscriptionCompleted { transcript } => {
            Some(SpeechEvent::TranscriptFinal(transcript))
        }
        ServerEvent::ResponseDone {} => Some(SpeechEvent::ResponseComplete),
        ServerEvent::ErrorEvent { error } => Some(SpeechEvent::ServiceError(error.message)),
        ServerEvent::Other => None,
    }
}

async fn run_session(
    mut write: SplitSink<WsStream, Message>,
    mut read: SplitStream<WsStream>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    event_tx: mpsc::UnboundedSender<SpeechEvent>,
    response_in_flight: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerEvent>(&text) {
                            Ok(event) => {
                                // A completed or errored response is no longer
                                // outstanding; either way the next commit may
                                // proceed.
                                if matches!(
                                    event,
                                    ServerEvent::ResponseDone {} | ServerEvent::ErrorEvent { .. }
                                ) {
                                    response_in_flight.store(false, Ordering::SeqCst);
                                }
                                if let Some(mapped) = map_server_event(event)
                                    && event_tx.send(mapped).is_err()
                                {
                                    // Consumer gone; the call is over.
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::debug!("skipping unparseable speech event: {e}");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("speech service closed the session");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!("speech session read error: {e}");
                        break;
                    }
                    _ => {} // Binary, Ping/Pong frames handled by tungstenite.
                }
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(json) => {
                        if let Err(e) = write.send(Message::Text(json)).await {
                            tracing::warn!("speech session send error: {e}");
                            break;
                        }
                    }
                    // All channel handles dropped.
                    None => break,
                }
            }
        }
    }
}
