//! Speech channel session tests against a scripted local WebSocket
//! service.
//!
//! Exercise the real session task end to end: negotiation payload on
//! connect, server-event mapping into the typed stream, and the
//! one-response-in-flight rule over the wire.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use siren::config::{SpeechConfig, TurnDetectionMode};
use siren::speech::{SpeechChannel, SpeechEvent};

/// One-connection scripted speech service.
///
/// Records every client message and, once the session negotiation
/// message arrives, replies with the scripted server events in order.
struct MockSpeechService {
    url: String,
    received: Arc<Mutex<Vec<Value>>>,
}

impl MockSpeechService {
    fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    fn count_of(&self, event_type: &str) -> usize {
        self.received()
            .iter()
            .filter(|v| v["type"] == event_type)
            .count()
    }
}

async fn start_service(script: Vec<Value>) -> MockSpeechService {
    start_service_with_commit_reply(script, Vec::new()).await
}

/// Variant that holds a second batch back until the first buffer commit
/// arrives, so tests can order server events after a client action.
async fn start_service_with_commit_reply(
    on_update: Vec<Value>,
    on_commit: Vec<Value>,
) -> MockSpeechService {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let log = received.clone();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (mut tx, mut rx) = ws.split();
        let mut on_update = Some(on_update);
        let mut on_commit = Some(on_commit);
        while let Some(Ok(message)) = rx.next().await {
            match message {
                Message::Text(text) => {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    let kind = value["type"].as_str().unwrap_or_default().to_owned();
                    log.lock().unwrap().push(value);
                    let batch = match kind.as_str() {
                        "session.update" => on_update.take(),
                        "input_audio_buffer.commit" => on_commit.take(),
                        _ => None,
                    };
                    for line in batch.into_iter().flatten() {
                        tx.send(Message::Text(line.to_string())).await.unwrap();
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    MockSpeechService {
        url: format!("ws://{addr}"),
        received,
    }
}

fn config_for(url: &str, mode: TurnDetectionMode) -> SpeechConfig {
    SpeechConfig {
        url: url.to_owned(),
        turn_detection: mode,
        handshake_timeout_secs: 5,
        ..SpeechConfig::default()
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<SpeechEvent>) -> SpeechEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for speech event")
        .expect("event stream ended")
}

fn session_updated() -> Value {
    json!({ "type": "session.updated", "session": {} })
}

#[tokio::test]
async fn negotiation_disables_server_detection_in_manual_mode() {
    let service = start_service(vec![session_updated()]).await;
    let config = config_for(&service.url, TurnDetectionMode::Manual);
    let (channel, mut events) = SpeechChannel::open_with_key(&config, "test-key")
        .await
        .unwrap();

    assert_eq!(next_event(&mut events).await, SpeechEvent::SessionReady);

    let received = service.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0]["type"], "session.update");
    let session = &received[0]["session"];
    assert_eq!(session["input_audio_format"], "g711_ulaw");
    assert_eq!(session["output_audio_format"], "g711_ulaw");
    // Disabled detection is an explicit null, not an absent key.
    assert!(session.get("turn_detection").is_some());
    assert!(session["turn_detection"].is_null());

    channel.close();
}

#[tokio::test]
async fn negotiation_requests_server_vad_by_default() {
    let service = start_service(vec![session_updated()]).await;
    let config = config_for(&service.url, TurnDetectionMode::ServerVad);
    let (channel, mut events) = SpeechChannel::open_with_key(&config, "test-key")
        .await
        .unwrap();

    assert_eq!(next_event(&mut events).await, SpeechEvent::SessionReady);

    let received = service.received();
    assert_eq!(received[0]["session"]["turn_detection"]["type"], "server_vad");

    channel.close();
}

#[tokio::test]
async fn server_events_map_onto_the_typed_stream_in_order() {
    let service = start_service(vec![
        json!({ "type": "session.created", "session": {} }),
        session_updated(),
        json!({ "type": "response.audio.delta", "delta": BASE64.encode([1u8, 2, 3]) }),
        json!({ "type": "response.audio_transcript.delta", "delta": "Whe" }),
        json!({ "type": "response.audio_transcript.done", "transcript": "Where are you?" }),
        json!({
            "type": "conversation.item.input_audio_transcription.completed",
            "transcript": "there's a fire on Oak Street"
        }),
        json!({ "type": "response.done", "response": { "status": "completed" } }),
        json!({ "type": "error", "error": { "type": "server_error", "message": "hiccup" } }),
    ])
    .await;

    let config = config_for(&service.url, TurnDetectionMode::ServerVad);
    let (channel, mut events) = SpeechChannel::open_with_key(&config, "test-key")
        .await
        .unwrap();

    assert_eq!(next_event(&mut events).await, SpeechEvent::SessionReady);
    assert_eq!(
        next_event(&mut events).await,
        SpeechEvent::AudioChunk(vec![1, 2, 3])
    );
    assert_eq!(
        next_event(&mut events).await,
        SpeechEvent::AgentTranscript("Where are you?".to_owned())
    );
    assert_eq!(
        next_event(&mut events).await,
        SpeechEvent::TranscriptFinal("there's a fire on Oak Street".to_owned())
    );
    assert_eq!(next_event(&mut events).await, SpeechEvent::ResponseComplete);
    assert_eq!(
        next_event(&mut events).await,
        SpeechEvent::ServiceError("hiccup".to_owned())
    );

    channel.close();
}

#[tokio::test]
async fn duplicate_commit_is_dropped_while_response_is_in_flight() {
    let service = start_service(vec![session_updated()]).await;
    let config = config_for(&service.url, TurnDetectionMode::Manual);
    let (channel, mut events) = SpeechChannel::open_with_key(&config, "test-key")
        .await
        .unwrap();
    assert_eq!(next_event(&mut events).await, SpeechEvent::SessionReady);

    channel.commit_and_respond();
    channel.commit_and_respond();
    assert!(channel.response_in_flight());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(service.count_of("input_audio_buffer.commit"), 1);
    assert_eq!(service.count_of("response.create"), 1);

    channel.close();
}

#[tokio::test]
async fn service_error_releases_the_turn_guard() {
    // A failed turn can end in an error event with no response.done; the
    // guard must open again or the session would never take another turn.
    let service = start_service_with_commit_reply(
        vec![session_updated()],
        vec![json!({
            "type": "error",
            "error": { "type": "invalid_request_error", "message": "input buffer too small" }
        })],
    )
    .await;
    let config = config_for(&service.url, TurnDetectionMode::Manual);
    let (channel, mut events) = SpeechChannel::open_with_key(&config, "test-key")
        .await
        .unwrap();
    assert_eq!(next_event(&mut events).await, SpeechEvent::SessionReady);

    channel.commit_and_respond();
    assert!(channel.response_in_flight());

    assert_eq!(
        next_event(&mut events).await,
        SpeechEvent::ServiceError("input buffer too small".to_owned())
    );
    assert!(!channel.response_in_flight());

    // The next turn is accepted.
    channel.commit_and_respond();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(service.count_of("input_audio_buffer.commit"), 2);
    assert_eq!(service.count_of("response.create"), 2);

    channel.close();
}

#[tokio::test]
async fn appended_audio_reaches_the_wire_base64_encoded() {
    let service = start_service(vec![session_updated()]).await;
    let config = config_for(&service.url, TurnDetectionMode::ServerVad);
    let (channel, mut events) = SpeechChannel::open_with_key(&config, "test-key")
        .await
        .unwrap();
    assert_eq!(next_event(&mut events).await, SpeechEvent::SessionReady);

    channel.send_audio(&[0x7f, 0x00, 0x55]);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let received = service.received();
    let append = received
        .iter()
        .find(|v| v["type"] == "input_audio_buffer.append")
        .expect("append event");
    assert_eq!(append["audio"], BASE64.encode([0x7fu8, 0x00, 0x55]));

    channel.close();
}

#[tokio::test]
async fn greeting_instruction_rides_a_user_item() {
    let service = start_service(vec![session_updated()]).await;
    let config = config_for(&service.url, TurnDetectionMode::ServerVad);
    let (channel, mut events) = SpeechChannel::open_with_key(&config, "test-key")
        .await
        .unwrap();
    assert_eq!(next_event(&mut events).await, SpeechEvent::SessionReady);

    channel.instruct("Greet the caller and ask what their emergency is.");
    assert!(channel.response_in_flight());
    tokio::time::sleep(Duration::from_millis(200)).await;

    let received = service.received();
    let item_idx = received
        .iter()
        .position(|v| v["type"] == "conversation.item.create")
        .expect("conversation item");
    let item = &received[item_idx]["item"];
    assert_eq!(item["type"], "message");
    assert_eq!(item["role"], "user");
    assert_eq!(item["content"][0]["type"], "input_text");
    assert_eq!(
        item["content"][0]["text"],
        "Greet the caller and ask what their emergency is."
    );

    // The item precedes a plain response request; the instruction
    // override is reserved for the closing line.
    let create_idx = received
        .iter()
        .position(|v| v["type"] == "response.create")
        .expect("response.create event");
    assert!(item_idx < create_idx);
    assert!(received[create_idx].get("response").is_none());

    channel.close();
}

#[tokio::test]
async fn spoken_line_is_an_instruction_override() {
    let service = start_service(vec![session_updated()]).await;
    let config = config_for(&service.url, TurnDetectionMode::ServerVad);
    let (channel, mut events) = SpeechChannel::open_with_key(&config, "test-key")
        .await
        .unwrap();
    assert_eq!(next_event(&mut events).await, SpeechEvent::SessionReady);

    channel.say("Say this to the caller now: help is on the way.");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let received = service.received();
    let create = received
        .iter()
        .find(|v| v["type"] == "response.create")
        .expect("response.create event");
    assert_eq!(
        create["response"]["instructions"],
        "Say this to the caller now: help is on the way."
    );

    channel.close();
}

#[tokio::test]
async fn audio_after_close_is_swallowed() {
    let service = start_service(vec![session_updated()]).await;
    let config = config_for(&service.url, TurnDetectionMode::ServerVad);
    let (channel, mut events) = SpeechChannel::open_with_key(&config, "test-key")
        .await
        .unwrap();
    assert_eq!(next_event(&mut events).await, SpeechEvent::SessionReady);

    channel.close();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // In-flight telephony audio after session end is expected; it must
    // drop quietly.
    channel.send_audio(&[1, 2, 3]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(service.count_of("input_audio_buffer.append"), 0);
}
