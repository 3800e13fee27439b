//! HTTP and WebSocket surface: provider webhooks, the media stream
//! socket, synthesized-audio playback, and the operator API.
//!
//! The gateway owns no call logic. Webhooks hand their forms to the
//! fallback flow, the media socket pumps raw frame text to and from a
//! [`CallOrchestrator`], and the operator endpoints are thin wrappers
//! over the store. Webhook responses are call-control XML; everything
//! else speaks JSON.

pub mod twiml;

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::call::Call;
use crate::config::SirenConfig;
use crate::error::SirenError;
use crate::ivr::interpret::Interpreter;
use crate::ivr::voice::Synthesizer;
use crate::ivr::{IvrFlow, IvrStep};
use crate::orchestrator::{CallOrchestrator, FRAME_CHANNEL_SIZE};
use crate::store::{CallPatch, CallStore};
use twiml::VoiceDocument;

#[derive(Clone)]
pub struct GatewayState {
    store: Arc<dyn CallStore>,
    config: Arc<SirenConfig>,
    flow: Arc<IvrFlow>,
    synthesizer: Arc<Synthesizer>,
    http: reqwest::Client,
}

impl GatewayState {
    pub fn new(config: Arc<SirenConfig>, store: Arc<dyn CallStore>) -> Self {
        let interpreter = Arc::new(Interpreter::new(&config.interpreter));
        let synthesizer = Arc::new(Synthesizer::new(&config.synthesis));
        let flow = Arc::new(IvrFlow::new(
            store.clone(),
            interpreter,
            synthesizer.clone(),
            &config,
        ));
        Self {
            store,
            config,
            flow,
            synthesizer,
            http: reqwest::Client::new(),
        }
    }
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/voice", post(voice_webhook))
        .route(crate::ivr::PROCESS_SPEECH_PATH, post(process_speech))
        .route(crate::ivr::FOLLOWUP_PATH, post(followup_questions))
        .route(crate::ivr::QUESTION_2_PATH, post(question_2))
        .route(crate::ivr::QUESTION_3_PATH, post(question_3))
        .route(crate::ivr::HOLD_PATH, post(hold_caller))
        .route("/webhooks/recording-status", post(recording_status))
        .route("/ws/media", get(media_socket))
        .route("/audio/{file}", get(serve_audio))
        .route("/calls/active", get(active_calls))
        .route("/calls/{id}", get(get_call))
        .route("/calls/{id}/recording", get(get_recording))
        .route("/calls/{id}/attach", post(attach_officer))
        .route("/calls/{id}/on-scene", post(on_scene))
        .route("/calls/{id}/close", post(close_call))
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(config: Arc<SirenConfig>, store: Arc<dyn CallStore>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr).await?;
    let local_addr = listener.local_addr()?;
    let state = GatewayState::new(config, store);
    info!("siren gateway listening on http://{local_addr}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct VoiceWebhookForm {
    #[serde(rename = "CallSid")]
    call_sid: String,
    #[serde(rename = "From", default)]
    from: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SpeechForm {
    #[serde(rename = "CallSid")]
    call_sid: String,
    #[serde(rename = "SpeechResult", default)]
    speech_result: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RecordingForm {
    #[serde(rename = "CallSid")]
    call_sid: String,
    #[serde(rename = "RecordingUrl", default)]
    recording_url: Option<String>,
    /// Seconds, sent as a string.
    #[serde(rename = "RecordingDuration", default)]
    recording_duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AttachBody {
    officer_id: String,
}

fn xml_response(doc: &VoiceDocument) -> Response {
    ([(header::CONTENT_TYPE, "application/xml")], doc.render()).into_response()
}

fn stream_url(public_host: &str) -> String {
    format!("wss://{public_host}/ws/media")
}

/// Entry point for every inbound call.
///
/// Creates the call record, optionally starts recording, and routes the
/// caller: a live media stream when the speech service is configured,
/// the gathered fallback flow otherwise.
async fn voice_webhook(
    State(state): State<GatewayState>,
    Form(form): Form<VoiceWebhookForm>,
) -> Response {
    let caller = form.from.unwrap_or_else(|| "unknown".to_owned());
    info!(call_id = %form.call_sid, caller = %caller, "inbound call");

    if let Err(e) = state.store.create(Call::new(&form.call_sid, caller)).await {
        warn!(call_id = %form.call_sid, error = %e, "call create failed");
    }
    if state.config.telephony.record_calls {
        start_recording(&state, &form.call_sid);
    }

    let doc = if state.config.speech.is_configured() {
        VoiceDocument::new().connect_stream(stream_url(&state.config.server.public_host))
    } else {
        debug!(call_id = %form.call_sid, "speech service unconfigured; entering fallback flow");
        state.flow.greet().await
    };
    xml_response(&doc)
}

/// Ask the provider to record the call. Fire and forget: a webhook
/// response must never wait on the provider's REST API.
fn start_recording(state: &GatewayState, call_sid: &str) {
    let Some((account_sid, auth_token)) = state.config.telephony.credentials() else {
        debug!("recording enabled but provider credentials are not set");
        return;
    };
    let url = format!(
        "{}/2010-04-01/Accounts/{}/Calls/{}/Recordings.json",
        state.config.telephony.api_base.trim_end_matches('/'),
        account_sid,
        call_sid
    );
    let callback = format!(
        "https://{}/webhooks/recording-status",
        state.config.server.public_host
    );
    let http = state.http.clone();
    let call_sid = call_sid.to_owned();
    tokio::spawn(async move {
        let result = http
            .post(&url)
            .basic_auth(&account_sid, Some(&auth_token))
            .form(&[
                ("RecordingStatusCallback", callback.as_str()),
                ("RecordingStatusCallbackEvent", "completed"),
            ])
            .send()
            .await;
        match result {
            Ok(r) if r.status().is_success() => {
                info!(call_id = %call_sid, "recording started");
            }
            Ok(r) => {
                warn!(call_id = %call_sid, status = %r.status(), "recording request rejected");
            }
            Err(e) => warn!(call_id = %call_sid, error = %e, "recording request failed"),
        }
    });
}

async fn process_speech(
    State(state): State<GatewayState>,
    Form(form): Form<SpeechForm>,
) -> Response {
    speech_webhook(&state, IvrStep::ProcessSpeech, &form).await
}

async fn followup_questions(
    State(state): State<GatewayState>,
    Form(form): Form<SpeechForm>,
) -> Response {
    speech_webhook(&state, IvrStep::FollowupQuestions, &form).await
}

async fn question_2(State(state): State<GatewayState>, Form(form): Form<SpeechForm>) -> Response {
    speech_webhook(&state, IvrStep::QuestionTwo, &form).await
}

async fn question_3(State(state): State<GatewayState>, Form(form): Form<SpeechForm>) -> Response {
    speech_webhook(&state, IvrStep::QuestionThree, &form).await
}

async fn speech_webhook(state: &GatewayState, step: IvrStep, form: &SpeechForm) -> Response {
    let doc = state
        .flow
        .speech_step(step, &form.call_sid, form.speech_result.as_deref())
        .await;
    xml_response(&doc)
}

async fn hold_caller(State(state): State<GatewayState>, Form(form): Form<SpeechForm>) -> Response {
    let doc = state
        .flow
        .hold_step(&form.call_sid, form.speech_result.as_deref())
        .await;
    xml_response(&doc)
}

async fn recording_status(
    State(state): State<GatewayState>,
    Form(form): Form<RecordingForm>,
) -> StatusCode {
    let duration = form
        .recording_duration
        .as_deref()
        .and_then(|d| d.parse::<u32>().ok())
        .unwrap_or(0);
    if let Some(url) = form.recording_url {
        info!(call_id = %form.call_sid, duration, "recording completed");
        let patch = CallPatch::new().with_recording(url, duration);
        if let Err(e) = state.store.patch(&form.call_sid, patch).await {
            warn!(call_id = %form.call_sid, error = %e, "recording update failed");
        }
    }
    StatusCode::OK
}

async fn media_socket(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| relay_media_socket(socket, state))
}

/// Pump raw frame text between the provider socket and one orchestrator.
///
/// The socket id only correlates log lines until the `start` frame names
/// the call.
async fn relay_media_socket(socket: WebSocket, state: GatewayState) {
    let socket_id = Uuid::new_v4();
    info!(%socket_id, "media socket connected");

    let (inbound_tx, inbound_rx) = mpsc::channel::<String>(FRAME_CHANNEL_SIZE);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(FRAME_CHANNEL_SIZE);

    let orchestrator = CallOrchestrator::new(state.store.clone(), state.config.clone());
    let call_task = tokio::spawn(async move {
        if let Err(e) = orchestrator.run(inbound_rx, outbound_tx).await {
            warn!(error = %e, "call ended abnormally");
        }
    });

    let (mut ws_tx, mut ws_rx) = socket.split();
    let writer = tokio::spawn(async move {
        // Ends when the orchestrator drops its sender.
        while let Some(frame) = outbound_rx.recv().await {
            if ws_tx.send(WsMessage::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(WsMessage::Text(text)) => {
                if inbound_tx.send(text.to_string()).await.is_err() {
                    break;
                }
            }
            Ok(WsMessage::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    // Channel end tells the orchestrator the provider is gone.
    drop(inbound_tx);
    let _ = tokio::join!(call_task, writer);
    info!(%socket_id, "media socket closed");
}

async fn serve_audio(State(state): State<GatewayState>, Path(file): Path<String>) -> Response {
    match state.synthesizer.read_cached(&file).await {
        Ok(Some(bytes)) => ([(header::CONTENT_TYPE, "audio/mpeg")], bytes).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!(file = %file, error = %e, "audio read failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn call_error_response(e: &SirenError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match e {
        SirenError::UnknownCall(_) => StatusCode::NOT_FOUND,
        SirenError::Persistence(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": e.to_string() })))
}

async fn active_calls(State(state): State<GatewayState>) -> (StatusCode, Json<serde_json::Value>) {
    match state.store.active_calls().await {
        Ok(calls) => {
            let count = calls.len();
            (
                StatusCode::OK,
                Json(serde_json::json!({ "count": count, "calls": calls })),
            )
        }
        Err(e) => call_error_response(&e),
    }
}

async fn get_call(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.store.fetch(&id).await {
        Ok(Some(call)) => (StatusCode::OK, Json(serde_json::json!(call))),
        Ok(None) => call_error_response(&SirenError::UnknownCall(id)),
        Err(e) => call_error_response(&e),
    }
}

async fn get_recording(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.store.fetch(&id).await {
        Ok(Some(call)) => match call.recording_url {
            Some(url) => (
                StatusCode::OK,
                Json(serde_json::json!({
                    "call_id": call.call_id,
                    "recording_url": url,
                    "duration_secs": call.recording_duration_secs.unwrap_or(0),
                })),
            ),
            None => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "error": "no recording for this call" })),
            ),
        },
        Ok(None) => call_error_response(&SirenError::UnknownCall(id)),
        Err(e) => call_error_response(&e),
    }
}

async fn attach_officer(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
    Json(body): Json<AttachBody>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.store.assign_officer(&id, &body.officer_id).await {
        Ok(call) => {
            info!(call_id = %id, officer = %body.officer_id, "officer attached");
            (StatusCode::OK, Json(serde_json::json!(call)))
        }
        Err(e) => call_error_response(&e),
    }
}

async fn on_scene(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.store.mark_on_scene(&id).await {
        Ok(call) => {
            info!(call_id = %id, "officer on scene");
            (StatusCode::OK, Json(serde_json::json!(call)))
        }
        Err(e) => call_error_response(&e),
    }
}

async fn close_call(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.store.close_call(&id).await {
        Ok(call) => {
            info!(call_id = %id, "call closed");
            (StatusCode::OK, Json(serde_json::json!(call)))
        }
        Err(e) => call_error_response(&e),
    }
}
