//! HTTP + WebSocket server and operator control surface (C8).
//!
//! Grounded on the `dnacenta-voice-echo` Twilio media handler's
//! `handle_media_upgrade`/`handle_media_stream` (axum `WebSocketUpgrade`,
//! a writer task fed by an `mpsc` channel, `tokio::select!` over the
//! socket), extended with the operator HTTP surface from spec.md §4.8
//! routed through the same per-session command channel so it cannot race
//! the turn handler (spec §9).

use std::collections::HashMap as StdHashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::AgentError;
use crate::scheduler::{FrameSink, SchedulerError, SendOptions};
use crate::session::CallSession;
use crate::state::AgentServices;
use crate::turn;
use crate::wire::StreamEvent;

#[derive(Clone)]
pub struct AppState {
    pub services: Arc<AgentServices>,
    pub sessions: Arc<Mutex<StdHashMap<String, mpsc::UnboundedSender<SessionCommand>>>>,
}

impl AppState {
    pub fn new(services: Arc<AgentServices>) -> Self {
        Self {
            services,
            sessions: Arc::new(Mutex::new(StdHashMap::new())),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/streams", get(streams_upgrade))
        .route("/transfer", post(transfer))
        .route("/ai-response", post(ai_response))
        .route("/speak", post(speak))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

#[derive(Debug)]
pub enum SessionCommand {
    SetAiEnabled(bool),
    ManualSpeak(String),
    Transfer { message: String, target: String },
}

async fn streams_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<StdHashMap<String, String>>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let call_id_from_url = params.get("call_id").cloned();
    ws.on_upgrade(move |socket| handle_stream_socket(socket, state, call_id_from_url))
}

/// Wraps the writer half of a split WebSocket as a `FrameSink`: the
/// scheduler calls `send_event` from whatever task is running a send, and
/// a single dedicated writer task serializes everything onto the socket.
struct WsFrameSink {
    tx: mpsc::UnboundedSender<Message>,
}

#[async_trait::async_trait]
impl FrameSink for WsFrameSink {
    async fn send_event(&self, event: StreamEvent) -> Result<(), SchedulerError> {
        let json = serde_json::to_string(&event)
            .map_err(|e| SchedulerError::SendFailed(e.to_string()))?;
        self.tx
            .send(Message::Text(json.into()))
            .map_err(|e| SchedulerError::SendFailed(e.to_string()))
    }

    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

async fn handle_stream_socket(socket: WebSocket, state: AppState, call_id_from_url: Option<String>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let sink: Arc<dyn FrameSink> = Arc::new(WsFrameSink { tx: out_tx });
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<SessionCommand>();
    let mut session = CallSession::new(&state.services.config, call_id_from_url);

    loop {
        let merge_sleep = match session.merge_deadline() {
            Some(deadline) => tokio::time::sleep_until(deadline.into()),
            None => tokio::time::sleep(std::time::Duration::from_secs(3600)),
        };
        tokio::pin!(merge_sleep);

        let handshake_sleep = match session.handshake_timeout_deadline() {
            Some(deadline) => tokio::time::sleep_until(deadline.into()),
            None => tokio::time::sleep(std::time::Duration::from_secs(3600)),
        };
        tokio::pin!(handshake_sleep);

        tokio::select! {
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(event) = serde_json::from_str::<StreamEvent>(&text) {
                            handle_peer_event(&mut session, &state, &sink, &cmd_tx, event).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            _ = &mut merge_sleep, if session.merge_deadline().is_some() => {
                let segment = session.take_pending_segment();
                if !segment.is_empty() {
                    if let (Some(call_id), Some(stream_id)) = (session.call_id.clone(), session.stream_id.clone()) {
                        turn::spawn_run_turn(
                            state.services.clone(),
                            session.turn_state.clone(),
                            session.scheduler.clone(),
                            sink.clone(),
                            stream_id,
                            call_id,
                            segment,
                        );
                    }
                }
            }
            _ = &mut handshake_sleep, if session.handshake_timeout_deadline().is_some() => {
                if session.abandon_greeting_on_handshake_timeout() {
                    tracing::error!("greeting handshake timed out waiting for stream_id/start; skipping greeting");
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(SessionCommand::SetAiEnabled(enabled)) => {
                        session.turn_state.lock().await.ai_enabled = enabled;
                    }
                    Some(SessionCommand::ManualSpeak(text)) => {
                        manual_speak(&state, &mut session, &sink, text).await;
                    }
                    Some(SessionCommand::Transfer { message, target }) => {
                        manual_speak(&state, &mut session, &sink, message).await;
                        tracing::info!(target, "transfer requested (telephony redirect is out of scope)");
                    }
                    None => {}
                }
            }
        }
    }

    writer.abort();
    if let Some(call_id) = &session.call_id {
        state.sessions.lock().remove(call_id);
    }
}

async fn handle_peer_event(
    session: &mut CallSession,
    state: &AppState,
    sink: &Arc<dyn FrameSink>,
    cmd_tx: &mpsc::UnboundedSender<SessionCommand>,
    event: StreamEvent,
) {
    match event {
        StreamEvent::Connected => {
            session.on_connected();
            maybe_send_greeting(session, state, sink).await;
        }
        StreamEvent::Start { start } => {
            session.on_start(start.stream_sid.clone(), start.call_sid.or(start.account_sid));
            if session.call_id.is_none() {
                session.bind_call_id_fallback(&state.services).await;
            }
            if let Some(call_id) = session.call_id.clone() {
                state.sessions.lock().insert(call_id, cmd_tx.clone());
            }
            maybe_send_greeting(session, state, sink).await;
        }
        StreamEvent::Media { media, .. } => {
            let is_inbound = matches!(media.track.as_deref(), None | Some("inbound"));
            if !is_inbound {
                return;
            }
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(&media.payload)
                .unwrap_or_default();
            if let Some(segment) = session.on_media_frame(&bytes) {
                session.enqueue_segment(&state.services.config, segment);
            }
        }
        StreamEvent::Mark { .. } => {}
        StreamEvent::Stop { .. } => {
            session.scheduler.request_stop("peer_stop");
        }
    }
}

async fn maybe_send_greeting(session: &mut CallSession, state: &AppState, sink: &Arc<dyn FrameSink>) {
    if session.ready_for_greeting() {
        if let Err(e) = session.send_greeting(&state.services, sink.as_ref()).await {
            tracing::error!(error = %e, "failed to send greeting");
        }
    }
}

async fn manual_speak(state: &AppState, session: &mut CallSession, sink: &Arc<dyn FrameSink>, text: String) {
    let Some(stream_id) = session.stream_id.clone() else {
        return;
    };
    let call_id = session.call_id.clone().unwrap_or_default();

    let (engine, voice, speed) = {
        let mut guard = session.turn_state.lock().await;
        guard.push_history(crate::clients::ChatMessage::assistant(&text));
        (guard.tts_engine.clone(), guard.tts_voice.clone(), guard.tts_speed.clone())
    };

    if let Err(e) = state.services.log.append_assistant(&call_id, &text).await {
        tracing::warn!(error = %e, "manual speak: conversation log append failed");
    }

    session.scheduler.stop_and_wait("manual_speak").await;
    match turn::synthesize(&state.services, &engine, &voice, &speed, &text).await {
        Ok(mulaw) => {
            let _ = session
                .scheduler
                .send(sink.as_ref(), &stream_id, &mulaw, SendOptions::new("reply"))
                .await;
        }
        Err(e) => tracing::error!(error = %e, "manual speak synthesis failed"),
    }
}

#[derive(Deserialize)]
struct TransferRequest {
    call_id: String,
    message: String,
    target: String,
}

#[derive(Deserialize)]
struct AiResponseRequest {
    call_id: String,
    enabled: bool,
}

#[derive(Deserialize)]
struct SpeakRequest {
    call_id: String,
    text: String,
}

#[derive(Serialize)]
struct Accepted {
    accepted: bool,
}

/// Looks up a live session's command channel, or `AgentError::UnknownCall`
/// if the call isn't (or is no longer) registered.
fn find_session(
    state: &AppState,
    call_id: &str,
) -> Result<mpsc::UnboundedSender<SessionCommand>, AgentError> {
    state
        .sessions
        .lock()
        .get(call_id)
        .cloned()
        .ok_or_else(|| AgentError::UnknownCall(call_id.to_string()))
}

async fn transfer(
    State(state): State<AppState>,
    Json(req): Json<TransferRequest>,
) -> Result<Json<Accepted>, AgentError> {
    let tx = find_session(&state, &req.call_id)?;
    let _ = tx.send(SessionCommand::Transfer {
        message: req.message,
        target: req.target,
    });
    Ok(Json(Accepted { accepted: true }))
}

async fn ai_response(
    State(state): State<AppState>,
    Json(req): Json<AiResponseRequest>,
) -> Result<Json<Accepted>, AgentError> {
    let tx = find_session(&state, &req.call_id)?;
    let _ = tx.send(SessionCommand::SetAiEnabled(req.enabled));
    Ok(Json(Accepted { accepted: true }))
}

async fn speak(
    State(state): State<AppState>,
    Json(req): Json<SpeakRequest>,
) -> Result<Json<Accepted>, AgentError> {
    let tx = find_session(&state, &req.call_id)?;
    let _ = tx.send(SessionCommand::ManualSpeak(req.text));
    Ok(Json(Accepted { accepted: true }))
}
