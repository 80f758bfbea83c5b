//! Crate-wide error aggregate.
//!
//! Each component owns its own `thiserror` enum (see `session`, `scheduler`,
//! `turn`, `cache`, `clients::*`). `AgentError` exists only at the HTTP/WS
//! boundary, where one error type is needed to map onto a status code or a
//! logged-and-swallowed outcome (section 7: errors are handled at the
//! nearest boundary that can recover).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::clients::{LlmError, SttError, TtsError};
use crate::session::SessionError;
use crate::turn::TurnError;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("turn error: {0}")]
    Turn(#[from] TurnError),

    #[error(transparent)]
    Stt(#[from] SttError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Tts(#[from] TtsError),

    #[error("unknown call_id: {0}")]
    UnknownCall(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        let status = match &self {
            AgentError::UnknownCall(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(ErrorBody { error: self.to_string() });
        (status, body).into_response()
    }
}
