//! Call-registry client (SPEC_FULL.md §B): the out-of-scope call-control
//! webhook's collaborator, narrowed to the two lookups C5/C6 actually need —
//! binding a `call_id` to a just-started stream, and reading the per-call
//! TTS voice binding.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("registry upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct TtsBinding {
    pub engine: String,
    pub voice: String,
    pub speed: f32,
}

#[async_trait]
pub trait CallRegistry: Send + Sync {
    /// Best-effort lookup of the most recent "ringing" call, ordered by
    /// start time descending, limit 1 (spec §4.5 fallback binding path).
    async fn most_recent_ringing_call_id(&self) -> Result<Option<String>, RegistryError>;

    /// Per-call TTS voice binding, if the registry has one on file.
    async fn tts_binding(&self, call_id: &str) -> Result<Option<TtsBinding>, RegistryError>;
}

pub struct HttpCallRegistry {
    http: reqwest::Client,
    base_url: String,
}

impl HttpCallRegistry {
    pub fn new(http: reqwest::Client, base_url: String) -> Self {
        Self { http, base_url }
    }
}

#[derive(Deserialize)]
struct RingingCallsResponse {
    calls: Vec<RingingCall>,
}

#[derive(Deserialize)]
struct RingingCall {
    call_id: String,
}

#[async_trait]
impl CallRegistry for HttpCallRegistry {
    async fn most_recent_ringing_call_id(&self) -> Result<Option<String>, RegistryError> {
        let resp = self
            .http
            .get(format!("{}/calls", self.base_url))
            .query(&[("status", "ringing"), ("order", "desc"), ("limit", "1")])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RegistryError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: RingingCallsResponse = resp.json().await?;
        Ok(parsed.calls.into_iter().next().map(|c| c.call_id))
    }

    async fn tts_binding(&self, call_id: &str) -> Result<Option<TtsBinding>, RegistryError> {
        let resp = self
            .http
            .get(format!("{}/calls/{}/tts-binding", self.base_url, call_id))
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RegistryError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        Ok(Some(resp.json().await?))
    }
}

/// In-memory registry used by the call simulator and tests, pre-seeded
/// with synthetic `call_id`s.
#[derive(Default)]
pub struct InMemoryCallRegistry {
    ringing: Mutex<Vec<String>>,
    bindings: Mutex<HashMap<String, TtsBinding>>,
}

impl InMemoryCallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_ringing(&self, call_id: impl Into<String>) {
        self.ringing.lock().unwrap().push(call_id.into());
    }

    pub fn set_binding(&self, call_id: impl Into<String>, binding: TtsBinding) {
        self.bindings.lock().unwrap().insert(call_id.into(), binding);
    }
}

#[async_trait]
impl CallRegistry for InMemoryCallRegistry {
    async fn most_recent_ringing_call_id(&self) -> Result<Option<String>, RegistryError> {
        Ok(self.ringing.lock().unwrap().last().cloned())
    }

    async fn tts_binding(&self, call_id: &str) -> Result<Option<TtsBinding>, RegistryError> {
        Ok(self.bindings.lock().unwrap().get(call_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_registry_returns_most_recently_pushed_ringing_call() {
        let reg = InMemoryCallRegistry::new();
        reg.push_ringing("call-1");
        reg.push_ringing("call-2");
        assert_eq!(
            reg.most_recent_ringing_call_id().await.unwrap(),
            Some("call-2".to_string())
        );
    }
}
