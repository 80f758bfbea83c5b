//! Speech-to-text client (spec.md §4.6 step 2).

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SttError {
    #[error("stt request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("stt upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },
}

#[async_trait]
pub trait SttClient: Send + Sync {
    /// Transcribes a 16 kHz mono WAV buffer. `language_hint` is passed
    /// through (e.g. `"en"`); temperature is fixed at 0 per spec.
    async fn transcribe(&self, wav_bytes: &[u8], language_hint: &str) -> Result<String, SttError>;
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Cloud STT over an OpenAI-compatible `/audio/transcriptions` endpoint.
pub struct HttpSttClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
}

impl HttpSttClient {
    pub fn new(http: reqwest::Client, api_base: String, api_key: String) -> Self {
        Self {
            http,
            api_base,
            api_key,
            model: "whisper-1".to_string(),
        }
    }
}

#[async_trait]
impl SttClient for HttpSttClient {
    async fn transcribe(&self, wav_bytes: &[u8], language_hint: &str) -> Result<String, SttError> {
        let form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .text("language", language_hint.to_string())
            .text("temperature", "0")
            .text("response_format", "verbose_json")
            .part(
                "file",
                reqwest::multipart::Part::bytes(wav_bytes.to_vec())
                    .file_name("segment.wav")
                    .mime_str("audio/wav")
                    .map_err(SttError::Request)?,
            );

        let resp = self
            .http
            .post(format!("{}/audio/transcriptions", self.api_base))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SttError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: TranscriptionResponse = resp.json().await?;
        Ok(parsed.text)
    }
}

/// Deterministic stub used by tests and the call simulator's default
/// configuration: echoes a duration-proportional placeholder so pipeline
/// tests can assert on non-empty text without real credentials.
pub struct StubSttClient {
    pub canned_text: String,
}

impl StubSttClient {
    pub fn new(canned_text: impl Into<String>) -> Self {
        Self {
            canned_text: canned_text.into(),
        }
    }
}

#[async_trait]
impl SttClient for StubSttClient {
    async fn transcribe(&self, _wav_bytes: &[u8], _language_hint: &str) -> Result<String, SttError> {
        Ok(self.canned_text.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_returns_canned_text() {
        let stub = StubSttClient::new("hello there");
        let text = stub.transcribe(&[], "en").await.unwrap();
        assert_eq!(text, "hello there");
    }
}
