//! Text-to-speech engines (spec.md §4.7). Names are preserved for vendor
//! compatibility: a fixed-voice-id engine and an alternative with
//! language-coded voices, following the registry pattern in the teacher's
//! `tts/mod.rs` (`// Future: Register API-based adapters`) — this crate
//! registers exactly the two cloud adapters that comment anticipated.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TtsError {
    #[error("tts request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("tts upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("unknown tts engine: {0}")]
    UnknownEngine(String),
}

/// Produces a compressed (MP3-family) audio buffer for `text` at the given
/// voice and speed. The caller is responsible for transcoding to μ-law via
/// `clients::transcoder`.
#[async_trait]
pub trait TtsEngine: Send + Sync {
    fn name(&self) -> &'static str;
    async fn synthesize(&self, text: &str, voice: &str, speed: f32) -> Result<Vec<u8>, TtsError>;
}

#[derive(Serialize)]
struct ElevenLabsRequest<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: ElevenLabsVoiceSettings,
}

#[derive(Serialize)]
struct ElevenLabsVoiceSettings {
    stability: f32,
    similarity_boost: f32,
    speed: f32,
}

/// ElevenLabs-style engine: fixed voice identifiers (e.g. `"rachel"`),
/// speed passed as a voice-settings field.
pub struct ElevenLabsTts {
    http: reqwest::Client,
    api_key: String,
}

impl ElevenLabsTts {
    pub fn new(http: reqwest::Client, api_key: String) -> Self {
        Self { http, api_key }
    }
}

#[async_trait]
impl TtsEngine for ElevenLabsTts {
    fn name(&self) -> &'static str {
        "elevenlabs"
    }

    async fn synthesize(&self, text: &str, voice: &str, speed: f32) -> Result<Vec<u8>, TtsError> {
        let req = ElevenLabsRequest {
            text,
            model_id: "eleven_turbo_v2",
            voice_settings: ElevenLabsVoiceSettings {
                stability: 0.5,
                similarity_boost: 0.75,
                speed,
            },
        };

        let resp = self
            .http
            .post(format!(
                "https://api.elevenlabs.io/v1/text-to-speech/{voice}"
            ))
            .header("xi-api-key", &self.api_key)
            .json(&req)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TtsError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

#[derive(Serialize)]
struct GoogleSynthesisInput<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct GoogleVoiceSelection<'a> {
    #[serde(rename = "languageCode")]
    language_code: &'a str,
    name: &'a str,
}

#[derive(Serialize)]
struct GoogleAudioConfig {
    #[serde(rename = "audioEncoding")]
    audio_encoding: &'static str,
    #[serde(rename = "speakingRate")]
    speaking_rate: f32,
}

#[derive(Serialize)]
struct GoogleTtsRequest<'a> {
    input: GoogleSynthesisInput<'a>,
    voice: GoogleVoiceSelection<'a>,
    #[serde(rename = "audioConfig")]
    audio_config: GoogleAudioConfig,
}

#[derive(serde::Deserialize)]
struct GoogleTtsResponse {
    #[serde(rename = "audioContent")]
    audio_content: String,
}

/// Google-Cloud-TTS-style engine: voices are language-coded (e.g.
/// `"en-US-Neural2-C"`), split on the first two hyphen-delimited segments
/// to derive the required `languageCode`.
pub struct GoogleCloudTts {
    http: reqwest::Client,
    api_key: String,
}

impl GoogleCloudTts {
    pub fn new(http: reqwest::Client, api_key: String) -> Self {
        Self { http, api_key }
    }

    fn language_code(voice: &str) -> String {
        voice
            .splitn(3, '-')
            .take(2)
            .collect::<Vec<_>>()
            .join("-")
    }
}

#[async_trait]
impl TtsEngine for GoogleCloudTts {
    fn name(&self) -> &'static str {
        "google"
    }

    async fn synthesize(&self, text: &str, voice: &str, speed: f32) -> Result<Vec<u8>, TtsError> {
        let req = GoogleTtsRequest {
            input: GoogleSynthesisInput { text },
            voice: GoogleVoiceSelection {
                language_code: &Self::language_code(voice),
                name: voice,
            },
            audio_config: GoogleAudioConfig {
                audio_encoding: "MP3",
                speaking_rate: speed,
            },
        };

        let resp = self
            .http
            .post("https://texttospeech.googleapis.com/v1/text:synthesize")
            .query(&[("key", &self.api_key)])
            .json(&req)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TtsError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: GoogleTtsResponse = resp.json().await?;
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD
            .decode(parsed.audio_content)
            .map_err(|e| TtsError::Upstream {
                status: status.as_u16(),
                body: format!("invalid base64 audioContent: {e}"),
            })
    }
}

/// Deterministic stub returning a tiny fixed buffer, used by tests and
/// cold-start priming when no TTS credentials are configured.
pub struct StubTtsEngine {
    name: &'static str,
}

impl StubTtsEngine {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

#[async_trait]
impl TtsEngine for StubTtsEngine {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn synthesize(&self, text: &str, _voice: &str, _speed: f32) -> Result<Vec<u8>, TtsError> {
        Ok(text.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn google_language_code_splits_on_first_two_segments() {
        assert_eq!(GoogleCloudTts::language_code("en-US-Neural2-C"), "en-US");
    }

    #[tokio::test]
    async fn stub_engine_roundtrips_text_as_bytes() {
        let stub = StubTtsEngine::new("stub");
        let bytes = stub.synthesize("hello", "voice", 1.0).await.unwrap();
        assert_eq!(bytes, b"hello");
    }
}
