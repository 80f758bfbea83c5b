//! Process configuration, loaded once from the environment at startup.
//!
//! Grounded on the teacher's scattered `std::env::var(...)` lookups (e.g.
//! `stt/whisper.rs`'s `WHISPER_MODEL` read) but centralized into one typed
//! struct so every component reads already-parsed values instead of
//! re-reading and re-parsing env vars on every call.

use std::env;
use std::time::Duration;

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f32(name: &str, default: f32) -> f32 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Voice-activity and segmentation thresholds (section 4.2 / 6).
#[derive(Debug, Clone)]
pub struct VadConfig {
    pub threshold_idle: u32,
    pub threshold_while_playing: u32,
    pub warmup_frames_idle: u32,
    pub warmup_frames_while_playing: u32,
    pub silence_ms: u64,
    pub min_speech_frames: u32,
    pub min_speech_bytes: usize,
    pub min_speech_ms: u64,
}

impl VadConfig {
    fn from_env() -> Self {
        Self {
            threshold_idle: env_u32("VAD_THRESHOLD", 2),
            threshold_while_playing: env_u32("VAD_THRESHOLD_WHILE_PLAYING", 6),
            warmup_frames_idle: env_u32("SPEECH_WARMUP_FRAMES", 2),
            warmup_frames_while_playing: env_u32("SPEECH_WARMUP_FRAMES_WHILE_PLAYING", 4),
            silence_ms: env_u64("SILENCE_MS", 400),
            min_speech_frames: env_u32("MIN_SPEECH_FRAMES", 10),
            min_speech_bytes: env_u32("MIN_SPEECH_BYTES", 1600) as usize,
            min_speech_ms: env_u64("MIN_SPEECH_MS", 400),
        }
    }
}

/// Turn-handling / merge-window configuration (section 4.6 / 6).
#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub merge_window_ms: u64,
    pub merge_window_ms_while_playing: u64,
    pub whisper_gain_db: f32,
    pub whisper_audio_filters: Option<String>,
    pub max_response_chars: usize,
    pub chat_model: String,
    pub classifier_model: String,
}

impl TurnConfig {
    fn from_env() -> Self {
        let merge_window_ms = env_u64("MERGE_WINDOW_MS", 1200);
        Self {
            merge_window_ms,
            merge_window_ms_while_playing: env_u64(
                "MERGE_WINDOW_MS_WHILE_PLAYING",
                merge_window_ms,
            ),
            whisper_gain_db: env_f32("WHISPER_GAIN_DB", 6.0),
            whisper_audio_filters: env::var("WHISPER_AUDIO_FILTERS").ok(),
            max_response_chars: env_u32("MAX_RESPONSE_CHARS", 140) as usize,
            chat_model: env_string("CHAT_MODEL", "gpt-4o-mini"),
            classifier_model: env_string("CLASSIFIER_MODEL", "gpt-4o-mini"),
        }
    }

    /// The fixed cleanup filter chain applied before STT upload, unless overridden.
    pub fn audio_filters(&self) -> String {
        self.whisper_audio_filters.clone().unwrap_or_else(|| {
            format!(
                "highpass=f=120,lowpass=f=3800,volume={}dB",
                self.whisper_gain_db
            )
        })
    }
}

/// Cache / TTS binding configuration (section 4.7 / 6).
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub filler_version: String,
    pub object_store_bucket: String,
    pub default_engine: String,
    pub default_voice: String,
    pub default_speed: String,
}

impl CacheConfig {
    fn from_env() -> Self {
        Self {
            filler_version: env_string("FILLER_VERSION", "v1"),
            object_store_bucket: env_string("OBJECT_STORE_BUCKET", "voicebridge-audio-cache"),
            default_engine: env_string("DEFAULT_TTS_ENGINE", "elevenlabs"),
            default_voice: env_string("DEFAULT_TTS_VOICE", "rachel"),
            default_speed: env_string("DEFAULT_TTS_SPEED", "1.0"),
        }
    }
}

/// Top-level process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub vad: VadConfig,
    pub turn: TurnConfig,
    pub cache: CacheConfig,
    pub stt_api_base: String,
    pub stt_api_key: Option<String>,
    pub llm_api_base: String,
    pub llm_api_key: Option<String>,
    pub elevenlabs_api_key: Option<String>,
    pub google_tts_api_key: Option<String>,
    pub call_registry_base: Option<String>,
    pub conversation_log_base: Option<String>,
    pub object_store_endpoint_base: Option<String>,
    /// How many media frames to process between summary log lines (section 4.5).
    pub media_log_every_n: u64,
    /// Greeting wait windows (section 5 "Timeouts / backpressure").
    pub greeting_handshake_timeout: Duration,
    pub greeting_socket_open_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env_u32("PORT", 8080) as u16,
            vad: VadConfig::from_env(),
            turn: TurnConfig::from_env(),
            cache: CacheConfig::from_env(),
            stt_api_base: env_string("STT_API_BASE", "https://api.openai.com/v1"),
            stt_api_key: env::var("STT_API_KEY").ok(),
            llm_api_base: env_string("LLM_API_BASE", "https://api.openai.com/v1"),
            llm_api_key: env::var("LLM_API_KEY").ok(),
            elevenlabs_api_key: env::var("ELEVENLABS_API_KEY").ok(),
            google_tts_api_key: env::var("GOOGLE_TTS_API_KEY").ok(),
            call_registry_base: env::var("CALL_REGISTRY_BASE").ok(),
            conversation_log_base: env::var("CONVERSATION_LOG_BASE").ok(),
            object_store_endpoint_base: env::var("OBJECT_STORE_ENDPOINT_BASE").ok(),
            media_log_every_n: env_u64("MEDIA_LOG_EVERY_N", 50),
            greeting_handshake_timeout: Duration::from_millis(env_u64(
                "GREETING_HANDSHAKE_TIMEOUT_MS",
                2000,
            )),
            greeting_socket_open_timeout: Duration::from_millis(env_u64(
                "GREETING_SOCKET_OPEN_TIMEOUT_MS",
                2000,
            )),
        }
    }

    /// True when no downstream credentials are configured at all — a
    /// `ConfigurationError` per section 7 that should be logged but must
    /// not prevent `/health` from serving.
    pub fn missing_credentials(&self) -> bool {
        self.stt_api_key.is_none()
            && self.llm_api_key.is_none()
            && self.elevenlabs_api_key.is_none()
            && self.google_tts_api_key.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        // Avoid mutating the real process environment; construct directly.
        let vad = VadConfig::from_env();
        assert_eq!(vad.threshold_idle, 2);
        assert_eq!(vad.threshold_while_playing, 6);
        assert_eq!(vad.min_speech_frames, 10);
        assert_eq!(vad.min_speech_bytes, 1600);
        assert_eq!(vad.min_speech_ms, 400);
    }

    #[test]
    fn turn_config_merge_window_while_playing_defaults_to_base() {
        let turn = TurnConfig::from_env();
        assert_eq!(turn.merge_window_ms, 1200);
        assert_eq!(turn.merge_window_ms_while_playing, turn.merge_window_ms);
    }
}
