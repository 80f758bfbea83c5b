//! voicebridge-server: binds the HTTP+WS surface and serves calls.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use voicebridge_core::cache::{filler_key, greeting_key};
use voicebridge_core::clients::llm::{HttpChatClient, StubChatClient};
use voicebridge_core::clients::log::{HttpConversationLog, InMemoryConversationLog};
use voicebridge_core::clients::objectstore::{FsObjectStore, HttpObjectStore};
use voicebridge_core::clients::registry::{HttpCallRegistry, InMemoryCallRegistry};
use voicebridge_core::clients::stt::{HttpSttClient, StubSttClient};
use voicebridge_core::clients::tts::{ElevenLabsTts, GoogleCloudTts, StubTtsEngine, TtsEngine};
use voicebridge_core::clients::{CallRegistry, ChatClient, ConversationLog, ObjectStore, SttClient};
use voicebridge_core::config::Config;
use voicebridge_core::filler::{FILLER_TAG, FILLER_TEXT};
use voicebridge_core::server::{router, AppState};
use voicebridge_core::state::AgentServices;

const GREETING_TEXT: &str = "Thank you for calling. How can I help you today?";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::from_env();
    if config.missing_credentials() {
        tracing::warn!("no STT/LLM/TTS credentials configured; running with stub clients");
    }

    let http = reqwest::Client::new();

    let stt: Arc<dyn SttClient> = match &config.stt_api_key {
        Some(key) => Arc::new(HttpSttClient::new(http.clone(), config.stt_api_base.clone(), key.clone())),
        None => Arc::new(StubSttClient::new("")),
    };

    let llm: Arc<dyn ChatClient> = match &config.llm_api_key {
        Some(key) => Arc::new(HttpChatClient::new(http.clone(), config.llm_api_base.clone(), key.clone())),
        None => Arc::new(StubChatClient::new(r#"{"action":"normal","reason":"stub"}"#)),
    };

    let mut tts_engines: HashMap<String, Arc<dyn TtsEngine>> = HashMap::new();
    match &config.elevenlabs_api_key {
        Some(key) => {
            tts_engines.insert("elevenlabs".to_string(), Arc::new(ElevenLabsTts::new(http.clone(), key.clone())));
        }
        None => {
            tts_engines.insert("elevenlabs".to_string(), Arc::new(StubTtsEngine::new("elevenlabs")));
        }
    }
    match &config.google_tts_api_key {
        Some(key) => {
            tts_engines.insert("google".to_string(), Arc::new(GoogleCloudTts::new(http.clone(), key.clone())));
        }
        None => {
            tts_engines.insert("google".to_string(), Arc::new(StubTtsEngine::new("google")));
        }
    }

    let object_store: Arc<dyn ObjectStore> = match &config.object_store_endpoint_base {
        Some(base) => Arc::new(HttpObjectStore::new(http.clone(), base.clone())),
        None => Arc::new(FsObjectStore::new(std::env::temp_dir().join("voicebridge-cache"))),
    };

    let registry: Arc<dyn CallRegistry> = match &config.call_registry_base {
        Some(base) => Arc::new(HttpCallRegistry::new(http.clone(), base.clone())),
        None => Arc::new(InMemoryCallRegistry::new()),
    };

    let log: Arc<dyn ConversationLog> = match &config.conversation_log_base {
        Some(base) => Arc::new(HttpConversationLog::new(http.clone(), base.clone())),
        None => Arc::new(InMemoryConversationLog::new()),
    };

    let services = Arc::new(AgentServices::new(
        config.clone(),
        stt,
        llm,
        tts_engines,
        object_store,
        registry,
        log,
    ));

    prime_default_cache_entries(&services).await;

    let state = AppState::new(services);
    let app = router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    info!(addr, "starting voicebridge-server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Synthesizes the default greeting and filler up front so the very first
/// call on a cold process hits the memory tier instead of paying a
/// synthesis round-trip inline (spec §4.7 "(a) fast in-memory hit").
async fn prime_default_cache_entries(services: &AgentServices) {
    let engine = services.config.cache.default_engine.clone();
    let voice = services.config.cache.default_voice.clone();
    let speed = services.config.cache.default_speed.clone();
    let speed_f: f32 = speed.parse().unwrap_or(1.0);

    let Some(tts) = services.tts_engine(&engine) else {
        tracing::warn!(engine, "default tts engine not configured; skipping cache priming");
        return;
    };

    let greeting_key = greeting_key(&engine, &voice, &speed);
    match tts.synthesize(GREETING_TEXT, &voice, speed_f).await {
        Ok(compressed) => match services.transcoder.to_mulaw(&compressed).await {
            Ok(mulaw) => services.greeting_cache.prime(greeting_key, mulaw),
            Err(e) => tracing::warn!(error = %e, "greeting transcode failed during priming"),
        },
        Err(e) => tracing::warn!(error = %e, "greeting synthesis failed during priming"),
    }

    let filler_key = filler_key(FILLER_TAG, &services.config.cache.filler_version, &engine, &voice, &speed);
    match tts.synthesize(FILLER_TEXT, &voice, speed_f).await {
        Ok(compressed) => match services.transcoder.to_mulaw(&compressed).await {
            Ok(mulaw) => services.filler_cache.prime(filler_key, mulaw),
            Err(e) => tracing::warn!(error = %e, "filler transcode failed during priming"),
        },
        Err(e) => tracing::warn!(error = %e, "filler synthesis failed during priming"),
    }
}
