//! Filler & barge-in coordinator (C4).
//!
//! Grounded on the teacher's `ws_audio.rs` `VoiceSession::interrupt()` /
//! `check_interrupt()` pair, generalized into the cache-backed filler lookup
//! and the generation-based `request_stop` from `scheduler.rs` instead of a
//! single boolean interrupt flag.

use std::sync::Arc;

use crate::cache::{filler_key, CacheError};
use crate::scheduler::{AudioScheduler, FrameSink, SendOptions};
use crate::state::AgentServices;

pub const FILLER_TAG: &str = "thinking";
pub const FILLER_TEXT: &str = "Yes, thank you; the AI is thinking, please wait a moment";

/// Looks up (or synthesizes) the filler audio for `(engine, voice, speed)`
/// and sends it through the scheduler with an interruptible, "filler"
/// label. Stops any currently in-flight send first (subject to the
/// uninterruptible rule, same as `request_stop`). The send runs to
/// completion or cancellation in the background — callers must not await
/// it before starting reply generation (spec §4.4: "does not block the
/// LLM/TTS pipeline on it").
pub fn spawn_filler(
    services: Arc<AgentServices>,
    scheduler: Arc<AudioScheduler>,
    sink: Arc<dyn FrameSink>,
    stream_sid: String,
    engine: String,
    voice: String,
    speed: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = play_filler(&services, &scheduler, sink.as_ref(), &stream_sid, &engine, &voice, &speed).await
        {
            tracing::warn!(error = %e, "filler playback failed");
        }
    })
}

async fn play_filler(
    services: &AgentServices,
    scheduler: &AudioScheduler,
    sink: &dyn FrameSink,
    stream_sid: &str,
    engine: &str,
    voice: &str,
    speed: &str,
) -> Result<(), CacheError> {
    if scheduler.is_sending() {
        scheduler.stop_and_wait("filler_start").await;
    }

    let key = filler_key(FILLER_TAG, &services.config.cache.filler_version, engine, voice, speed);
    let tts = services.tts_engine(engine);
    let transcoder = services.transcoder.clone();
    let voice_owned = voice.to_string();
    let speed_f: f32 = speed.parse().unwrap_or(1.0);

    let bytes = services
        .filler_cache
        .get_or_synthesize(&key, move || async move {
            let tts = tts.ok_or_else(|| {
                CacheError::Tts(crate::clients::TtsError::UnknownEngine(engine.to_string()))
            })?;
            let compressed = tts.synthesize(FILLER_TEXT, &voice_owned, speed_f).await?;
            let mulaw = transcoder.to_mulaw(&compressed).await?;
            Ok(mulaw)
        })
        .await?;

    let _ = scheduler
        .send(sink, stream_sid, &bytes, SendOptions::new("filler"))
        .await;
    Ok(())
}

/// Barge-in: called on confirmed speech-start. Cancels the agent's current
/// utterance (greeting excepted, via the scheduler's uninterruptible rule)
/// so the caller is never talked over once they've started speaking.
pub fn on_speech_start(scheduler: &AudioScheduler) {
    if scheduler.is_sending() {
        scheduler.request_stop("caller_speech");
    }
}
