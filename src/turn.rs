//! Turn handler (C6): STT → intent classify → optional LLM → TTS → send.
//!
//! Grounded on the `dnacenta-voice-echo` Twilio media handler's
//! `process_utterance` pipeline (transcode → STT → chat → TTS → paced
//! send), generalized with the intent-classifier routing and merge-window
//! policy spec.md §4.6 adds on top of that baseline.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::cache::CacheError;
use crate::clients::{ChatMessage, LlmError, SttError, TranscoderError, TtsError};
use crate::config::Config;
use crate::filler;
use crate::scheduler::{AudioScheduler, FrameSink, SchedulerError, SendOptions};
use crate::state::AgentServices;

#[derive(Debug, Error)]
pub enum TurnError {
    #[error(transparent)]
    Stt(#[from] SttError),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Tts(#[from] TtsError),
    #[error(transparent)]
    Transcoder(#[from] TranscoderError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("unknown tts engine: {0}")]
    UnknownEngine(String),
}

const APOLOGY: &str = "Sorry, I couldn't catch that. Could you repeat?";
const FAREWELL: &str = "Thank you for calling. Goodbye!";
const TAKE_MESSAGE_PROMPT: &str =
    "Could you share your name, a callback number, and the details of your message?";
const CLOSING_QUESTION: &str = "Understood. Anything else? If not, you may hang up.";
const CONVERSATIONAL_SYSTEM_PROMPT: &str =
    "You are a helpful phone agent. Reply in 1-2 short sentences, conversational tone.";

const NOTHING_FURTHER_PHRASES: &[&str] = &[
    "no that's all",
    "nothing else",
    "nothing further",
    "that's everything",
    "that is all",
    "no thank you",
    "no thanks",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Action {
    Normal,
    TakeMessage,
    Closing,
    Farewell,
}

#[derive(Deserialize)]
struct ClassifierResponse {
    action: Action,
    #[allow(dead_code)]
    reason: String,
}

/// Turn-relevant mutable per-session state, shared via `Arc<Mutex<_>>` so a
/// spawned turn task never holds a lock across an RPC suspension point
/// (spec §5). Everything else in `CallSession` stays single-owner.
pub struct TurnState {
    pub history: Vec<ChatMessage>,
    pub closing_asked: bool,
    pub purpose_captured: bool,
    pub ai_enabled: bool,
    pub tts_engine: String,
    pub tts_voice: String,
    pub tts_speed: String,
    segment_running: bool,
    segment_queue: VecDeque<Vec<u8>>,
}

impl TurnState {
    pub fn new(config: &Config) -> Self {
        Self {
            history: Vec::new(),
            closing_asked: false,
            purpose_captured: false,
            ai_enabled: true,
            tts_engine: config.cache.default_engine.clone(),
            tts_voice: config.cache.default_voice.clone(),
            tts_speed: config.cache.default_speed.clone(),
            segment_running: false,
            segment_queue: VecDeque::new(),
        }
    }

    pub fn push_history(&mut self, message: ChatMessage) {
        self.history.push(message);
        if self.history.len() > 10 {
            let drop = self.history.len() - 10;
            self.history.drain(0..drop);
        }
    }
}

/// Spawns the single-flight turn pipeline for one merged segment. If a
/// turn is already running for this session, the segment is queued instead
/// (spec §3: `segment_running=true` ⇒ new EOS segments append to
/// `segment_queue`) and processed FIFO once the in-flight turn completes.
pub fn spawn_run_turn(
    services: Arc<AgentServices>,
    turn_state: Arc<AsyncMutex<TurnState>>,
    scheduler: Arc<AudioScheduler>,
    sink: Arc<dyn FrameSink>,
    stream_sid: String,
    call_id: String,
    segment_mulaw: Vec<u8>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        {
            let mut state = turn_state.lock().await;
            if state.segment_running {
                state.segment_queue.push_back(segment_mulaw);
                return;
            }
            state.segment_running = true;
        }

        let mut current = segment_mulaw;
        loop {
            if let Err(e) = run_one_turn(
                services.clone(),
                &turn_state,
                scheduler.clone(),
                sink.clone(),
                &stream_sid,
                &call_id,
                current,
            )
            .await
            {
                tracing::error!(error = %e, call_id, "turn failed");
            }

            let next = {
                let mut state = turn_state.lock().await;
                match state.segment_queue.pop_front() {
                    Some(next) => Some(next),
                    None => {
                        state.segment_running = false;
                        None
                    }
                }
            };
            match next {
                Some(next) => current = next,
                None => break,
            }
        }
    })
}

async fn run_one_turn(
    services: Arc<AgentServices>,
    turn_state: &Arc<AsyncMutex<TurnState>>,
    scheduler: Arc<AudioScheduler>,
    sink: Arc<dyn FrameSink>,
    stream_sid: &str,
    call_id: &str,
    segment_mulaw: Vec<u8>,
) -> Result<(), TurnError> {
    let (engine, voice, speed, ai_enabled) = {
        let state = turn_state.lock().await;
        (
            state.tts_engine.clone(),
            state.tts_voice.clone(),
            state.tts_speed.clone(),
            state.ai_enabled,
        )
    };

    if !ai_enabled {
        return Ok(());
    }

    let _filler = filler::spawn_filler(
        services.clone(),
        scheduler.clone(),
        sink.clone(),
        stream_sid.to_string(),
        engine.clone(),
        voice.clone(),
        speed.clone(),
    );

    let wav = services
        .transcoder
        .mulaw_to_wav16k(&segment_mulaw, &services.config.turn.audio_filters())
        .await?;
    let text = services.stt.transcribe(&wav, "en").await?;

    if text.trim().is_empty() {
        scheduler.stop_and_wait("reply_start").await;
        let mulaw = synthesize(&services, &engine, &voice, &speed, APOLOGY).await?;
        scheduler
            .send(sink.as_ref(), stream_sid, &mulaw, SendOptions::new("reply"))
            .await?;
        return Ok(());
    }

    if let Err(e) = services.log.append_user(call_id, &text).await {
        tracing::warn!(call_id, error = %e, "conversation log append_user failed");
    }

    {
        let mut state = turn_state.lock().await;
        state.push_history(ChatMessage::user(&text));
    }

    let closing_asked = turn_state.lock().await.closing_asked;
    let action = classify_intent(&services, closing_asked, &text).await;

    let reply = match action {
        Action::Farewell => FAREWELL.to_string(),
        Action::TakeMessage => TAKE_MESSAGE_PROMPT.to_string(),
        Action::Closing => {
            let mut state = turn_state.lock().await;
            state.purpose_captured = true;
            state.closing_asked = true;
            format!("Understood. {CLOSING_QUESTION}")
        }
        Action::Normal => {
            let closing_asked = turn_state.lock().await.closing_asked;
            if closing_asked && matches_nothing_further(&text) {
                FAREWELL.to_string()
            } else {
                let history = turn_state.lock().await.history.clone();
                conversational_reply(&services, &history, services.config.turn.max_response_chars).await?
            }
        }
    };

    if let Err(e) = services.log.append_assistant(call_id, &reply).await {
        tracing::warn!(call_id, error = %e, "conversation log append_assistant failed");
    }
    {
        let mut state = turn_state.lock().await;
        state.push_history(ChatMessage::assistant(&reply));
    }

    scheduler.stop_and_wait("reply_start").await;
    let mulaw = synthesize(&services, &engine, &voice, &speed, &reply).await?;
    scheduler
        .send(sink.as_ref(), stream_sid, &mulaw, SendOptions::new("reply"))
        .await?;

    Ok(())
}

async fn classify_intent(services: &AgentServices, closing_asked: bool, user_message: &str) -> Action {
    let prompt = format!(
        "Classify the caller's intent. Respond with strict JSON {{\"action\":..,\"reason\":..}} \
         where action is one of normal, take_message, closing, farewell. \
         closing_asked={closing_asked}. user_message={user_message:?}"
    );
    let messages = [ChatMessage::system(
        "You are an intent classifier for a phone agent. Always respond with strict JSON only.",
    ), ChatMessage::user(prompt)];

    let raw = match services
        .llm
        .chat(&services.config.turn.classifier_model, &messages, 0.0, 50)
        .await
    {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(error = %e, "classifier call failed; falling back to normal");
            return Action::Normal;
        }
    };

    match serde_json::from_str::<ClassifierResponse>(&raw) {
        Ok(parsed) => parsed.action,
        Err(_) => Action::Normal,
    }
}

async fn conversational_reply(
    services: &AgentServices,
    history: &[ChatMessage],
    max_chars: usize,
) -> Result<String, TurnError> {
    let mut messages = vec![ChatMessage::system(CONVERSATIONAL_SYSTEM_PROMPT)];
    messages.extend(history.iter().cloned());

    let raw = services
        .llm
        .chat(&services.config.turn.chat_model, &messages, 0.3, 80)
        .await?;

    Ok(truncate_with_ellipsis(&raw, max_chars))
}

fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{truncated}…")
}

fn matches_nothing_further(message: &str) -> bool {
    let lower = message.to_lowercase();
    NOTHING_FURTHER_PHRASES.iter().any(|p| lower.contains(p))
}

/// Synthesizes arbitrary (uncached) text via the session's bound TTS engine
/// and transcodes it to raw μ-law. Used for intent-routed replies and for
/// operator-triggered manual speech (spec §4.8 `/speak`).
pub async fn synthesize(
    services: &AgentServices,
    engine: &str,
    voice: &str,
    speed: &str,
    text: &str,
) -> Result<Vec<u8>, TurnError> {
    let tts = services
        .tts_engine(engine)
        .ok_or_else(|| TurnError::UnknownEngine(engine.to_string()))?;
    let speed_f: f32 = speed.parse().unwrap_or(1.0);
    let compressed = tts.synthesize(text, voice, speed_f).await?;
    Ok(services.transcoder.to_mulaw(&compressed).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_long_reply_with_ellipsis() {
        let text = "a".repeat(200);
        let truncated = truncate_with_ellipsis(&text, 140);
        assert_eq!(truncated.chars().count(), 140);
        assert!(truncated.ends_with('…'));
    }

    #[test]
    fn short_reply_is_untouched() {
        let text = "hello there";
        assert_eq!(truncate_with_ellipsis(text, 140), text);
    }

    #[test]
    fn nothing_further_phrase_matches_case_insensitively() {
        assert!(matches_nothing_further("No, that's all, thanks"));
        assert!(!matches_nothing_further("Actually I have one more question"));
    }

    #[test]
    fn invalid_classifier_json_falls_back_to_normal_shape() {
        let result = serde_json::from_str::<ClassifierResponse>("not json");
        assert!(result.is_err());
    }
}
