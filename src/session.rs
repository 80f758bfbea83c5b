//! Per-call session state machine (C5).
//!
//! Grounded on the teacher's `ws_audio.rs` `VoiceSession` (channels +
//! handshake flags) and `call_server.rs`'s `Call` struct, generalized from
//! multi-party mixing state to the single-peer handshake/greeting/VAD
//! dispatch machinery spec.md §3–4.5 describe. The turn-relevant mutable
//! fields (history, dialog flags, TTS binding, single-flight guard) live in
//! `turn::TurnState`, shared via `Arc<Mutex<_>>` so `turn::run_turn` can be
//! spawned as a background task without holding a session-wide lock across
//! its STT/LLM/TTS suspension points (spec §5).

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::cache::greeting_key;
use crate::codec;
use crate::config::Config;
use crate::filler;
use crate::scheduler::{AudioScheduler, FrameSink, SendOptions};
use crate::state::AgentServices;
use crate::turn::TurnState;
use crate::vad::{SegmentOutcome, SpeechSegmenter};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session has no bound stream_sid yet")]
    NoStreamBound,
    #[error("scheduler error: {0}")]
    Scheduler(#[from] crate::scheduler::SchedulerError),
}

/// Bounded wait for the socket to reach OPEN (spec §5, second stage of the
/// greeting handshake). Polls rather than relying on a notification because
/// `FrameSink` only exposes a synchronous `is_open`.
async fn wait_for_socket_open(sink: &dyn FrameSink, deadline: Option<Instant>) -> bool {
    if sink.is_open() {
        return true;
    }
    let Some(deadline) = deadline else {
        return sink.is_open();
    };
    while Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if sink.is_open() {
            return true;
        }
    }
    sink.is_open()
}

/// Live, process-local state for one WebSocket call (spec §3).
pub struct CallSession {
    pub call_id: Option<String>,
    pub stream_id: Option<String>,

    pub connected: bool,
    pub start_received: bool,
    pub initial_sent: bool,
    greeting_attempted: bool,
    start_received_at: Option<Instant>,
    created_at: Instant,

    pub scheduler: Arc<AudioScheduler>,
    pub segmenter: SpeechSegmenter,

    pub pending_segments: Vec<u8>,
    pub pending_timer_deadline: Option<Instant>,

    pub turn_state: Arc<AsyncMutex<TurnState>>,

    handshake_timeout: Duration,
    socket_open_timeout: Duration,
    media_log_every_n: u64,
    media_frame_count: u64,
}

impl CallSession {
    pub fn new(config: &Config, call_id_from_url: Option<String>) -> Self {
        Self {
            call_id: call_id_from_url,
            stream_id: None,
            connected: false,
            start_received: false,
            initial_sent: false,
            greeting_attempted: false,
            start_received_at: None,
            created_at: Instant::now(),
            scheduler: Arc::new(AudioScheduler::new()),
            segmenter: SpeechSegmenter::new(config.vad.clone()),
            pending_segments: Vec::new(),
            pending_timer_deadline: None,
            turn_state: Arc::new(AsyncMutex::new(TurnState::new(config))),
            handshake_timeout: config.greeting_handshake_timeout,
            socket_open_timeout: config.greeting_socket_open_timeout,
            media_log_every_n: config.media_log_every_n,
            media_frame_count: 0,
        }
    }

    pub fn on_connected(&mut self) {
        self.connected = true;
    }

    pub fn on_start(&mut self, stream_sid: String, call_sid: Option<String>) {
        self.stream_id = Some(stream_sid);
        self.start_received = true;
        self.start_received_at = Some(Instant::now());
        if self.call_id.is_none() {
            self.call_id = call_sid;
        }
    }

    /// Best-effort `call_id` binding fallback when neither the upgrade URL
    /// nor `start.callSid`/`accountSid` supplied one (spec §4.5). Called
    /// once, shortly after `start`, with a bounded wait already elapsed by
    /// the caller.
    pub async fn bind_call_id_fallback(&mut self, services: &AgentServices) {
        if self.call_id.is_some() {
            return;
        }
        match services.registry.most_recent_ringing_call_id().await {
            Ok(Some(id)) => self.call_id = Some(id),
            Ok(None) => {
                tracing::warn!("no ringing call found in registry; continuing without persistence");
                self.call_id = Some(format!("unbound-{}", Uuid::new_v4()));
            }
            Err(e) => {
                tracing::error!(error = %e, "call registry lookup failed; continuing without persistence");
                self.call_id = Some(format!("unbound-{}", Uuid::new_v4()));
            }
        }
    }

    pub fn ready_for_greeting(&self) -> bool {
        self.connected && self.start_received && !self.initial_sent && !self.greeting_attempted
    }

    /// Deadline by which `(connected && start_received)` must hold, past
    /// which the handshake has timed out and the greeting must be
    /// abandoned (spec §5). `None` once the handshake is already satisfied
    /// or the greeting was already attempted.
    pub fn handshake_timeout_deadline(&self) -> Option<Instant> {
        if self.start_received || self.greeting_attempted {
            None
        } else {
            Some(self.created_at + self.handshake_timeout)
        }
    }

    /// Gives up on the greeting because the handshake never completed in
    /// time. Returns `false` (no-op) if the handshake actually completed
    /// in the race against this timer, so the caller only logs on `true`.
    pub fn abandon_greeting_on_handshake_timeout(&mut self) -> bool {
        if self.start_received || self.greeting_attempted {
            return false;
        }
        self.greeting_attempted = true;
        true
    }

    /// Schedules the initial greeting exactly once (spec §4.5). Tries the
    /// default pre-rendered cache entry first so the fast path never waits
    /// on the registry; falls back to the per-call TTS binding only on a
    /// cache miss.
    pub async fn send_greeting(
        &mut self,
        services: &AgentServices,
        sink: &dyn FrameSink,
    ) -> Result<(), SessionError> {
        self.greeting_attempted = true;
        let stream_sid = self.stream_id.clone().ok_or(SessionError::NoStreamBound)?;

        let socket_deadline = self.start_received_at.map(|t| t + self.socket_open_timeout);
        if !wait_for_socket_open(sink, socket_deadline).await {
            tracing::error!("socket never reached OPEN within greeting_socket_open_timeout; skipping greeting");
            return Ok(());
        }

        let (engine, voice, speed) = {
            let mut state = self.turn_state.lock().await;
            (state.tts_engine.clone(), state.tts_voice.clone(), state.tts_speed.clone())
        };

        let key = greeting_key(&engine, &voice, &speed);
        if let Some(bytes) = services.greeting_cache.memory_hit(&key) {
            self.segmenter.greeting_in_progress = true;
            let _ = self
                .scheduler
                .send(sink, &stream_sid, &bytes, SendOptions::new("greeting").uninterruptible())
                .await;
            self.segmenter.greeting_in_progress = false;
            self.initial_sent = true;
            return Ok(());
        }

        // Cache miss: fall back to the call's bound TTS voice (if any) and
        // synthesize on demand, without blocking other sessions' fast path.
        if let Some(call_id) = &self.call_id {
            if let Ok(Some(binding)) = services.registry.tts_binding(call_id).await {
                let mut state = self.turn_state.lock().await;
                state.tts_engine = binding.engine;
                state.tts_voice = binding.voice;
                state.tts_speed = binding.speed.to_string();
            }
        }
        let (engine, voice, speed) = {
            let state = self.turn_state.lock().await;
            (state.tts_engine.clone(), state.tts_voice.clone(), state.tts_speed.clone())
        };
        let key = greeting_key(&engine, &voice, &speed);
        let tts = services.tts_engine(&engine);
        let transcoder = services.transcoder.clone();
        let speed_f: f32 = speed.parse().unwrap_or(1.0);
        let voice_owned = voice.clone();

        let synth_result = services
            .greeting_cache
            .get_or_synthesize(&key, move || async move {
                let tts = tts.ok_or_else(|| {
                    crate::cache::CacheError::Tts(crate::clients::TtsError::UnknownEngine(engine))
                })?;
                let compressed = tts.synthesize(
                    "Thank you for calling. How can I help you today?",
                    &voice_owned,
                    speed_f,
                )
                .await?;
                let mulaw = transcoder.to_mulaw(&compressed).await?;
                Ok(mulaw)
            })
            .await;

        match synth_result {
            Ok(bytes) => {
                self.segmenter.greeting_in_progress = true;
                let _ = self
                    .scheduler
                    .send(sink, &stream_sid, &bytes, SendOptions::new("greeting").uninterruptible())
                    .await;
                self.segmenter.greeting_in_progress = false;
                self.initial_sent = true;
            }
            Err(e) => {
                tracing::error!(error = %e, "greeting synthesis failed; skipping greeting");
            }
        }
        Ok(())
    }

    /// Dispatches one inbound media frame to the VAD pipeline and returns
    /// an accepted segment's bytes if end-of-speech was just confirmed.
    /// Media is ignored entirely while the greeting is in flight, and
    /// barge-in is signaled to the scheduler on confirmed speech-start.
    pub fn on_media_frame(&mut self, mulaw_payload: &[u8]) -> Option<Vec<u8>> {
        if self.segmenter.greeting_in_progress {
            return None;
        }

        let agent_playing = self.scheduler.is_sending();
        let mut accepted = None;

        for frame in codec::rechunk_to_frames(mulaw_payload) {
            let result = self.segmenter.process_frame(frame, agent_playing);
            if result.speech_started {
                filler::on_speech_start(&self.scheduler);
            }
            if result.outcome == SegmentOutcome::Accepted {
                accepted = Some(self.segmenter.take_segment());
            }

            self.media_frame_count += 1;
            if self.media_log_every_n > 0 && self.media_frame_count % self.media_log_every_n == 0 {
                tracing::info!(
                    call_id = self.call_id.as_deref().unwrap_or("unbound"),
                    frames = self.media_frame_count,
                    speech_active = self.segmenter.speech_active(),
                    "media frame summary"
                );
            }
        }

        accepted
    }

    /// Merges a just-accepted segment into the pending buffer and (re)sets
    /// the merge-window deadline (spec §4.6). The caller's event loop is
    /// responsible for firing `take_pending_if_due` when the deadline
    /// elapses.
    pub fn enqueue_segment(&mut self, config: &Config, segment: Vec<u8>) {
        self.pending_segments.extend_from_slice(&segment);
        let window_ms = if self.scheduler.is_sending() {
            config.turn.merge_window_ms_while_playing
        } else {
            config.turn.merge_window_ms
        };
        self.pending_timer_deadline = Some(Instant::now() + Duration::from_millis(window_ms));
    }

    pub fn merge_deadline(&self) -> Option<Instant> {
        self.pending_timer_deadline
    }

    pub fn take_pending_segment(&mut self) -> Vec<u8> {
        self.pending_timer_deadline = None;
        std::mem::take(&mut self.pending_segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn handshake_requires_both_connected_and_start() {
        let config = Config::from_env();
        let mut session = CallSession::new(&config, None);
        assert!(!session.ready_for_greeting());
        session.on_connected();
        assert!(!session.ready_for_greeting());
        session.on_start("S1".to_string(), Some("C1".to_string()));
        assert!(session.ready_for_greeting());
        assert_eq!(session.call_id.as_deref(), Some("C1"));
    }

    #[test]
    fn greeting_attempted_only_once() {
        let config = Config::from_env();
        let mut session = CallSession::new(&config, None);
        session.on_connected();
        session.on_start("S1".to_string(), None);
        assert!(session.ready_for_greeting());
        session.greeting_attempted = true;
        assert!(!session.ready_for_greeting());
    }

    #[test]
    fn media_ignored_while_greeting_in_progress() {
        let config = Config::from_env();
        let mut session = CallSession::new(&config, None);
        session.segmenter.greeting_in_progress = true;
        let loud = codec::encode_mulaw(&vec![12000i16; codec::FRAME_BYTES]);
        assert!(session.on_media_frame(&loud).is_none());
    }

    #[test]
    fn handshake_timeout_deadline_clears_once_start_received() {
        let config = Config::from_env();
        let mut session = CallSession::new(&config, None);
        assert!(session.handshake_timeout_deadline().is_some());
        session.on_start("S1".to_string(), Some("C1".to_string()));
        assert!(session.handshake_timeout_deadline().is_none());
    }

    #[test]
    fn abandon_greeting_on_handshake_timeout_is_a_no_op_once_started() {
        let config = Config::from_env();
        let mut session = CallSession::new(&config, None);
        session.on_start("S1".to_string(), Some("C1".to_string()));
        assert!(!session.abandon_greeting_on_handshake_timeout());
        assert!(session.ready_for_greeting());

        let mut fresh = CallSession::new(&config, None);
        assert!(fresh.abandon_greeting_on_handshake_timeout());
        assert!(!fresh.ready_for_greeting());
    }
}
