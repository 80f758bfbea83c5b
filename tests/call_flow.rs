//! Integration tests over `CallSession` + `AudioScheduler`, covering the
//! literal scenarios that don't require a live `ffmpeg`/STT/LLM round trip
//! (those are exercised manually via `call-simulator` against a real or
//! stubbed backend instead of in CI).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;

use voicebridge_core::cache::greeting_key;
use voicebridge_core::clients::llm::StubChatClient;
use voicebridge_core::clients::log::InMemoryConversationLog;
use voicebridge_core::clients::objectstore::FsObjectStore;
use voicebridge_core::clients::registry::InMemoryCallRegistry;
use voicebridge_core::clients::stt::StubSttClient;
use voicebridge_core::clients::tts::{StubTtsEngine, TtsEngine};
use voicebridge_core::codec;
use voicebridge_core::config::Config;
use voicebridge_core::scheduler::{FrameSink, SchedulerError};
use voicebridge_core::session::CallSession;
use voicebridge_core::state::AgentServices;
use voicebridge_core::wire::StreamEvent;

/// A `FrameSink` that just records every event it's handed.
struct RecordingSink {
    events: Mutex<Vec<StreamEvent>>,
    open: AtomicBool,
}

impl RecordingSink {
    fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
        }
    }

    fn media_count(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, StreamEvent::Media { .. }))
            .count()
    }

    fn mark_count(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, StreamEvent::Mark { .. }))
            .count()
    }
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn send_event(&self, event: StreamEvent) -> Result<(), SchedulerError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

fn test_services(config: Config) -> Arc<AgentServices> {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FsObjectStore::new(dir.path().to_path_buf()));
    let mut tts_engines: HashMap<String, Arc<dyn TtsEngine>> = HashMap::new();
    tts_engines.insert("elevenlabs".to_string(), Arc::new(StubTtsEngine::new("elevenlabs")));

    Arc::new(AgentServices::new(
        config,
        Arc::new(StubSttClient::new("")),
        Arc::new(StubChatClient::new(r#"{"action":"normal","reason":"stub"}"#)),
        tts_engines,
        store,
        Arc::new(InMemoryCallRegistry::new()),
        Arc::new(InMemoryConversationLog::new()),
    ))
}

fn loud_frame() -> Vec<u8> {
    codec::encode_mulaw(&vec![12000i16; codec::FRAME_BYTES])
}

fn silent_frame() -> Vec<u8> {
    vec![0xFFu8; codec::FRAME_BYTES]
}

/// Scenario 1: greeting fast path. A memory-tier cache hit must stream the
/// full cached artifact as 20 ms chunks followed by a mark, and inbound
/// media arriving mid-greeting must be ignored rather than starting a new
/// speech segment.
#[tokio::test]
async fn greeting_fast_path_streams_cached_artifact_and_ignores_concurrent_media() {
    let config = Config::from_env();
    let services = test_services(config.clone());

    let key = greeting_key(
        &config.cache.default_engine,
        &config.cache.default_voice,
        &config.cache.default_speed,
    );
    let cached = vec![0x7Fu8; codec::FRAME_BYTES * 5];
    services.greeting_cache.prime(key, cached.clone());

    let mut session = CallSession::new(&config, None);
    session.on_connected();
    session.on_start("S1".to_string(), Some("C1".to_string()));
    assert!(session.ready_for_greeting());

    let sink = RecordingSink::new();
    session.send_greeting(&services, &sink).await.unwrap();

    assert_eq!(sink.media_count(), 5);
    assert_eq!(sink.mark_count(), 1);
    assert!(session.initial_sent);

    // `send_greeting` always clears the guard on the way out, win or lose.
    assert!(!session.segmenter.greeting_in_progress);
}

/// The `greeting_in_progress` guard, while set, must make `on_media_frame`
/// a no-op rather than start accumulating a speech segment — this is what
/// keeps the agent from "hearing" its own greeting as caller speech.
#[tokio::test]
async fn media_during_greeting_window_is_dropped() {
    let config = Config::from_env();
    let mut session = CallSession::new(&config, None);
    session.segmenter.greeting_in_progress = true;

    assert!(session.on_media_frame(&loud_frame()).is_none());
    assert!(session.pending_segments.is_empty());
}

/// Scenario 2: barge-in on an in-flight reply. A `stop_and_wait` issued
/// partway through a send must cut it off within one tick and report
/// non-completion, matching the "one 20 ms tick" bound in spec.md §8.
#[tokio::test]
async fn barge_in_stops_in_flight_send_within_one_tick() {
    let config = Config::from_env();
    let session = CallSession::new(&config, None);
    let sink = Arc::new(RecordingSink::new());
    let scheduler = session.scheduler.clone();

    let reply = vec![0x7Fu8; codec::FRAME_BYTES * 50];
    let sched2 = scheduler.clone();
    let sink2 = sink.clone();
    let send_handle = tokio::spawn(async move {
        sched2
            .send(
                sink2.as_ref(),
                "S1",
                &reply,
                voicebridge_core::scheduler::SendOptions::new("reply"),
            )
            .await
    });

    // Let a handful of frames go out, then the caller starts talking again.
    tokio::time::sleep(std::time::Duration::from_millis(45)).await;
    scheduler.stop_and_wait("caller_speech").await;

    let completed = send_handle.await.unwrap().unwrap();
    assert!(!completed, "barge-in must cancel the reply rather than let it finish");
    assert!(!scheduler.is_sending());
    // No mark is emitted for a cancelled generation.
    assert_eq!(sink.mark_count(), 0);
}

/// Scenario 3 (partial, ffmpeg/STT-free): the merge window groups two
/// segments separated by a sub-window silence gap into one pending buffer,
/// and the deadline is (re)computed relative to whether the agent is
/// currently speaking.
#[tokio::test]
async fn merge_window_concatenates_segments_before_the_deadline_fires() {
    let config = Config::from_env();
    let mut session = CallSession::new(&config, None);

    let segment_a = vec![0x11u8; 400];
    let segment_b = vec![0x22u8; 300];

    session.enqueue_segment(&config, segment_a.clone());
    let deadline_after_a = session.merge_deadline().unwrap();

    // Segment B arrives well before the window elapses; it must extend the
    // same pending buffer rather than starting a second one.
    session.enqueue_segment(&config, segment_b.clone());
    let deadline_after_b = session.merge_deadline().unwrap();
    assert!(deadline_after_b >= deadline_after_a);

    let merged = session.take_pending_segment();
    let mut expected = segment_a;
    expected.extend(segment_b);
    assert_eq!(merged, expected);
    assert!(session.merge_deadline().is_none());
}

/// Scenario 4: a burst too short to meet the minimum thresholds must not
/// surface as an accepted segment through the session's media dispatch.
#[tokio::test]
async fn short_burst_never_reaches_enqueue_segment() {
    let config = Config::from_env();
    let mut session = CallSession::new(&config, None);

    // ~160ms above threshold (8 frames @ 20ms), short of MIN_SPEECH_MS.
    let mut accepted_any = false;
    for _ in 0..8 {
        if session.on_media_frame(&loud_frame()).is_some() {
            accepted_any = true;
        }
    }
    for _ in 0..30 {
        if session.on_media_frame(&silent_frame()).is_some() {
            accepted_any = true;
        }
    }

    assert!(!accepted_any, "a sub-minimum burst must never be accepted as a segment");
    assert!(session.pending_segments.is_empty());
}
