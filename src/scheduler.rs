//! Audio-send scheduler (C3): paced, generation-tagged, cooperatively
//! cancellable outbound μ-law streaming.
//!
//! Grounded on the teacher's `adapter.rs` `OutputAdapter` shape, generalized
//! from a single `write(frame)` call into the full generational-cancellation
//! contract spec.md §4.3 and §9 call for (ad-hoc boolean "is this cancelled"
//! flags don't compose once barge-in, filler-interrupt, and new-turn-cancel
//! all want to cancel the same in-flight send for different reasons).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::sleep;
use uuid::Uuid;

use crate::codec::{FRAME_BYTES, FRAME_MS};
use crate::wire::StreamEvent;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("stream not ready: socket is not OPEN or stream_sid unknown")]
    StreamNotReady,
    #[error("failed to send frame to peer: {0}")]
    SendFailed(String),
}

/// Destination for outbound wire events. Implemented by the session's
/// WebSocket writer side (see `server.rs`); kept as a trait here so the
/// scheduler has no direct axum dependency and is unit-testable with a
/// channel-backed fake.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_event(&self, event: StreamEvent) -> Result<(), SchedulerError>;
    fn is_open(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct SendOptions {
    pub label: String,
    pub uninterruptible: bool,
}

impl SendOptions {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            uninterruptible: false,
        }
    }

    pub fn uninterruptible(mut self) -> Self {
        self.uninterruptible = true;
        self
    }
}

/// Per-session scheduler state. One instance lives inside each
/// `CallSession`; `send` is only ever invoked from the session's single
/// serialized event loop (spec §5), so the atomics below only need to
/// coordinate with `request_stop`/`stop_and_wait` calls made from the same
/// loop or from a concurrent barge-in signal — never with another `send`.
pub struct AudioScheduler {
    active_gen: AtomicU64,
    stop_gen: AtomicU64,
    uninterruptible_gen: AtomicU64,
    sending: AtomicBool,
    greeting_in_progress: AtomicBool,
    done: Notify,
}

impl Default for AudioScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioScheduler {
    pub fn new() -> Self {
        Self {
            active_gen: AtomicU64::new(0),
            stop_gen: AtomicU64::new(0),
            uninterruptible_gen: AtomicU64::new(0),
            sending: AtomicBool::new(false),
            greeting_in_progress: AtomicBool::new(false),
            done: Notify::new(),
        }
    }

    pub fn is_sending(&self) -> bool {
        self.sending.load(Ordering::SeqCst)
    }

    pub fn greeting_in_progress(&self) -> bool {
        self.greeting_in_progress.load(Ordering::SeqCst)
    }

    pub fn active_gen(&self) -> u64 {
        self.active_gen.load(Ordering::SeqCst)
    }

    /// Sets `stop_gen := active_gen` unless the active generation is
    /// uninterruptible. Returns whether a stop was actually requested.
    pub fn request_stop(&self, reason: &str) -> bool {
        let active = self.active_gen.load(Ordering::SeqCst);
        if active == 0 {
            return false;
        }
        if self.uninterruptible_gen.load(Ordering::SeqCst) == active {
            tracing::debug!(reason, gen = active, "stop request ignored: uninterruptible");
            return false;
        }
        self.stop_gen.store(active, Ordering::SeqCst);
        true
    }

    /// Requests cancellation and waits for the in-flight send (if any) to
    /// observe it and finish. Callers must call this before starting a new
    /// send (spec §4.3: "only one send may be in flight per session").
    pub async fn stop_and_wait(&self, reason: &str) {
        self.request_stop(reason);
        while self.sending.load(Ordering::SeqCst) {
            self.done.notified().await;
        }
    }

    /// Streams `mulaw` to the peer as exact 160-byte chunks paced 20 ms
    /// apart. Returns `Ok(true)` on natural completion (and the peer
    /// receives a trailing `mark` event), `Ok(false)` if cancelled.
    pub async fn send(
        &self,
        sink: &dyn FrameSink,
        stream_sid: &str,
        mulaw: &[u8],
        opts: SendOptions,
    ) -> Result<bool, SchedulerError> {
        if stream_sid.is_empty() || !sink.is_open() {
            return Err(SchedulerError::StreamNotReady);
        }

        let gen = self.active_gen.fetch_add(1, Ordering::SeqCst) + 1;
        self.sending.store(true, Ordering::SeqCst);
        if opts.uninterruptible {
            self.uninterruptible_gen.store(gen, Ordering::SeqCst);
        }
        if opts.label == "greeting" {
            self.greeting_in_progress.store(true, Ordering::SeqCst);
        }

        let result = self.run_send(sink, stream_sid, mulaw, gen).await;

        self.sending.store(false, Ordering::SeqCst);
        if self.uninterruptible_gen.load(Ordering::SeqCst) == gen {
            self.uninterruptible_gen.store(0, Ordering::SeqCst);
        }
        if opts.label == "greeting" {
            self.greeting_in_progress.store(false, Ordering::SeqCst);
        }
        self.done.notify_one();

        result
    }

    async fn run_send(
        &self,
        sink: &dyn FrameSink,
        stream_sid: &str,
        mulaw: &[u8],
        gen: u64,
    ) -> Result<bool, SchedulerError> {
        let mut first = true;
        for chunk in mulaw.chunks(FRAME_BYTES) {
            if self.stop_gen.load(Ordering::SeqCst) == gen {
                return Ok(false);
            }
            if !first {
                sleep(Duration::from_millis(FRAME_MS)).await;
                if self.stop_gen.load(Ordering::SeqCst) == gen {
                    return Ok(false);
                }
            }
            first = false;

            let b64 = base64::engine::general_purpose::STANDARD.encode(chunk);
            sink.send_event(StreamEvent::media_outbound(stream_sid, b64))
                .await?;
        }

        let mark_name = format!("send-{}", Uuid::new_v4());
        sink.send_event(StreamEvent::mark(stream_sid, mark_name))
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
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

    #[tokio::test]
    async fn completes_and_emits_mark() {
        let sink = RecordingSink::new();
        let sched = AudioScheduler::new();
        let payload = vec![0u8; FRAME_BYTES * 3];

        let completed = sched
            .send(&sink, "S1", &payload, SendOptions::new("reply"))
            .await
            .unwrap();

        assert!(completed);
        assert!(!sched.is_sending());
        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 4); // 3 media + 1 mark
        assert!(matches!(events.last().unwrap(), StreamEvent::Mark { .. }));
    }

    #[tokio::test]
    async fn request_stop_is_ignored_for_uninterruptible_generation() {
        let sink = RecordingSink::new();
        let sched = AudioScheduler::new();
        let payload = vec![0u8; FRAME_BYTES * 5];

        let send_fut = sched.send(
            &sink,
            "S1",
            &payload,
            SendOptions::new("greeting").uninterruptible(),
        );

        // Give the send a moment to allocate its generation before we try
        // to stop it; request_stop should be a no-op either way.
        let stopped = sched.request_stop("caller_speech");
        let completed = send_fut.await.unwrap();

        assert!(!stopped);
        assert!(completed);
    }

    #[tokio::test]
    async fn stop_and_wait_cancels_in_flight_send() {
        let sink = std::sync::Arc::new(RecordingSink::new());
        let sched = std::sync::Arc::new(AudioScheduler::new());
        let payload = vec![0u8; FRAME_BYTES * 50];

        let sched2 = sched.clone();
        let sink2 = sink.clone();
        let handle = tokio::spawn(async move {
            sched2
                .send(sink2.as_ref(), "S1", &payload, SendOptions::new("reply"))
                .await
        });

        sleep(Duration::from_millis(25)).await;
        sched.stop_and_wait("caller_speech").await;
        assert!(!sched.is_sending());

        let completed = handle.await.unwrap().unwrap();
        assert!(!completed);
    }
}
