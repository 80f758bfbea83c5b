//! Voice activity detection and speech segmentation (C2).
//!
//! Grounded on the teacher's `vad/production.rs` `SentenceBuffer` (warmup
//! confirmation, trailing-silence trim, discard thresholds) generalized to
//! this crate's context-dependent idle/while-playing thresholds and the
//! `codec::is_silent_frame` fast path instead of the teacher's missing
//! Silero/WebRTC backends.

use crate::codec::{self, FRAME_BYTES, FRAME_MS};
use crate::config::VadConfig;

/// Per-frame activity level on a 0-100 scale, or the fast-path idle verdict.
fn frame_level(frame: &[u8]) -> u32 {
    if codec::is_silent_frame(frame) {
        return 0;
    }
    let pcm = codec::decode_mulaw(frame);
    codec::rms_level(&pcm)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentOutcome {
    /// Still accumulating; no EOS yet.
    Continuing,
    /// EOS confirmed and the accumulated segment met the minimum thresholds.
    Accepted,
    /// EOS confirmed but the segment was noise (below minimum thresholds).
    Discarded,
}

/// Per-session speech segmentation state (spec §3 VAD state, §4.2).
///
/// One instance lives inside each `CallSession`. All methods are called
/// from the session's single serialized event loop, so no internal
/// synchronization is needed.
pub struct SpeechSegmenter {
    cfg: VadConfig,
    speech_active: bool,
    warmup_count: u32,
    segment_frames: Vec<Vec<u8>>,
    last_nonsilent_index: Option<usize>,
    frames_since_last_speech: u64,
    /// Suppresses all VAD output while the initial greeting is in flight
    /// (spec §4.2 guard: "the greeting never barges itself out").
    pub greeting_in_progress: bool,
}

impl SpeechSegmenter {
    pub fn new(cfg: VadConfig) -> Self {
        Self {
            cfg,
            speech_active: false,
            warmup_count: 0,
            segment_frames: Vec::new(),
            last_nonsilent_index: None,
            frames_since_last_speech: 0,
            greeting_in_progress: false,
        }
    }

    pub fn speech_active(&self) -> bool {
        self.speech_active
    }

    /// Process one inbound frame. `agent_playing` selects the
    /// context-dependent threshold/warmup pair. Returns `Some(true)` the
    /// instant speech-start is confirmed (for barge-in signaling), and the
    /// segmentation outcome for EOS handling.
    pub fn process_frame(&mut self, frame: &[u8], agent_playing: bool) -> FrameResult {
        if self.greeting_in_progress {
            return FrameResult {
                speech_started: false,
                outcome: SegmentOutcome::Continuing,
            };
        }

        let level = frame_level(frame);
        let threshold = if agent_playing {
            self.cfg.threshold_while_playing
        } else {
            self.cfg.threshold_idle
        };
        let warmup_needed = if agent_playing {
            self.cfg.warmup_frames_while_playing
        } else {
            self.cfg.warmup_frames_idle
        };
        let above = level >= threshold;

        let mut speech_started = false;

        if !self.speech_active {
            if above {
                self.warmup_count += 1;
                if self.warmup_count >= warmup_needed {
                    self.speech_active = true;
                    speech_started = true;
                    self.segment_frames.clear();
                    self.last_nonsilent_index = None;
                    self.frames_since_last_speech = 0;
                } else {
                    // Not yet confirmed; still accumulate so the confirmed
                    // segment includes the warmup frames once started.
                    self.segment_frames.push(frame.to_vec());
                    return FrameResult {
                        speech_started: false,
                        outcome: SegmentOutcome::Continuing,
                    };
                }
            } else {
                self.warmup_count = 0;
                self.segment_frames.clear();
                return FrameResult {
                    speech_started: false,
                    outcome: SegmentOutcome::Continuing,
                };
            }
        }

        // Speech is (now) active: accumulate verbatim, including interior
        // silence, per spec (dropping it distorts TTS-grade transcription).
        self.segment_frames.push(frame.to_vec());
        if above {
            self.last_nonsilent_index = Some(self.segment_frames.len() - 1);
            self.frames_since_last_speech = 0;
        } else {
            self.frames_since_last_speech += 1;
        }

        let silence_ms = self.frames_since_last_speech * FRAME_MS;
        if above || silence_ms < self.cfg.silence_ms {
            return FrameResult {
                speech_started,
                outcome: SegmentOutcome::Continuing,
            };
        }

        // EOS: trailing silence exceeded threshold.
        let outcome = self.finish_segment();
        FrameResult {
            speech_started,
            outcome,
        }
    }

    fn finish_segment(&mut self) -> SegmentOutcome {
        let trimmed_len = self.last_nonsilent_index.map(|i| i + 1).unwrap_or(0);
        self.segment_frames.truncate(trimmed_len);

        let frame_count = self.segment_frames.len() as u32;
        let byte_count: usize = self.segment_frames.iter().map(|f| f.len()).sum();
        let duration_ms = frame_count as u64 * FRAME_MS;

        let accepted = frame_count >= self.cfg.min_speech_frames
            && byte_count >= self.cfg.min_speech_bytes
            && duration_ms >= self.cfg.min_speech_ms;

        self.speech_active = false;
        self.warmup_count = 0;
        self.last_nonsilent_index = None;
        self.frames_since_last_speech = 0;

        if accepted {
            SegmentOutcome::Accepted
        } else {
            self.segment_frames.clear();
            SegmentOutcome::Discarded
        }
    }

    /// Take the accumulated μ-law bytes of the last accepted segment,
    /// clearing internal storage. Call only after `process_frame` returns
    /// `SegmentOutcome::Accepted`.
    pub fn take_segment(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.segment_frames)
            .into_iter()
            .flatten()
            .collect()
    }
}

pub struct FrameResult {
    pub speech_started: bool,
    pub outcome: SegmentOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> VadConfig {
        VadConfig {
            threshold_idle: 2,
            threshold_while_playing: 6,
            warmup_frames_idle: 2,
            warmup_frames_while_playing: 4,
            silence_ms: 400,
            min_speech_frames: 10,
            min_speech_bytes: 1600,
            min_speech_ms: 400,
        }
    }

    fn silent_frame() -> Vec<u8> {
        vec![0xFFu8; FRAME_BYTES]
    }

    fn loud_frame() -> Vec<u8> {
        // Encode a mid-amplitude PCM tone sample repeated across the frame.
        let pcm = vec![12000i16; FRAME_BYTES];
        codec::encode_mulaw(&pcm)
    }

    #[test]
    fn below_minimum_segment_is_discarded() {
        let mut seg = SpeechSegmenter::new(cfg());
        // 150ms above threshold (~7-8 frames) then silence past SILENCE_MS.
        for _ in 0..8 {
            seg.process_frame(&loud_frame(), false);
        }
        let mut last = None;
        for _ in 0..30 {
            let r = seg.process_frame(&silent_frame(), false);
            if r.outcome != SegmentOutcome::Continuing {
                last = Some(r.outcome);
                break;
            }
        }
        assert_eq!(last, Some(SegmentOutcome::Discarded));
        assert!(!seg.speech_active());
    }

    #[test]
    fn accepted_segment_meets_minimums() {
        let mut seg = SpeechSegmenter::new(cfg());
        for _ in 0..25 {
            seg.process_frame(&loud_frame(), false);
        }
        let mut outcome = None;
        for _ in 0..30 {
            let r = seg.process_frame(&silent_frame(), false);
            if r.outcome != SegmentOutcome::Continuing {
                outcome = Some(r.outcome);
                break;
            }
        }
        assert_eq!(outcome, Some(SegmentOutcome::Accepted));
        let bytes = seg.take_segment();
        assert!(bytes.len() >= cfg().min_speech_bytes);
    }

    #[test]
    fn greeting_in_progress_suppresses_speech_start() {
        let mut seg = SpeechSegmenter::new(cfg());
        seg.greeting_in_progress = true;
        for _ in 0..10 {
            let r = seg.process_frame(&loud_frame(), false);
            assert!(!r.speech_started);
            assert_eq!(r.outcome, SegmentOutcome::Continuing);
        }
        assert!(!seg.speech_active());
    }

    #[test]
    fn while_playing_uses_higher_threshold_and_warmup() {
        let mut seg = SpeechSegmenter::new(cfg());
        // A frame loud enough to cross the idle threshold (2) but not
        // necessarily the while-playing threshold (6) would need tuning;
        // instead verify the warmup count requirement alone using a loud
        // frame that crosses both thresholds, needing 4 consecutive frames
        // while playing vs 2 while idle.
        let mut started_at = None;
        for i in 0..10 {
            let r = seg.process_frame(&loud_frame(), true);
            if r.speech_started {
                started_at = Some(i);
                break;
            }
        }
        assert_eq!(started_at, Some(3), "expected speech-start on the 4th frame while playing");
    }
}
