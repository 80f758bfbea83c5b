//! voicebridge-core
//!
//! Real-time voice-call agent: a telephony media WebSocket is bridged
//! through VAD-driven segmentation, an STT → intent-classify → LLM → TTS
//! turn pipeline, and a generation-cancelling audio scheduler that lets the
//! caller barge in on the agent at any time.
//!
//! # Pipeline
//!
//! ```text
//! /streams (WS) -> CallSession -> SpeechSegmenter -> turn::spawn_run_turn
//!                       |                                   |
//!                 AudioScheduler <---------------------------+
//!                       |
//!                   FrameSink (WsFrameSink over the same socket)
//! ```
//!
//! Greeting and filler audio are served from a two-tier (`TtsCache`)
//! memory/object-store cache; arbitrary LLM replies are synthesized fresh
//! every turn.

pub mod cache;
pub mod clients;
pub mod codec;
pub mod config;
pub mod error;
pub mod filler;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod state;
pub mod turn;
pub mod vad;
pub mod wire;

pub use error::AgentError;
pub use server::{AppState, SessionCommand};
pub use session::CallSession;
pub use state::AgentServices;
