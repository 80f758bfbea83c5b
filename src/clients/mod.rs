//! External service collaborators (spec.md §1 "out of scope", modeled as
//! narrow traits per SPEC_FULL.md §B): STT, LLM/classifier, TTS, call
//! registry, conversation log, and object storage. Each has one real
//! HTTP-backed implementation and one in-memory/stub implementation,
//! mirroring the teacher's `StubSTT` vs. `WhisperSTT` split in `stt/`.

pub mod llm;
pub mod log;
pub mod objectstore;
pub mod registry;
pub mod stt;
pub mod transcoder;
pub mod tts;

pub use llm::{ChatClient, ChatMessage, LlmError};
pub use log::{ConversationLog, LogError};
pub use objectstore::{ObjectStore, ObjectStoreError};
pub use registry::{CallRegistry, RegistryError, TtsBinding};
pub use stt::{SttClient, SttError};
pub use transcoder::{Transcoder, TranscoderError};
pub use tts::{TtsEngine, TtsError};
