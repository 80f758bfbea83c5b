//! Persistent conversation log client (spec.md §1 "out of scope",
//! concretized per SPEC_FULL.md §B). `CallSession` keeps its own local
//! mirror of the last N messages for LLM context; this client is the
//! durable append target, awaited before the corresponding TTS send begins
//! (spec §5 ordering guarantee).

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

use super::llm::ChatMessage;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("conversation log request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("conversation log upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },
}

#[async_trait]
pub trait ConversationLog: Send + Sync {
    async fn append_user(&self, call_id: &str, text: &str) -> Result<(), LogError>;
    async fn append_assistant(&self, call_id: &str, text: &str) -> Result<(), LogError>;
    /// Last `limit` messages, oldest first — used as LLM context (spec §4.6 step 5).
    async fn recent_messages(&self, call_id: &str, limit: usize) -> Result<Vec<ChatMessage>, LogError>;
}

#[derive(serde::Serialize)]
struct AppendRequest<'a> {
    call_id: &'a str,
    role: &'a str,
    text: &'a str,
}

pub struct HttpConversationLog {
    http: reqwest::Client,
    base_url: String,
}

impl HttpConversationLog {
    pub fn new(http: reqwest::Client, base_url: String) -> Self {
        Self { http, base_url }
    }

    async fn append(&self, call_id: &str, role: &str, text: &str) -> Result<(), LogError> {
        let resp = self
            .http
            .post(format!("{}/conversations/append", self.base_url))
            .json(&AppendRequest { call_id, role, text })
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LogError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ConversationLog for HttpConversationLog {
    async fn append_user(&self, call_id: &str, text: &str) -> Result<(), LogError> {
        self.append(call_id, "user", text).await
    }

    async fn append_assistant(&self, call_id: &str, text: &str) -> Result<(), LogError> {
        self.append(call_id, "assistant", text).await
    }

    async fn recent_messages(&self, call_id: &str, limit: usize) -> Result<Vec<ChatMessage>, LogError> {
        let resp = self
            .http
            .get(format!("{}/conversations/{}/messages", self.base_url, call_id))
            .query(&[("limit", limit.to_string())])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LogError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json().await?)
    }
}

/// In-memory log used by the simulator and tests; also serves sessions
/// whose `call_id` was never bound to a real telephony call (create-or-merge
/// semantics per spec §4.6 step 3).
#[derive(Default)]
pub struct InMemoryConversationLog {
    messages: Mutex<HashMap<String, Vec<ChatMessage>>>,
}

impl InMemoryConversationLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationLog for InMemoryConversationLog {
    async fn append_user(&self, call_id: &str, text: &str) -> Result<(), LogError> {
        self.messages
            .lock()
            .unwrap()
            .entry(call_id.to_string())
            .or_default()
            .push(ChatMessage::user(text));
        Ok(())
    }

    async fn append_assistant(&self, call_id: &str, text: &str) -> Result<(), LogError> {
        self.messages
            .lock()
            .unwrap()
            .entry(call_id.to_string())
            .or_default()
            .push(ChatMessage::assistant(text));
        Ok(())
    }

    async fn recent_messages(&self, call_id: &str, limit: usize) -> Result<Vec<ChatMessage>, LogError> {
        let guard = self.messages.lock().unwrap();
        let Some(all) = guard.get(call_id) else {
            return Ok(Vec::new());
        };
        let start = all.len().saturating_sub(limit);
        Ok(all[start..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_log_creates_on_first_append() {
        let log = InMemoryConversationLog::new();
        log.append_user("sim-1", "hello").await.unwrap();
        log.append_assistant("sim-1", "hi there").await.unwrap();
        let msgs = log.recent_messages("sim-1", 10).await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, "user");
    }

    #[tokio::test]
    async fn recent_messages_respects_limit() {
        let log = InMemoryConversationLog::new();
        for i in 0..5 {
            log.append_user("sim-1", &format!("msg{i}")).await.unwrap();
        }
        let msgs = log.recent_messages("sim-1", 2).await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].content, "msg4");
    }
}
