//! Process-wide shared services: clients, caches, and configuration built
//! once at startup and handed to every session (spec §5 "shared resources").

use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::TtsCache;
use crate::clients::{CallRegistry, ChatClient, ConversationLog, ObjectStore, SttClient, Transcoder, TtsEngine};
use crate::config::Config;

pub struct AgentServices {
    pub config: Config,
    pub stt: Arc<dyn SttClient>,
    pub llm: Arc<dyn ChatClient>,
    pub tts_engines: HashMap<String, Arc<dyn TtsEngine>>,
    pub transcoder: Arc<Transcoder>,
    pub greeting_cache: Arc<TtsCache>,
    pub filler_cache: Arc<TtsCache>,
    pub registry: Arc<dyn CallRegistry>,
    pub log: Arc<dyn ConversationLog>,
}

impl AgentServices {
    pub fn new(
        config: Config,
        stt: Arc<dyn SttClient>,
        llm: Arc<dyn ChatClient>,
        tts_engines: HashMap<String, Arc<dyn TtsEngine>>,
        object_store: Arc<dyn ObjectStore>,
        registry: Arc<dyn CallRegistry>,
        log: Arc<dyn ConversationLog>,
    ) -> Self {
        let bucket = config.cache.object_store_bucket.clone();
        Self {
            transcoder: Arc::new(Transcoder::new()),
            greeting_cache: Arc::new(TtsCache::new(object_store.clone(), bucket.clone())),
            filler_cache: Arc::new(TtsCache::new(object_store, bucket)),
            config,
            stt,
            llm,
            tts_engines,
            registry,
            log,
        }
    }

    pub fn tts_engine(&self, name: &str) -> Option<Arc<dyn TtsEngine>> {
        self.tts_engines.get(name).cloned()
    }
}
