// lib.rs - exports the conversation engine and its web surface
pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod llm;
pub mod middleware;
pub mod models;
pub mod orchestrator;
pub mod provenance;
pub mod store;
pub mod streams;

use std::sync::Arc;

use config::Config;
use engine::BranchEngine;
use llm::GenerativeModel;
use orchestrator::Orchestrator;
use store::SharedStore;
use streams::StreamRegistry;

// Re-export commonly used types for convenience
pub use error::ChatError;
pub use models::chat::{Branch, Chat, ChatMention, Message, Role};
pub use orchestrator::PostOutcome;

/// Shared application state, injected into every handler. The stream
/// registries are plain injected values, never globals, so tests can spin
/// up isolated instances.
pub struct AppState {
    pub config: Config,
    pub store: SharedStore,
    pub engine: BranchEngine,
    pub orchestrator: Orchestrator,
    pub reply_streams: Arc<StreamRegistry>,
    pub title_streams: Arc<StreamRegistry>,
}

impl AppState {
    pub fn new(config: Config, store: SharedStore, model: Arc<dyn GenerativeModel>) -> Self {
        let reply_streams = Arc::new(StreamRegistry::new());
        let title_streams = Arc::new(StreamRegistry::new());
        let orchestrator = Orchestrator::new(
            store.clone(),
            model,
            reply_streams.clone(),
            title_streams.clone(),
            config.title_timeout,
        );
        Self {
            engine: BranchEngine::new(store.clone()),
            store,
            orchestrator,
            reply_streams,
            title_streams,
            config,
        }
    }
}
