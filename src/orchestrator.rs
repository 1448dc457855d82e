// src/orchestrator.rs
//! Coordinates one inbound user message end to end: resolve or create the
//! chat, fork or continue the branch, kick off background reply generation
//! publishing into the stream registry, and race title generation for
//! brand-new chats. Generation outlives the request that triggered it; a
//! disconnected reader never cancels it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::engine::BranchEngine;
use crate::error::ChatError;
use crate::llm::GenerativeModel;
use crate::models::chat::{Branch, Chat, ChatMention, Message};
use crate::store::{ChatStore, SharedStore};
use crate::streams::{StreamPublisher, StreamRegistry};

/// Caller-visible result of posting a user message.
#[derive(Debug, Clone, PartialEq)]
pub enum PostOutcome {
    /// The chat or branch was just created: the caller must navigate to
    /// the branch address and pick the reply up from the stream.
    Redirect { chat_id: Uuid, branch_id: Uuid },
    /// Existing branch: the appended user message renders immediately and
    /// the reply arrives over the stream.
    Posted { message: Message },
}

pub struct Orchestrator {
    engine: BranchEngine,
    store: SharedStore,
    model: Arc<dyn GenerativeModel>,
    reply_streams: Arc<StreamRegistry>,
    title_streams: Arc<StreamRegistry>,
    /// Branches with a generation in flight. One generation per branch at
    /// a time; this also makes the fork record single-writer.
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    title_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        store: SharedStore,
        model: Arc<dyn GenerativeModel>,
        reply_streams: Arc<StreamRegistry>,
        title_streams: Arc<StreamRegistry>,
        title_timeout: Duration,
    ) -> Self {
        Self {
            engine: BranchEngine::new(store.clone()),
            store,
            model,
            reply_streams,
            title_streams,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            title_timeout,
        }
    }

    /// Handle one inbound user message. Validation happens before any
    /// write; the reply stream is live by the time this returns Ok.
    pub async fn post_user_message(
        &self,
        chat_id: Uuid,
        branch_id: Uuid,
        prompt: &str,
        mentions: &[ChatMention],
    ) -> Result<PostOutcome, ChatError> {
        if prompt.trim().is_empty() {
            return Err(ChatError::validation("prompt shouldn't be empty"));
        }
        let user_msg = Message::user(prompt);

        let (chat, chat_created) = self.engine.resolve_or_create_chat(chat_id).await?;
        if chat_created {
            let title_stream = self.title_streams.allocate(chat_id).await;
            self.spawn_title_generation(title_stream, chat_id, prompt.to_string());
        }

        // Single writer per branch: the guard covers the fork record and
        // the whole generation, so two concurrent first-messages cannot
        // both write a branch-created entry.
        if !self.in_flight.lock().await.insert(branch_id) {
            return Err(ChatError::GenerationInProgress(branch_id));
        }
        match self
            .prepare_and_launch(chat, chat_created, branch_id, user_msg, mentions)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                // Generation never started; the guard is ours to return.
                self.in_flight.lock().await.remove(&branch_id);
                Err(err)
            }
        }
    }

    async fn prepare_and_launch(
        &self,
        chat: Chat,
        chat_created: bool,
        branch_id: Uuid,
        user_msg: Message,
        mentions: &[ChatMention],
    ) -> Result<PostOutcome, ChatError> {
        let chat_id = chat.id;
        let branch = self.engine.resolve_branch(chat_id, branch_id).await?;
        let branch_created = branch.messages.is_empty();
        let branch = BranchEngine::append_to_branch(branch, user_msg.clone());

        // A fresh branch is persisted and its fork recorded before
        // generation starts, so the log never trails the stream.
        if branch_created {
            self.engine.record_fork(&chat, &branch).await?;
        }

        let mut mentioned = Vec::with_capacity(mentions.len());
        for mention in mentions {
            let found = self
                .store
                .find_chat(mention.id)
                .await?
                .ok_or(ChatError::NotFound("mentioned chat"))?;
            self.store.save_mention(chat_id, mention.id).await?;
            mentioned.push(found);
        }

        let publisher = self.reply_streams.allocate(branch_id).await;
        self.spawn_reply_generation(publisher, chat, branch, mentioned);

        if chat_created || branch_created {
            tracing::info!(%chat_id, %branch_id, "new chat & branch created");
            Ok(PostOutcome::Redirect { chat_id, branch_id })
        } else {
            Ok(PostOutcome::Posted { message: user_msg })
        }
    }

    fn spawn_reply_generation(
        &self,
        publisher: StreamPublisher,
        chat: Chat,
        branch: Branch,
        mentioned: Vec<Chat>,
    ) {
        let store = Arc::clone(&self.store);
        let model = Arc::clone(&self.model);
        let streams = Arc::clone(&self.reply_streams);
        let in_flight = Arc::clone(&self.in_flight);

        tokio::spawn(async move {
            let chat_id = chat.id;
            let branch_id = branch.id;

            // Effective history: trunk at current chat state, then the
            // branch's own messages including the just-appended prompt.
            let mut history = chat.messages;
            history.extend(branch.messages.iter().cloned());

            match model.generate_reply(&history, &mentioned, &publisher).await {
                Ok(text) => {
                    let mut branch = branch;
                    branch.messages.push(Message::model(text));
                    if let Err(err) = store
                        .save_branch_messages(chat_id, branch_id, &branch.messages)
                        .await
                    {
                        // Nobody is waiting on this request anymore; the
                        // failure goes to the operators, not a client.
                        tracing::error!(
                            %chat_id, %branch_id,
                            "failed to persist branch after generation: {err}"
                        );
                    }
                }
                Err(err) => {
                    tracing::error!(%chat_id, %branch_id, "reply generation failed: {err}");
                }
            }

            // Close the channel before removing the entry so a mid-read
            // subscriber drains the tail and then sees end-of-stream.
            drop(publisher);
            streams.release(branch_id).await;
            in_flight.lock().await.remove(&branch_id);
        });
    }

    fn spawn_title_generation(&self, publisher: StreamPublisher, chat_id: Uuid, prompt: String) {
        let store = Arc::clone(&self.store);
        let model = Arc::clone(&self.model);
        let streams = Arc::clone(&self.title_streams);

        tokio::spawn(async move {
            match model.generate_title(&prompt).await {
                Ok(title) => {
                    publisher.publish(title.clone());
                    if let Err(err) = store.save_chat_title(chat_id, &title).await {
                        tracing::error!(%chat_id, "failed to persist generated title: {err}");
                    }
                }
                Err(err) => {
                    // The chat keeps its placeholder; retrying is up to
                    // the caller. Reply generation is unaffected.
                    tracing::error!(%chat_id, "title generation failed: {err}");
                }
            }
            drop(publisher);
            streams.release(chat_id).await;
        });
    }

    /// Bounded wait for the generated title of `chat_id`. `None` means no
    /// generation is running, it failed, or it outran the deadline; the
    /// chat keeps its placeholder title in all three cases.
    pub async fn await_title(&self, chat_id: Uuid) -> Option<String> {
        let mut sub = self.title_streams.subscribe(chat_id).await?;
        match tokio::time::timeout(self.title_timeout, sub.next_fragment()).await {
            Ok(title) => title,
            Err(_) => {
                tracing::warn!(%chat_id, "timed out waiting for generated title");
                None
            }
        }
    }
}
