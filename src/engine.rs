// src/engine.rs
//! Mutations over the chat/branch model: create, fork, append, merge.
//! Every persisted structural change leaves a provenance record behind.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::ChatError;
use crate::models::chat::{Branch, Chat, Message};
use crate::provenance::{BranchCreated, BranchMerged, LogEntry};
use crate::store::ChatStore;

#[derive(Clone)]
pub struct BranchEngine {
    store: Arc<dyn ChatStore>,
}

impl BranchEngine {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }

    /// Fetch a chat, creating and persisting it first if absent. Creation
    /// persists immediately so concurrent title generation or merges never
    /// race a chat that only exists in memory. The returned flag drives
    /// title generation and the redirect response policy.
    pub async fn resolve_or_create_chat(&self, id: Uuid) -> Result<(Chat, bool), ChatError> {
        if let Some(chat) = self.store.find_chat(id).await? {
            return Ok((chat, false));
        }
        let chat = Chat::new(id);
        self.store.save_chat(&chat).await?;
        tracing::info!(chat_id = %id, "created new chat");
        Ok((chat, true))
    }

    /// Fetch a branch; an unknown ID decays to an empty branch bound to
    /// it. Branches materialize in storage on their first message.
    pub async fn resolve_branch(&self, chat_id: Uuid, branch_id: Uuid) -> Result<Branch, ChatError> {
        match self.store.find_branch(chat_id, branch_id).await? {
            Some(messages) => Ok(Branch {
                id: branch_id,
                messages,
            }),
            None => Ok(Branch::empty(branch_id)),
        }
    }

    /// Pure transform; persistence is the caller's explicit next step so
    /// it can decide whether this append constitutes a fork event.
    pub fn append_to_branch(mut branch: Branch, message: Message) -> Branch {
        branch.messages.push(message);
        branch
    }

    /// First message on a fresh branch: persist its messages and record
    /// the fork, capturing the trunk length as the fork point. Runs before
    /// generation starts, so a log reader never observes generation
    /// activity without the fork record.
    pub async fn record_fork(&self, chat: &Chat, branch: &Branch) -> Result<(), ChatError> {
        self.store
            .save_branch_messages(chat.id, branch.id, &branch.messages)
            .await?;
        let entry = LogEntry::BranchCreated(BranchCreated {
            branch_id: branch.id,
            origin_message_idx: chat.messages.len(),
        });
        self.store
            .save_log_entry(chat.id, entry.action(), entry.payload())
            .await?;
        tracing::info!(chat_id = %chat.id, branch_id = %branch.id, "recorded branch fork");
        Ok(())
    }

    /// Fold selected branch messages back into the chat trunk, in original
    /// branch order. `None` applies the default policy: first and last
    /// branch message. The merged-at index and count land in the log so
    /// "where did branch X's messages go" stays answerable.
    pub async fn merge_branch(
        &self,
        mut chat: Chat,
        branch: &Branch,
        selection: Option<Vec<usize>>,
    ) -> Result<Chat, ChatError> {
        let mut indices = match selection {
            Some(indices) => indices,
            None => default_selection(branch),
        };
        indices.sort_unstable();
        indices.dedup();

        if indices.is_empty() {
            return Err(ChatError::validation("merge selection must not be empty"));
        }
        if let Some(&out_of_range) = indices.iter().find(|&&i| i >= branch.messages.len()) {
            return Err(ChatError::Validation(format!(
                "merge index {out_of_range} is out of range for a branch of {} messages",
                branch.messages.len()
            )));
        }

        let merged_at_idx = chat.messages.len();
        let merged_count = indices.len();
        chat.messages
            .extend(indices.iter().map(|&i| branch.messages[i].clone()));

        self.store
            .update_chat_messages(chat.id, &chat.messages)
            .await?;
        let entry = LogEntry::BranchMerged(BranchMerged {
            branch_id: branch.id,
            merged_at_idx,
            merged_count,
        });
        self.store
            .save_log_entry(chat.id, entry.action(), entry.payload())
            .await?;
        tracing::info!(
            chat_id = %chat.id,
            branch_id = %branch.id,
            merged_count,
            "merged branch into trunk"
        );
        Ok(chat)
    }

    /// A branch can be merged once it holds the seed user message and at
    /// least one reply.
    pub fn mergeable(branch: &Branch) -> bool {
        branch.messages.len() >= 2
    }
}

/// Reference merge policy: the seed message and the latest reply.
fn default_selection(branch: &Branch) -> Vec<usize> {
    match branch.messages.len() {
        0 => Vec::new(),
        len => vec![0, len - 1],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::PLACEHOLDER_TITLE;
    use crate::provenance::decode_log;
    use crate::store::MemStore;

    fn engine() -> (BranchEngine, Arc<MemStore>) {
        let store = Arc::new(MemStore::new());
        (BranchEngine::new(store.clone()), store)
    }

    fn branch_with(id: Uuid, texts: &[&str]) -> Branch {
        Branch {
            id,
            messages: texts.iter().map(|t| Message::user(*t)).collect(),
        }
    }

    #[tokio::test]
    async fn test_resolve_or_create_persists_new_chat() {
        let (engine, store) = engine();
        let id = Uuid::new_v4();

        let (chat, created) = engine.resolve_or_create_chat(id).await.unwrap();
        assert!(created);
        assert_eq!(chat.title, PLACEHOLDER_TITLE);
        assert!(chat.messages.is_empty());
        assert!(store.find_chat(id).await.unwrap().is_some());

        let (_, created_again) = engine.resolve_or_create_chat(id).await.unwrap();
        assert!(!created_again);
    }

    #[tokio::test]
    async fn test_resolve_branch_decays_to_empty() {
        let (engine, _) = engine();
        let branch_id = Uuid::new_v4();
        let branch = engine
            .resolve_branch(Uuid::new_v4(), branch_id)
            .await
            .unwrap();
        assert_eq!(branch.id, branch_id);
        assert!(branch.messages.is_empty());
    }

    #[tokio::test]
    async fn test_record_fork_captures_trunk_length() {
        let (engine, store) = engine();
        let mut chat = Chat::new(Uuid::new_v4());
        chat.messages = vec![Message::user("q"), Message::model("a")];
        store.save_chat(&chat).await.unwrap();

        let branch = branch_with(Uuid::new_v4(), &["fork here"]);
        engine.record_fork(&chat, &branch).await.unwrap();

        let log = decode_log(&store.find_log(chat.id).await.unwrap()).unwrap();
        assert_eq!(log.len(), 1);
        match &log[0] {
            LogEntry::BranchCreated(meta) => {
                assert_eq!(meta.branch_id, branch.id);
                assert_eq!(meta.origin_message_idx, 2);
            }
            other => panic!("unexpected log entry: {other:?}"),
        }
        assert_eq!(
            store.find_branch(chat.id, branch.id).await.unwrap().unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_merge_appends_selection_in_branch_order() {
        // Existing chat with two trunk messages, branch with three; merging
        // {0, 2} lands [m1, m3] on the trunk and logs the pre-merge index.
        let (engine, store) = engine();
        let mut chat = Chat::new(Uuid::new_v4());
        chat.messages = vec![Message::user("t1"), Message::model("t2")];
        store.save_chat(&chat).await.unwrap();

        let branch = branch_with(Uuid::new_v4(), &["m1", "m2", "m3"]);
        // Deliberately unordered selection; merge preserves branch order.
        let merged = engine
            .merge_branch(chat.clone(), &branch, Some(vec![2, 0]))
            .await
            .unwrap();

        let texts: Vec<&str> = merged.messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["t1", "t2", "m1", "m3"]);

        let persisted = store.find_chat(chat.id).await.unwrap().unwrap();
        assert_eq!(persisted.messages.len(), 4);

        let log = decode_log(&store.find_log(chat.id).await.unwrap()).unwrap();
        match &log[0] {
            LogEntry::BranchMerged(meta) => {
                assert_eq!(meta.merged_at_idx, 2);
                assert_eq!(meta.merged_count, 2);
            }
            other => panic!("unexpected log entry: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_merge_rejects_empty_selection() {
        let (engine, store) = engine();
        let chat = Chat::new(Uuid::new_v4());
        store.save_chat(&chat).await.unwrap();
        let branch = branch_with(Uuid::new_v4(), &["m1", "m2"]);

        let err = engine
            .merge_branch(chat.clone(), &branch, Some(Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));

        // Trunk unchanged, no log entry written.
        let persisted = store.find_chat(chat.id).await.unwrap().unwrap();
        assert!(persisted.messages.is_empty());
        assert!(store.find_log(chat.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_merge_rejects_out_of_range_selection() {
        let (engine, store) = engine();
        let chat = Chat::new(Uuid::new_v4());
        store.save_chat(&chat).await.unwrap();
        let branch = branch_with(Uuid::new_v4(), &["m1"]);

        let err = engine
            .merge_branch(chat.clone(), &branch, Some(vec![3]))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
        assert!(store.find_log(chat.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_merge_default_selection_takes_first_and_last() {
        let (engine, _) = engine();
        let chat = Chat::new(Uuid::new_v4());
        let branch = branch_with(Uuid::new_v4(), &["seed", "mid", "reply"]);

        let merged = engine.merge_branch(chat, &branch, None).await.unwrap();
        let texts: Vec<&str> = merged.messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["seed", "reply"]);
    }

    #[tokio::test]
    async fn test_merge_default_selection_on_empty_branch_fails() {
        let (engine, _) = engine();
        let chat = Chat::new(Uuid::new_v4());
        let branch = Branch::empty(Uuid::new_v4());
        let err = engine.merge_branch(chat, &branch, None).await.unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }

    #[test]
    fn test_mergeable_needs_seed_and_reply() {
        let id = Uuid::new_v4();
        assert!(!BranchEngine::mergeable(&Branch::empty(id)));
        assert!(!BranchEngine::mergeable(&branch_with(id, &["seed"])));
        assert!(BranchEngine::mergeable(&branch_with(id, &["seed", "reply"])));
    }
}
