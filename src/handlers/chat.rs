// src/handlers/chat.rs
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;

use axum::{
    extract::{Path, Query},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Extension, Json, Router,
};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::BranchEngine;
use crate::error::ChatError;
use crate::middleware::auth::auth_middleware;
use crate::models::chat::{Branch, Chat, ChatMention, Message};
use crate::orchestrator::PostOutcome;
use crate::provenance::{decode_log, LogEntry};
use crate::store::{ChatStore, ChatTitle, Mention};
use crate::AppState;

pub fn chat_routes() -> Router {
    Router::new()
        .route("/api/chats", get(list_chats))
        .route("/api/chats/:id", get(get_chat).delete(delete_chat))
        .route("/api/chats/:id/title", get(get_title))
        .route("/api/chats/:id/log", get(get_log))
        .route(
            "/api/chats/:id/tags",
            get(get_tags).post(post_tag).delete(delete_tag),
        )
        .route("/api/chats/:id/branches/:branch_id", get(get_branch_view))
        .route(
            "/api/chats/:id/branches/:branch_id/messages",
            post(post_message),
        )
        .route(
            "/api/chats/:id/branches/:branch_id/messages/stream",
            get(message_stream),
        )
        .route(
            "/api/chats/:id/branches/:branch_id/merge",
            get(merge_eligibility).post(post_merge),
        )
        .route("/api/mentions", get(get_mentions))
        .layer(axum::middleware::from_fn(auth_middleware))
}

// ---------------------------------------------------------------------------
// Chat views
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ChatView {
    pub chat: Chat,
    pub title_generating: bool,
}

#[derive(Debug, Serialize)]
pub struct BranchView {
    pub chat: Chat,
    pub branch: Branch,
    pub title_generating: bool,
    pub message_generating: bool,
    pub mergeable: bool,
}

async fn list_chats(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Vec<ChatTitle>>, ChatError> {
    Ok(Json(state.store.chat_titles().await?))
}

async fn get_chat(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ChatView>, ChatError> {
    let chat = state
        .store
        .find_chat(id)
        .await?
        .ok_or(ChatError::NotFound("chat"))?;
    let title_generating = state.title_streams.is_active(id).await;
    Ok(Json(ChatView {
        chat,
        title_generating,
    }))
}

async fn get_branch_view(
    Extension(state): Extension<Arc<AppState>>,
    Path((id, branch_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<BranchView>, ChatError> {
    let chat = state
        .store
        .find_chat(id)
        .await?
        .ok_or(ChatError::NotFound("chat"))?;
    let branch = state.engine.resolve_branch(id, branch_id).await?;
    Ok(Json(BranchView {
        title_generating: state.title_streams.is_active(id).await,
        message_generating: state.reply_streams.is_active(branch_id).await,
        mergeable: BranchEngine::mergeable(&branch),
        chat,
        branch,
    }))
}

async fn delete_chat(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ChatError> {
    state.store.delete_chat(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Messages & streaming
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    pub prompt: String,
    #[serde(default)]
    pub mentions: Vec<ChatMention>,
}

#[derive(Debug, Serialize)]
pub struct PostMessageResponse {
    /// Set when the chat or branch was just created: navigate here and
    /// pick the reply up from the stream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
}

async fn post_message(
    Extension(state): Extension<Arc<AppState>>,
    Path((id, branch_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<PostMessageRequest>,
) -> Result<Json<PostMessageResponse>, ChatError> {
    let outcome = state
        .orchestrator
        .post_user_message(id, branch_id, &req.prompt, &req.mentions)
        .await?;

    Ok(Json(match outcome {
        PostOutcome::Redirect { chat_id, branch_id } => PostMessageResponse {
            redirect: Some(format!("/api/chats/{chat_id}/branches/{branch_id}")),
            message: None,
            stream: None,
        },
        PostOutcome::Posted { message } => PostMessageResponse {
            redirect: None,
            message: Some(message),
            stream: Some(stream_path(id, branch_id)),
        },
    }))
}

fn stream_path(chat_id: Uuid, branch_id: Uuid) -> String {
    format!("/api/chats/{chat_id}/branches/{branch_id}/messages/stream")
}

type SseStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

/// Server-sent `chunk` events terminated by a single `finished` event. A
/// branch with no generation in flight answers with `finished`
/// immediately. Disconnecting does not cancel the generation.
async fn message_stream(
    Extension(state): Extension<Arc<AppState>>,
    Path((_id, branch_id)): Path<(Uuid, Uuid)>,
) -> Sse<SseStream> {
    let stream: SseStream = match state.reply_streams.subscribe(branch_id).await {
        Some(sub) => {
            let chunks = stream::unfold(sub, |mut sub| async move {
                sub.next_fragment().await.map(|fragment| {
                    // Event::data rejects carriage returns outright.
                    let fragment = fragment.replace('\r', "");
                    (Ok(Event::default().event("chunk").data(fragment)), sub)
                })
            });
            let finished =
                stream::once(async { Ok(Event::default().event("finished").data("")) });
            Box::pin(chunks.chain(finished))
        }
        None => Box::pin(stream::once(async {
            Ok(Event::default().event("finished").data("There is no stream"))
        })),
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Serialize)]
pub struct TitleResponse {
    pub title: String,
}

/// Long-poll the one-shot title stream, bounded by the configured
/// timeout. 404 when nothing is generating (or generation failed).
async fn get_title(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<TitleResponse>, ChatError> {
    match state.orchestrator.await_title(id).await {
        Some(title) => Ok(Json(TitleResponse { title })),
        None => Err(ChatError::NotFound("generated title")),
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct MergeEligibility {
    pub mergeable: bool,
}

async fn merge_eligibility(
    Extension(state): Extension<Arc<AppState>>,
    Path((id, branch_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<MergeEligibility>, ChatError> {
    let branch = state.engine.resolve_branch(id, branch_id).await?;
    Ok(Json(MergeEligibility {
        mergeable: BranchEngine::mergeable(&branch),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct MergeRequest {
    /// Branch message indices to fold into the trunk. Omitted: first and
    /// last message.
    #[serde(default)]
    pub indices: Option<Vec<usize>>,
}

async fn post_merge(
    Extension(state): Extension<Arc<AppState>>,
    Path((id, branch_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<MergeRequest>,
) -> Result<Json<Chat>, ChatError> {
    let chat = state
        .store
        .find_chat(id)
        .await?
        .ok_or(ChatError::NotFound("chat"))?;
    let branch = state.engine.resolve_branch(id, branch_id).await?;
    let merged = state.engine.merge_branch(chat, &branch, req.indices).await?;
    Ok(Json(merged))
}

// ---------------------------------------------------------------------------
// Provenance log
// ---------------------------------------------------------------------------

async fn get_log(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<LogEntry>>, ChatError> {
    let rows = state.store.find_log(id).await?;
    Ok(Json(decode_log(&rows)?))
}

// ---------------------------------------------------------------------------
// Tags
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ChatTags {
    pub id: Uuid,
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct TagRequest {
    pub tag: String,
}

fn validate_tag(tag: &str) -> Result<(), ChatError> {
    if tag.is_empty() {
        return Err(ChatError::validation("Tag can not be empty"));
    }
    if tag.chars().count() > 30 {
        return Err(ChatError::validation(
            "Tag should not be larger than 30 chars",
        ));
    }
    Ok(())
}

async fn get_tags(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ChatTags>, ChatError> {
    let tags = state.store.find_tags(id).await?;
    Ok(Json(ChatTags { id, tags }))
}

async fn post_tag(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<TagRequest>,
) -> Result<(StatusCode, Json<ChatTags>), ChatError> {
    validate_tag(&req.tag)?;
    state.store.save_tag(id, &req.tag).await?;
    let tags = state.store.find_tags(id).await?;
    Ok((StatusCode::CREATED, Json(ChatTags { id, tags })))
}

async fn delete_tag(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(req): Query<TagRequest>,
) -> Result<StatusCode, ChatError> {
    validate_tag(&req.tag)?;
    state.store.delete_tag(id, &req.tag).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Mentions
// ---------------------------------------------------------------------------

async fn get_mentions(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Vec<Mention>>, ChatError> {
    Ok(Json(state.store.find_mentions().await?))
}
