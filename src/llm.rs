// src/llm.rs
//! The generation collaborator: an opaque "produce a reply / produce a
//! title" capability. The engine only sees the `GenerativeModel` trait;
//! `GeminiClient` is the production implementation.

use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::models::chat::{Chat, Message};
use crate::streams::StreamPublisher;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "gemini-2.0-flash";

const TITLE_PROMPT: &str = "Generate a short title (at most five words) for a \
conversation that starts with the query below. Respond with JSON of the form \
{\"title\": \"...\"} and nothing else.";

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("api error (status {status}): {body}")]
    Api { status: u16, body: String },
    #[error("malformed model response: {0}")]
    MalformedResponse(String),
}

/// Asynchronous generation capability. Reply generation pushes fragments
/// onto the given stream as they arrive and resolves to the final
/// assembled text; title generation is a one-shot call.
#[async_trait]
pub trait GenerativeModel: Send + Sync {
    async fn generate_reply(
        &self,
        history: &[Message],
        context: &[Chat],
        stream: &StreamPublisher,
    ) -> Result<String, LlmError>;

    async fn generate_title(&self, prompt: &str) -> Result<String, LlmError>;
}

// ---------------------------------------------------------------------------
// Gemini REST client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    #[serde(rename = "responseMimeType")]
    response_mime_type: String,
}

#[derive(Debug, Default, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: CandidateContent,
}

#[derive(Debug, Default, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct GeneratedTitle {
    title: String,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn content_from_message(message: &Message) -> Content {
        Content {
            role: Some(message.role.as_str().to_string()),
            parts: vec![Part {
                text: message.text.clone(),
            }],
        }
    }

    /// Mentioned chats ride along as read-only context, one document per
    /// chat, never as participants in the conversation itself.
    fn context_instruction(context: &[Chat]) -> Option<Content> {
        if context.is_empty() {
            return None;
        }
        let mut parts = vec![Part {
            text: "The user may reference these prior conversations as read-only context."
                .to_string(),
        }];
        for chat in context {
            let doc = serde_json::to_string(chat).unwrap_or_default();
            parts.push(Part { text: doc });
        }
        Some(Content { role: None, parts })
    }

    fn first_text(response: &GenerateContentResponse) -> Option<String> {
        let candidate = response.candidates.first()?;
        let text: String = candidate
            .content
            .parts
            .iter()
            .map(|p| p.text.as_str())
            .collect();
        Some(text)
    }
}

/// Pull the fragment text out of one SSE `data:` line, if it carries any.
fn parse_sse_data_line(line: &str) -> Option<String> {
    let json = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))?;
    let parsed: GenerateContentResponse = match serde_json::from_str(json.trim()) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::debug!("skipping unparseable stream line: {err}");
            return None;
        }
    };
    GeminiClient::first_text(&parsed).filter(|t| !t.is_empty())
}

#[async_trait]
impl GenerativeModel for GeminiClient {
    async fn generate_reply(
        &self,
        history: &[Message],
        context: &[Chat],
        stream: &StreamPublisher,
    ) -> Result<String, LlmError> {
        tracing::info!("starting message generation");
        let request = GenerateContentRequest {
            contents: history.iter().map(Self::content_from_message).collect(),
            system_instruction: Self::context_instruction(context),
            generation_config: None,
        };

        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, self.model, self.api_key
        );
        let response = self.client.post(&url).json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let mut full = String::new();
        // SSE events can split across transport chunks; buffer until a
        // complete line is available.
        let mut buffer = String::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let bytes = chunk?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim_end_matches('\r').to_string();
                buffer.drain(..=pos);
                if let Some(fragment) = parse_sse_data_line(&line) {
                    full.push_str(&fragment);
                    stream.publish(fragment);
                }
            }
        }
        if let Some(fragment) = parse_sse_data_line(buffer.trim_end()) {
            full.push_str(&fragment);
            stream.publish(fragment);
        }

        if full.is_empty() {
            tracing::warn!("model stream finished without any text");
        }
        tracing::info!(length = full.len(), "model response assembled");
        Ok(full)
    }

    async fn generate_title(&self, prompt: &str) -> Result<String, LlmError> {
        tracing::info!("generating chat title");
        let request = GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: format!("{TITLE_PROMPT}\n\nQuery: {prompt}"),
                }],
            }],
            system_instruction: None,
            generation_config: Some(GenerationConfig {
                response_mime_type: "application/json".to_string(),
            }),
        };

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );

        // Transient transport and 5xx failures retry with exponential
        // backoff; anything else is permanent.
        let backoff_config = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let response = retry(backoff_config, || async {
            let response = self
                .client
                .post(&url)
                .json(&request)
                .send()
                .await
                .map_err(|e| backoff::Error::transient(LlmError::Transport(e)))?;

            let status = response.status();
            if status.is_server_error() {
                let body = response.text().await.unwrap_or_default();
                return Err(backoff::Error::transient(LlmError::Api {
                    status: status.as_u16(),
                    body,
                }));
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(backoff::Error::permanent(LlmError::Api {
                    status: status.as_u16(),
                    body,
                }));
            }
            response
                .json::<GenerateContentResponse>()
                .await
                .map_err(|e| backoff::Error::permanent(LlmError::Transport(e)))
        })
        .await?;

        let text = Self::first_text(&response)
            .ok_or_else(|| LlmError::MalformedResponse("no candidates in response".to_string()))?;
        parse_title_json(&text)
    }
}

fn parse_title_json(text: &str) -> Result<String, LlmError> {
    let parsed: GeneratedTitle = serde_json::from_str(text.trim())
        .map_err(|e| LlmError::MalformedResponse(format!("title output: {e}")))?;
    let title = parsed.title.trim().to_string();
    if title.is_empty() {
        return Err(LlmError::MalformedResponse("empty title".to_string()));
    }
    Ok(title)
}
