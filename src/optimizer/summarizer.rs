//! Summarization collaborator
//!
//! The optimizer only sees the `Summarizer` trait. `ChatSummarizer` is an
//! OpenAI-compatible Chat Completions client that can fill the role.

use crate::{Result, WardenError};
use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Request timeout for a single summarization call
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const SUMMARIZATION_PROMPT: &str = "You compress the completed history of an automated coding session. \
Keep decisions, outcomes, file paths, and unresolved problems. Drop chatter and repeated output. \
Answer with the summary only.";

/// Compresses text to roughly `target_tokens` tokens
pub trait Summarizer: Send + Sync {
    fn summarize<'a>(&'a self, text: &'a str, target_tokens: usize) -> BoxFuture<'a, Result<String>>;
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// Summarizer backed by a `/chat/completions` endpoint
pub struct ChatSummarizer {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl ChatSummarizer {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: None,
        })
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    async fn send(&self, text: &str, target_tokens: usize) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SUMMARIZATION_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: format!(
                        "Summarize in at most {} tokens:\n\n{}",
                        target_tokens, text
                    ),
                },
            ],
            max_tokens: u32::try_from(target_tokens).unwrap_or(u32::MAX),
            temperature: 0.1,
            stream: false,
        };

        debug!(
            "Requesting summary of {} bytes from {} ({} tokens)",
            text.len(),
            url,
            target_tokens
        );

        let mut req_builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            req_builder = req_builder.bearer_auth(key);
        }

        let response = req_builder.json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WardenError::Summarization(format!(
                "API error {}: {}",
                status,
                body.trim()
            )));
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| WardenError::Summarization(e.to_string()))?;

        let summary = chat_response
            .choices
            .first()
            .map(|c| c.message.content.trim().to_string())
            .unwrap_or_default();
        if summary.is_empty() {
            return Err(WardenError::Summarization("empty summary".to_string()));
        }
        Ok(summary)
    }
}

impl Summarizer for ChatSummarizer {
    fn summarize<'a>(&'a self, text: &'a str, target_tokens: usize) -> BoxFuture<'a, Result<String>> {
        Box::pin(self.send(text, target_tokens))
    }
}
