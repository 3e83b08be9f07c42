// HTTP client for an OpenAI-compatible chat-completions endpoint

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{CompletionRequest, LanguageModel};
use crate::error::{CaseworkError, Result};

const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Appended to the user prompt when the previous attempt hit the token limit.
const CONCISE_INSTRUCTION: &str = "\n\nIMPORTANT: Your previous response was truncated. \
    Please produce a SHORTER, more concise response that fits within the token limit. \
    Use fewer nodes, shorter descriptions, and minimal whitespace in JSON output.";

pub struct LiveModel {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: String,
    /// Extra attempts after a length-truncated response. Network and 5xx
    /// errors are not retried here; that is the transport's concern.
    retry_count: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_completion_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl LiveModel {
    pub fn new(
        api_key: String,
        base_url: String,
        default_model: String,
        retry_count: u32,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            api_key,
            base_url,
            default_model,
            retry_count,
        })
    }

    async fn send_once(
        &self,
        req: &CompletionRequest,
        user_prompt: &str,
    ) -> Result<(String, Option<String>)> {
        let body = ChatRequest {
            model: &req.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &req.system,
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt,
                },
            ],
            max_completion_tokens: req.max_tokens,
        };

        tracing::debug!(agent = req.agent_key.as_str(), model = %req.model, "sending chat completion");

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CaseworkError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(CaseworkError::Transport(format!(
                "chat completion failed: status {status}, body: {error_body}"
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| CaseworkError::Transport(e.to_string()))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| CaseworkError::Transport("empty choices in chat response".into()))?;

        Ok((choice.message.content.unwrap_or_default(), choice.finish_reason))
    }
}

#[async_trait]
impl LanguageModel for LiveModel {
    fn model_used(&self) -> String {
        self.default_model.clone()
    }

    async fn complete(&self, req: CompletionRequest) -> Result<String> {
        let mut last_content = String::new();

        for attempt in 0..=self.retry_count {
            let prompt = if attempt > 0 {
                format!("{}{}", req.user, CONCISE_INSTRUCTION)
            } else {
                req.user.clone()
            };

            let (content, finish_reason) = self.send_once(&req, &prompt).await?;
            last_content = content;

            if finish_reason.as_deref() == Some("length") && attempt < self.retry_count {
                tracing::warn!(
                    agent = req.agent_key.as_str(),
                    attempt,
                    "response truncated at token limit, retrying with concise instruction"
                );
                continue;
            }
            return Ok(last_content);
        }

        Ok(last_content)
    }
}
