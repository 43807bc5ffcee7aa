//! Blocking client for the external text-completion oracle.
//!
//! The oracle is treated as an opaque function: prompt in, raw text out.
//! Nothing here interprets the response; that is the response parser's job.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::util::bounded_prefix;

/// Explicit oracle configuration, threaded in from the CLI. No ambient
/// globals; credentials are resolved by the caller before construction.
#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub endpoint: String,
    pub deployment: String,
    pub api_key: String,
    pub api_version: String,
    pub timeout_secs: u64,
    pub max_completion_tokens: usize,
}

#[derive(Debug)]
pub struct OracleClient {
    config: OracleConfig,
    http: reqwest::blocking::Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    messages: Vec<ChatMessage<'a>>,
    max_completion_tokens: usize,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

impl OracleClient {
    pub fn new(config: OracleConfig) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build oracle http client")?;

        Ok(Self { config, http })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    pub fn deployment(&self) -> &str {
        &self.config.deployment
    }

    /// One synchronous completion call. Timeouts surface as transport errors;
    /// the caller treats any error as a failed association pass for the book.
    pub fn complete(&self, prompt: &str) -> Result<String> {
        let url = format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.deployment,
            self.config.api_version
        );

        let request = ChatRequest {
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_completion_tokens: self.config.max_completion_tokens,
            stream: false,
        };

        debug!(deployment = %self.config.deployment, prompt_chars = prompt.chars().count(), "sending oracle request");

        let response = self
            .http
            .post(&url)
            .header("api-key", &self.config.api_key)
            .json(&request)
            .send()
            .context("failed to send oracle request")?;

        let status = response.status();
        let body = response
            .text()
            .context("failed to read oracle response body")?;

        if !status.is_success() {
            bail!(
                "oracle request failed with status {}: {}",
                status,
                bounded_prefix(&body, 400)
            );
        }

        let chat: ChatResponse = serde_json::from_str(&body)
            .context("failed to parse oracle response envelope")?;

        let content = chat
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .filter(|content| !content.trim().is_empty())
            .context("oracle response contained no completion text")?;

        debug!(response_chars = content.chars().count(), "oracle completion received");
        Ok(content)
    }
}
