/*
 * Cvassist - personal CV assistant backend
 * Copyright (C) 2025–2026 Pedro Monteiro <pedro@cvassist.dev>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Chat proxy: forwards visitor questions to the hosted chat-completion
//! API with a fixed persona built around the CV document.

use std::time::Duration;

use cvassist_config::ChatConfig;
use serde::Deserialize;
use tracing::warn;

#[derive(thiserror::Error, Debug)]
pub enum ChatError {
    #[error("question exceeds {0} characters")]
    QuestionTooLong(usize),
    #[error("chat API key not configured")]
    Unconfigured,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("chat API rejected the request with status {status}")]
    Rejected { status: u16 },
    #[error("malformed chat API response: {0}")]
    Malformed(String),
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Pull `choices[0].message.content` out of a completion body.
fn extract_reply(body: &str) -> Result<String, ChatError> {
    let parsed: CompletionResponse = serde_json::from_str(body)
        .map_err(|e| ChatError::Malformed(format!("completion body: {e}")))?;

    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| ChatError::Malformed("no completion choices in response".to_string()))
}

fn build_persona(cv_json: &str) -> String {
    format!(
        "You are a junior software developer looking for a junior or intern \
         position. This is your CV: {cv_json}. Answer in plain text, never \
         as JSON."
    )
}

fn build_question(user_message: &str) -> String {
    format!(
        "Question: {user_message}. If the information is not available in \
         the CV, answer 'Sorry, info not available.'"
    )
}

pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    persona: String,
    max_question_chars: usize,
}

impl ChatClient {
    /// `api_key` being `None` means the secret was not provisioned; asks
    /// then fail with [`ChatError::Unconfigured`] instead of reaching out.
    ///
    /// # Errors
    ///
    /// Returns `ChatError::Transport` if the HTTP client cannot be built.
    pub fn new(
        config: &ChatConfig,
        api_key: Option<String>,
        cv_json: &str,
    ) -> Result<Self, ChatError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(concat!("cvassist/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ChatError::Transport(format!("http client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            persona: build_persona(cv_json),
            max_question_chars: config.max_question_chars,
        })
    }

    /// Send one question and return the first completion's text.
    ///
    /// # Errors
    ///
    /// Returns a typed [`ChatError`]; nothing here is folded into a
    /// success-shaped reply.
    pub async fn ask(&self, user_message: &str) -> Result<String, ChatError> {
        if user_message.chars().count() > self.max_question_chars {
            return Err(ChatError::QuestionTooLong(self.max_question_chars));
        }
        let Some(api_key) = self.api_key.as_ref() else {
            return Err(ChatError::Unconfigured);
        };

        let payload = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": self.persona },
                { "role": "user", "content": build_question(user_message) },
            ],
        });

        let url = format!("{}/chat/completions", self.base_url);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ChatError::Transport(format!("completion request: {e}")))?;

        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| ChatError::Transport(format!("completion body: {e}")))?;

        if !(200..300).contains(&status) {
            warn!(status, "chat API rejected the completion request");
            return Err(ChatError::Rejected { status });
        }

        extract_reply(&body)
    }
}
