//! LLM provider client.
//!
//! One explicit, injected client with process-wide lifetime covering the
//! provider surfaces the engine needs: embeddings, chat completions with
//! temperature and seed, durable threads (create, append message with
//! attachments and tool bindings, create run, retrieve run, list messages),
//! and multipart file upload.
//!
//! # Retry strategy
//!
//! POST calls retry on transient errors with exponential backoff:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::config::OpenAiConfig;

/// One turn of a chat-completion conversation.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A provider file attached to a thread message, with the tool that should
/// receive it. The file-search tool cannot reliably index spreadsheet
/// content, so tabular attachments bind to the code-execution tool instead.
#[derive(Debug, Clone)]
pub struct MessageAttachment {
    pub file_id: String,
    pub tabular: bool,
}

/// Terminal or in-flight state of a thread run.
#[derive(Debug, Clone)]
pub struct RunState {
    pub id: String,
    pub status: String,
    pub last_error: Option<String>,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status.as_str(),
            "completed" | "failed" | "cancelled" | "expired" | "incomplete"
        )
    }
}

/// Chat-completion seam. The structured query engine depends on this trait
/// rather than the concrete client so its phases can be exercised without a
/// network.
#[async_trait]
pub trait ChatCompleter: Send + Sync {
    async fn complete(
        &self,
        turns: &[ChatTurn],
        temperature: f32,
        seed: Option<i64>,
    ) -> Result<String>;
}

pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    config: OpenAiConfig,
}

impl OpenAiClient {
    /// # Errors
    ///
    /// Returns an error if `OPENAI_API_KEY` is not in the environment.
    pub fn new(config: &OpenAiConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            api_key,
            config: config.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    /// POST a JSON body with retry/backoff. Thread endpoints carry the
    /// assistants beta header.
    async fn post_json(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .http
                .post(self.url(path))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .header("OpenAI-Beta", "assistants=v2")
                .json(body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response.json().await?);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err =
                            Some(anyhow::anyhow!("OpenAI API error {}: {}", status, body_text));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("OpenAI API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("OpenAI request failed after retries")))
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value> {
        let response = self
            .http
            .get(self.url(path))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("OpenAI-Beta", "assistants=v2")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("OpenAI API error {}: {}", status, body_text);
        }
        Ok(response.json().await?)
    }

    // ============ Embeddings ============

    /// Embed a batch of texts, returning one vector per input in order.
    pub async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.config.embed_model,
            "input": texts,
        });

        let json = self.post_json("/embeddings", &body).await?;
        parse_embeddings_response(&json)
    }

    /// Embed a single query text.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let results = self.embed_texts(&[text.to_string()]).await?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
    }

    // ============ Files ============

    /// Upload raw bytes to the provider file store (purpose `assistants`)
    /// and return the durable file id.
    pub async fn upload_file(&self, filename: &str, bytes: Vec<u8>) -> Result<String> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new()
            .text("purpose", "assistants")
            .part("file", part);

        let response = self
            .http
            .post(self.url("/files"))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("OpenAI file upload error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        json.get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid file upload response: missing id"))
    }

    // ============ Threads ============

    pub async fn create_thread(&self, project_id: &str) -> Result<String> {
        let body = serde_json::json!({
            "metadata": { "project_id": project_id },
        });
        let json = self.post_json("/threads", &body).await?;
        json.get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid thread response: missing id"))
    }

    /// Append a user message, binding each attachment to the tool suited to
    /// its content type.
    pub async fn add_user_message(
        &self,
        thread_id: &str,
        content: &str,
        attachments: &[MessageAttachment],
    ) -> Result<()> {
        let attachment_values: Vec<serde_json::Value> = attachments
            .iter()
            .map(|a| {
                let tool = if a.tabular {
                    "code_interpreter"
                } else {
                    "file_search"
                };
                serde_json::json!({
                    "file_id": a.file_id,
                    "tools": [{ "type": tool }],
                })
            })
            .collect();

        let mut body = serde_json::json!({
            "role": "user",
            "content": content,
        });
        if !attachment_values.is_empty() {
            body["attachments"] = serde_json::Value::Array(attachment_values);
        }

        self.post_json(&format!("/threads/{}/messages", thread_id), &body)
            .await?;
        Ok(())
    }

    /// Start a run with per-request instructions layered on top of the
    /// assistant's stored persona.
    pub async fn create_run(
        &self,
        thread_id: &str,
        additional_instructions: &str,
    ) -> Result<RunState> {
        let body = serde_json::json!({
            "assistant_id": self.config.assistant_id,
            "additional_instructions": additional_instructions,
        });
        let json = self
            .post_json(&format!("/threads/{}/runs", thread_id), &body)
            .await?;
        parse_run(&json)
    }

    pub async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<RunState> {
        let json = self
            .get_json(&format!("/threads/{}/runs/{}", thread_id, run_id))
            .await?;
        parse_run(&json)
    }

    /// Fetch the newest assistant message on a thread and concatenate its
    /// text segments. Returns `None` when the thread has no assistant
    /// message yet.
    pub async fn latest_assistant_text(&self, thread_id: &str) -> Result<Option<String>> {
        let json = self
            .get_json(&format!("/threads/{}/messages?order=desc&limit=20", thread_id))
            .await?;

        let data = json
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid messages response: missing data array"))?;

        for message in data {
            if message.get("role").and_then(|r| r.as_str()) != Some("assistant") {
                continue;
            }
            let mut text = String::new();
            if let Some(parts) = message.get("content").and_then(|c| c.as_array()) {
                for part in parts {
                    if part.get("type").and_then(|t| t.as_str()) == Some("text") {
                        if let Some(value) = part
                            .pointer("/text/value")
                            .and_then(|v| v.as_str())
                        {
                            if !text.is_empty() {
                                text.push('\n');
                            }
                            text.push_str(value);
                        }
                    }
                }
            }
            return Ok(Some(text));
        }

        Ok(None)
    }
}

#[async_trait]
impl ChatCompleter for OpenAiClient {
    async fn complete(
        &self,
        turns: &[ChatTurn],
        temperature: f32,
        seed: Option<i64>,
    ) -> Result<String> {
        let messages: Vec<serde_json::Value> = turns
            .iter()
            .map(|t| serde_json::json!({ "role": t.role, "content": t.content }))
            .collect();

        let mut body = serde_json::json!({
            "model": self.config.chat_model,
            "messages": messages,
            "temperature": temperature,
        });
        if let Some(seed) = seed {
            body["seed"] = serde_json::json!(seed);
        }

        let json = self.post_json("/chat/completions", &body).await?;
        json.pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid completion response: missing content"))
    }
}

fn parse_run(json: &serde_json::Value) -> Result<RunState> {
    let id = json
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("Invalid run response: missing id"))?
        .to_string();
    let status = json
        .get("status")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    let last_error = json
        .get("last_error")
        .filter(|v| !v.is_null())
        .map(|v| {
            let code = v.get("code").and_then(|c| c.as_str()).unwrap_or("unknown");
            let message = v.get("message").and_then(|m| m.as_str()).unwrap_or("");
            format!("{}: {}", code, message)
        });

    Ok(RunState {
        id,
        status,
        last_error,
    })
}

fn parse_embeddings_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid embeddings response: missing data array"))?;

    let mut embeddings = Vec::with_capacity(data.len());

    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid embeddings response: missing embedding"))?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        embeddings.push(vec);
    }

    Ok(embeddings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_embeddings_keeps_input_order() {
        let json = serde_json::json!({
            "data": [
                { "index": 0, "embedding": [0.1, 0.2] },
                { "index": 1, "embedding": [0.3, 0.4] },
            ]
        });
        let vecs = parse_embeddings_response(&json).unwrap();
        assert_eq!(vecs.len(), 2);
        assert!((vecs[0][0] - 0.1).abs() < 1e-6);
        assert!((vecs[1][1] - 0.4).abs() < 1e-6);
    }

    #[test]
    fn parse_run_carries_last_error() {
        let json = serde_json::json!({
            "id": "run_1",
            "status": "failed",
            "last_error": { "code": "rate_limit_exceeded", "message": "too fast" },
        });
        let run = parse_run(&json).unwrap();
        assert!(run.is_terminal());
        assert_eq!(run.status, "failed");
        assert_eq!(
            run.last_error.as_deref(),
            Some("rate_limit_exceeded: too fast")
        );
    }

    #[test]
    fn parse_run_null_error_is_none() {
        let json = serde_json::json!({
            "id": "run_2",
            "status": "in_progress",
            "last_error": null,
        });
        let run = parse_run(&json).unwrap();
        assert!(!run.is_terminal());
        assert!(run.last_error.is_none());
    }

    #[test]
    fn terminal_states() {
        for status in ["completed", "failed", "cancelled", "expired", "incomplete"] {
            let run = RunState {
                id: "r".into(),
                status: status.into(),
                last_error: None,
            };
            assert!(run.is_terminal(), "{} should be terminal", status);
        }
        let run = RunState {
            id: "r".into(),
            status: "queued".into(),
            last_error: None,
        };
        assert!(!run.is_terminal());
    }
}
