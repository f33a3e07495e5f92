//! Client for the external tabular execution service.
//!
//! The service holds a per-document in-memory dataframe loaded once at
//! ingest time and reused read-only across queries. This engine never
//! executes generated code itself; `execute` ships approved code to the
//! service and relays its verdict.

use anyhow::{bail, Result};
use async_trait::async_trait;
use base64::Engine as _;
use std::time::Duration;

use crate::config::TabularConfig;
use crate::models::{ColumnStats, DataFrameSchema};

/// Outcome of a remote code execution: the computed result, or the
/// service-side error text.
#[derive(Debug, Clone)]
pub enum ExecOutcome {
    Success(serde_json::Value),
    Failure(String),
}

/// Remote-execution seam, mirrors [`crate::openai::ChatCompleter`] so the
/// structured engine's phases can be driven by stubs in tests.
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    async fn execute(&self, document_id: &str, code: &str) -> Result<ExecOutcome>;
}

pub struct TabularClient {
    http: reqwest::Client,
    config: TabularConfig,
}

impl TabularClient {
    pub fn new(config: &TabularConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            config: config.clone(),
        })
    }

    /// Ship the full file (base64) to the service's load operation and get
    /// back the dataframe schema and row sample.
    pub async fn load(
        &self,
        document_id: &str,
        bytes: &[u8],
        file_type: &str,
    ) -> Result<DataFrameSchema> {
        let body = serde_json::json!({
            "document_id": document_id,
            "content_base64": base64::engine::general_purpose::STANDARD.encode(bytes),
            "file_type": file_type,
        });

        let response = self
            .http
            .post(format!("{}/load", self.config.url))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("tabular load error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        if json.get("success").and_then(|v| v.as_bool()) == Some(false) {
            let detail = json
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            bail!("tabular load rejected: {}", detail);
        }

        parse_load_response(document_id, &json)
    }
}

#[async_trait]
impl CodeExecutor for TabularClient {
    async fn execute(&self, document_id: &str, code: &str) -> Result<ExecOutcome> {
        let body = serde_json::json!({
            "document_id": document_id,
            "code": code,
        });

        let response = self
            .http
            .post(format!("{}/execute", self.config.url))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("tabular execute error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        let success = json
            .get("success")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if success {
            let result = json.get("result").cloned().unwrap_or(serde_json::Value::Null);
            Ok(ExecOutcome::Success(result))
        } else {
            let error = json
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("execution failed without detail")
                .to_string();
            Ok(ExecOutcome::Failure(error))
        }
    }
}

fn parse_load_response(document_id: &str, json: &serde_json::Value) -> Result<DataFrameSchema> {
    let row_count = json
        .get("row_count")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| anyhow::anyhow!("Invalid load response: missing row_count"))?;

    let columns_value = json
        .get("columns")
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("Invalid load response: missing columns"))?;
    let columns: Vec<ColumnStats> = serde_json::from_value(columns_value)
        .map_err(|e| anyhow::anyhow!("Invalid load response columns: {}", e))?;

    let sample_rows = json
        .get("sample_rows")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    Ok(DataFrameSchema {
        document_id: document_id.to_string(),
        row_count,
        columns,
        sample_rows,
    })
}
