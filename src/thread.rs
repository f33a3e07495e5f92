//! Conversation/thread manager.
//!
//! Each project owns at most one durable provider thread, created lazily on
//! first use and persisted immediately. Thread creation is first-writer-wins:
//! the id is claimed with an atomic `UPDATE ... WHERE thread_id IS NULL`, and
//! a loser re-reads the stored winner instead of overwriting it.
//!
//! Per thread, message-append and run-start are strictly serialized behind a
//! per-thread-id async mutex — at most one run in flight per thread at any
//! time. Once a run is submitted the only safe action is to await a terminal
//! state or the poll deadline; there is no mid-run cancellation and no
//! automatic retry of failed runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use crate::config::RunConfig;
use crate::error::{EngineError, EngineResult};
use crate::extract::{classify, FileKind};
use crate::models::Project;
use crate::openai::{MessageAttachment, OpenAiClient, RunState};

/// Backoff ceiling for run polling.
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct ThreadManager {
    pool: SqlitePool,
    openai: Arc<OpenAiClient>,
    run_config: RunConfig,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ThreadManager {
    pub fn new(pool: SqlitePool, openai: Arc<OpenAiClient>, run_config: RunConfig) -> Self {
        Self {
            pool,
            openai,
            run_config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The serialization guard for one thread id. Holding the returned
    /// mutex across append+run+poll enforces the one-run-per-thread
    /// invariant.
    fn lock_for(&self, thread_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("thread lock map poisoned");
        locks
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Return the project's thread id, creating and claiming one if absent.
    pub async fn ensure_thread(&self, project: &Project) -> EngineResult<String> {
        if let Some(ref thread_id) = project.thread_id {
            return Ok(thread_id.clone());
        }

        let thread_id = self
            .openai
            .create_thread(&project.id)
            .await
            .map_err(|e| EngineError::Upstream(e.to_string()))?;

        let claimed = sqlx::query(
            "UPDATE projects SET thread_id = ?1 WHERE id = ?2 AND thread_id IS NULL",
        )
        .bind(&thread_id)
        .bind(&project.id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if claimed == 1 {
            info!(project_id = %project.id, thread_id = %thread_id, "created project thread");
            return Ok(thread_id);
        }

        // A concurrent request won the claim; use the stored id. Our fresh
        // remote thread is abandoned on the provider side.
        let winner: Option<String> =
            sqlx::query_scalar("SELECT thread_id FROM projects WHERE id = ?")
                .bind(&project.id)
                .fetch_one(&self.pool)
                .await?;

        match winner {
            Some(winner) => {
                warn!(
                    project_id = %project.id,
                    abandoned = %thread_id,
                    "lost thread claim race, using stored thread"
                );
                Ok(winner)
            }
            None => Err(EngineError::NotFound(format!("project {}", project.id))),
        }
    }

    /// Append the user message with its attachments, run the assistant, and
    /// return the extracted answer text.
    pub async fn run_turn(&self, project: &Project, message: &str) -> EngineResult<String> {
        let thread_id = self.ensure_thread(project).await?;
        let files = self.project_files(&project.id).await?;

        let attachments: Vec<MessageAttachment> = files
            .iter()
            .filter_map(|f| {
                f.provider_file_id.as_ref().map(|file_id| MessageAttachment {
                    file_id: file_id.clone(),
                    tabular: classify(&f.filename) == FileKind::Tabular,
                })
            })
            .collect();

        let instructions = build_run_instructions(&files);

        let guard = self.lock_for(&thread_id);
        let _held = guard.lock().await;

        self.openai
            .add_user_message(&thread_id, message, &attachments)
            .await
            .map_err(|e| EngineError::Upstream(e.to_string()))?;

        let run = self
            .openai
            .create_run(&thread_id, &instructions)
            .await
            .map_err(|e| EngineError::Upstream(e.to_string()))?;

        let run = poll_run(
            &self.openai,
            &thread_id,
            &run.id,
            Duration::from_millis(self.run_config.poll_interval_ms),
            Duration::from_secs(self.run_config.timeout_secs),
        )
        .await
        .map_err(|e| EngineError::Upstream(e.to_string()))?;

        if run.status != "completed" {
            return Err(EngineError::RunFailed {
                status: run.status,
                detail: run.last_error.unwrap_or_else(|| "no error detail".to_string()),
            });
        }

        let text = self
            .openai
            .latest_assistant_text(&thread_id)
            .await
            .map_err(|e| EngineError::Upstream(e.to_string()))?
            .unwrap_or_default();

        let cleaned = strip_citations(&text);
        if cleaned.is_empty() {
            Ok("No response generated.".to_string())
        } else {
            Ok(cleaned)
        }
    }

    async fn project_files(&self, project_id: &str) -> EngineResult<Vec<ProjectFile>> {
        let rows = sqlx::query(
            "SELECT filename, provider_file_id FROM documents WHERE project_id = ? ORDER BY created_at",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ProjectFile {
                filename: row.get("filename"),
                provider_file_id: row.get("provider_file_id"),
            })
            .collect())
    }
}

pub struct ProjectFile {
    pub filename: String,
    pub provider_file_id: Option<String>,
}

/// Poll a run until it reaches a terminal state or the deadline expires.
/// One reusable bounded loop: the interval doubles per attempt, capped at
/// [`MAX_POLL_INTERVAL`].
pub async fn poll_run(
    client: &OpenAiClient,
    thread_id: &str,
    run_id: &str,
    interval: Duration,
    deadline: Duration,
) -> Result<RunState> {
    let started = std::time::Instant::now();
    let mut wait = interval;

    loop {
        tokio::time::sleep(wait).await;

        let run = client.get_run(thread_id, run_id).await?;
        if run.is_terminal() {
            return Ok(run);
        }

        if started.elapsed() >= deadline {
            anyhow::bail!(
                "run {} on thread {} did not reach a terminal state within {:?}",
                run_id,
                thread_id,
                deadline
            );
        }

        wait = (wait * 2).min(MAX_POLL_INTERVAL);
    }
}

/// Per-run instructions layered on the assistant's stored persona. The
/// remote code tool has no visibility into this engine's rules, so the
/// filename mapping and the anti-double-count / exact-match protocol are
/// repeated on every run; dropping them changes answer correctness.
pub fn build_run_instructions(files: &[ProjectFile]) -> String {
    let file_list = if files.is_empty() {
        "No files.".to_string()
    } else {
        files
            .iter()
            .map(|f| {
                format!(
                    "- {} (ID: {})",
                    f.filename,
                    f.provider_file_id.as_deref().unwrap_or("pending")
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "Documents available in this project:\n{file_list}\n\n\
         Uploaded files may carry random system names; always map them back \
         to the original filenames above in your answer, and resolve \
         by-name references against this list.\n\n\
         DATA ANALYSIS PROTOCOL:\n\
         1. For any spreadsheet or CSV analysis, load the data with the code \
         tool and compute from it. Never guess from extracted text.\n\
         2. Pick the single column that matches the requested metric. Never \
         add distinct metrics (e.g. Sales and Payments) together; report \
         them separately.\n\
         3. EITHER sum the period columns OR read an existing Total column. \
         Never add a Total column to the period columns it summarizes. If a \
         Total column exists, read it directly as the final answer.\n\
         4. When summing manually, first drop rows whose label contains \
         Total, Subtotal, or Grand (case-insensitive).\n\
         5. Filter text categories by case-insensitive EXACT match, never \
         substring containment — 'Atlanta' must not match 'Outside Atlanta' \
         or 'Atlanta Region Total'.\n\
         6. Coerce currency text to numbers by stripping '$' and ','.\n\
         7. Report only the correct figure. Do not mention rejected \
         alternatives or explain which mistakes you avoided."
    )
}

/// Remove provider citation markup of the form `【…†source】`.
pub fn strip_citations(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find('【') {
        let after = &rest[start..];
        if let Some(end) = after.find("†source】") {
            out.push_str(&rest[..start]);
            rest = &after[end + "†source】".len()..];
        } else {
            let step = start + '【'.len_utf8();
            out.push_str(&rest[..step]);
            rest = &rest[step..];
        }
    }

    out.push_str(rest);
    out.trim().to_string()
}
