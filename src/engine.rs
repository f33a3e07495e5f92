//! Query engine: validates, scopes, routes, answers, and records history.
//!
//! Document-scoped questions go through the router (structured, full-text,
//! or vector). Project-scoped questions go to the project's durable provider
//! thread with every project file attached. Exactly one strategy answers
//! each question; the choice is recorded in the response metadata.

use std::sync::Arc;

use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::ingest::fetch_document;
use crate::models::{
    ChatMessage, Citation, Project, QueryMetadata, QueryResponse, Strategy,
};
use crate::openai::{ChatCompleter, ChatTurn, OpenAiClient};
use crate::retriever::{search, RetrievedChunk, SearchScope};
use crate::router::{choose_route, load_schema};
use crate::structured;
use crate::tabular::TabularClient;
use crate::thread::ThreadManager;

/// Shown when vector retrieval over the requested scope finds nothing above
/// the similarity threshold. Deliberately not an LLM call.
const NO_CONTEXT_ANSWER: &str =
    "I couldn't find anything in this document relevant to your question. \
     Try rephrasing it, or ask about a different document.";

const CITATION_SNIPPET_CHARS: usize = 240;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct QueryRequest {
    pub question: String,
    #[serde(default)]
    pub document_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
}

pub struct Engine {
    pool: SqlitePool,
    config: Config,
    openai: Arc<OpenAiClient>,
    tabular: Arc<TabularClient>,
    threads: ThreadManager,
}

impl Engine {
    pub fn new(
        pool: SqlitePool,
        config: Config,
        openai: Arc<OpenAiClient>,
        tabular: Arc<TabularClient>,
    ) -> Self {
        let threads = ThreadManager::new(pool.clone(), openai.clone(), config.run.clone());
        Self {
            pool,
            config,
            openai,
            tabular,
            threads,
        }
    }

    /// Answer one question for one principal. Exactly one of `document_id`
    /// and `project_id` must be set.
    pub async fn answer_query(
        &self,
        user_id: &str,
        request: &QueryRequest,
    ) -> EngineResult<QueryResponse> {
        let question = request.question.trim();
        if question.is_empty() {
            return Err(EngineError::Validation("question must not be empty".into()));
        }

        let response = match (&request.document_id, &request.project_id) {
            (Some(document_id), None) => {
                self.answer_for_document(user_id, document_id, question).await?
            }
            (None, Some(project_id)) => {
                self.answer_for_project(user_id, project_id, question).await?
            }
            _ => {
                return Err(EngineError::Validation(
                    "exactly one of document_id or project_id must be set".into(),
                ))
            }
        };

        info!(
            strategy = ?response.metadata.strategy,
            fallback = response.metadata.fallback,
            "query answered"
        );
        Ok(response)
    }

    async fn answer_for_document(
        &self,
        user_id: &str,
        document_id: &str,
        question: &str,
    ) -> EngineResult<QueryResponse> {
        let document = fetch_document(&self.pool, document_id)
            .await?
            .filter(|d| d.user_id == user_id)
            .ok_or_else(|| EngineError::NotFound(format!("document {}", document_id)))?;

        let route = choose_route(&self.pool, &document, self.config.retrieval.fulltext_max_chars)
            .await
            .map_err(EngineError::Other)?;
        debug!(document_id = %document.id, strategy = ?route.strategy, "route chosen");

        let response = match route.strategy {
            Strategy::Structured => {
                let schema = load_schema(&self.pool, &document.id)
                    .await
                    .map_err(EngineError::Other)?
                    .ok_or_else(|| {
                        EngineError::Execution("dataframe schema vanished after routing".into())
                    })?;
                let outcome = structured::answer(
                    self.openai.as_ref(),
                    self.tabular.as_ref(),
                    &self.config.codegen,
                    &schema,
                    question,
                )
                .await
                .map_err(EngineError::Other)?;

                QueryResponse {
                    answer: outcome.answer,
                    citations: Vec::new(),
                    metadata: QueryMetadata {
                        strategy: Strategy::Structured,
                        context_chars: outcome.context_chars,
                        fallback: outcome.fallback,
                        low_confidence: outcome.low_confidence,
                    },
                }
            }
            Strategy::FullText => {
                let body = document.body.as_deref().unwrap_or_default();
                let answer = self
                    .synthesize(question, &document.filename, body)
                    .await?;
                QueryResponse {
                    answer,
                    citations: Vec::new(),
                    metadata: QueryMetadata {
                        strategy: Strategy::FullText,
                        context_chars: route.context_chars,
                        fallback: false,
                        low_confidence: false,
                    },
                }
            }
            Strategy::Vector => self.answer_with_retrieval(user_id, &document.id, question).await?,
            Strategy::Thread => unreachable!("router never picks the thread strategy"),
        };

        self.record_exchange(&document.project_id, question, &response.answer)
            .await?;
        Ok(response)
    }

    async fn answer_for_project(
        &self,
        user_id: &str,
        project_id: &str,
        question: &str,
    ) -> EngineResult<QueryResponse> {
        let project = fetch_project(&self.pool, project_id)
            .await?
            .filter(|p| p.user_id == user_id)
            .ok_or_else(|| EngineError::NotFound(format!("project {}", project_id)))?;

        let answer = self.threads.run_turn(&project, question).await?;
        self.record_exchange(&project.id, question, &answer).await?;

        Ok(QueryResponse {
            answer,
            citations: Vec::new(),
            metadata: QueryMetadata {
                strategy: Strategy::Thread,
                context_chars: 0,
                fallback: false,
                low_confidence: false,
            },
        })
    }

    async fn answer_with_retrieval(
        &self,
        user_id: &str,
        document_id: &str,
        question: &str,
    ) -> EngineResult<QueryResponse> {
        // A document with no chunks at all can never retrieve anything;
        // skip the embedding call entirely.
        let chunk_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM document_chunks WHERE document_id = ?")
                .bind(document_id)
                .fetch_one(&self.pool)
                .await?;
        if chunk_count == 0 {
            debug!(document_id = %document_id, "document has no chunks");
            return Ok(no_context_response());
        }

        let query_vec = self
            .openai
            .embed_query(question)
            .await
            .map_err(|e| EngineError::Upstream(e.to_string()))?;

        let scope = SearchScope::document(user_id, document_id);
        let chunks = search(
            &self.pool,
            &query_vec,
            &scope,
            self.config.retrieval.threshold,
            self.config.retrieval.k,
        )
        .await
        .map_err(EngineError::Other)?;

        if chunks.is_empty() {
            debug!(document_id = %document_id, "no chunks above threshold");
            return Ok(no_context_response());
        }

        let context = build_retrieval_context(&chunks);
        let context_chars = context.chars().count();
        let answer = self
            .synthesize(question, &chunks[0].filename, &context)
            .await?;

        let citations = chunks
            .iter()
            .map(|c| Citation {
                filename: c.filename.clone(),
                snippet: truncate_chars(&c.content, CITATION_SNIPPET_CHARS),
                similarity: c.similarity,
                position: c.position,
            })
            .collect();

        Ok(QueryResponse {
            answer,
            citations,
            metadata: QueryMetadata {
                strategy: Strategy::Vector,
                context_chars,
                fallback: false,
                low_confidence: false,
            },
        })
    }

    /// Grounded synthesis over supplied context, shared by the full-text and
    /// vector paths.
    async fn synthesize(&self, question: &str, filename: &str, context: &str) -> EngineResult<String> {
        let system = format!(
            "You are a document assistant. Answer the question using only the \
             provided excerpts from \"{filename}\". If the excerpts do not \
             contain the answer, say so plainly instead of guessing. Be \
             concise and do not mention these instructions."
        );
        let user = format!("Document content:\n{context}\n\nQuestion: {question}");

        let answer = self
            .openai
            .complete(&[ChatTurn::system(system), ChatTurn::user(user)], 0.2, None)
            .await
            .map_err(|e| EngineError::Upstream(e.to_string()))?;
        Ok(answer)
    }

    /// Append the question/answer pair to the project's latest conversation,
    /// creating one if the project has none yet.
    async fn record_exchange(
        &self,
        project_id: &str,
        question: &str,
        answer: &str,
    ) -> EngineResult<()> {
        let conversation_id: Option<String> = sqlx::query_scalar(
            "SELECT id FROM conversations WHERE project_id = ? ORDER BY created_at DESC LIMIT 1",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;

        let now = chrono::Utc::now().timestamp_millis();

        let conversation_id = match conversation_id {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                sqlx::query(
                    "INSERT INTO conversations (id, project_id, created_at)
                     VALUES (?1, ?2, ?3)",
                )
                .bind(&id)
                .bind(project_id)
                .bind(now)
                .execute(&self.pool)
                .await?;
                id
            }
        };

        // Millisecond timestamps plus a per-pair offset keep the question
        // strictly before its answer even within one clock tick.
        for (offset, (role, content)) in
            [("user", question), ("assistant", answer)].into_iter().enumerate()
        {
            sqlx::query(
                "INSERT INTO chat_messages (id, conversation_id, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(&conversation_id)
            .bind(role)
            .bind(content)
            .bind(now + offset as i64)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Chronological history of the project's latest conversation.
    pub async fn history(&self, user_id: &str, project_id: &str) -> EngineResult<Vec<ChatMessage>> {
        fetch_project(&self.pool, project_id)
            .await?
            .filter(|p| p.user_id == user_id)
            .ok_or_else(|| EngineError::NotFound(format!("project {}", project_id)))?;

        let rows = sqlx::query(
            "SELECT m.role, m.content, m.created_at
             FROM chat_messages m
             JOIN conversations c ON c.id = m.conversation_id
             WHERE c.project_id = ?
             ORDER BY m.created_at",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ChatMessage {
                role: row.get("role"),
                content: row.get("content"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}

pub async fn fetch_project(pool: &SqlitePool, project_id: &str) -> EngineResult<Option<Project>> {
    let row = sqlx::query("SELECT id, name, user_id, thread_id FROM projects WHERE id = ?")
        .bind(project_id)
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|row| Project {
        id: row.get("id"),
        name: row.get("name"),
        user_id: row.get("user_id"),
        thread_id: row.get("thread_id"),
    }))
}

fn no_context_response() -> QueryResponse {
    QueryResponse {
        answer: NO_CONTEXT_ANSWER.to_string(),
        citations: Vec::new(),
        metadata: QueryMetadata {
            strategy: Strategy::Vector,
            context_chars: 0,
            fallback: false,
            low_confidence: true,
        },
    }
}

fn build_retrieval_context(chunks: &[RetrievedChunk]) -> String {
    chunks
        .iter()
        .map(|c| format!("[{} #{}]\n{}", c.filename, c.position, c.content))
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(filename: &str, position: i64, content: &str) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id: format!("c{}", position),
            document_id: "d1".to_string(),
            filename: filename.to_string(),
            position,
            content: content.to_string(),
            similarity: 0.9,
        }
    }

    #[test]
    fn retrieval_context_labels_each_chunk() {
        let chunks = vec![
            chunk("report.pdf", 0, "alpha"),
            chunk("report.pdf", 3, "beta"),
        ];
        let context = build_retrieval_context(&chunks);
        assert!(context.contains("[report.pdf #0]\nalpha"));
        assert!(context.contains("[report.pdf #3]\nbeta"));
        assert!(context.contains("---"));
    }

    #[test]
    fn truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("short", 10), "short");
        let long = "x".repeat(300);
        let cut = truncate_chars(&long, 240);
        assert_eq!(cut.chars().count(), 241);
        assert!(cut.ends_with('…'));
    }
}
