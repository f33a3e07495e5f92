//! Integration tests over an in-memory database: isolation, routing,
//! retrieval bounds, thread claiming, and request validation.

use std::path::PathBuf;
use std::sync::Arc;

use docquery::config::{
    ChunkingConfig, CodegenConfig, Config, DbConfig, OpenAiConfig, RetrievalConfig, RunConfig,
    ServerConfig, StorageConfig, TabularConfig,
};
use docquery::db::connect_memory;
use docquery::embedding::vec_to_blob;
use docquery::engine::{Engine, QueryRequest};
use docquery::error::EngineError;
use docquery::migrate::run_migrations_on;
use docquery::models::{Document, Strategy};
use docquery::openai::OpenAiClient;
use docquery::retriever::{search, SearchScope};
use docquery::router::{choose_route, load_schema};
use docquery::tabular::TabularClient;
use sqlx::SqlitePool;

async fn test_pool() -> SqlitePool {
    let pool = connect_memory().await.unwrap();
    run_migrations_on(&pool).await.unwrap();
    pool
}

fn test_config() -> Config {
    Config {
        db: DbConfig {
            path: PathBuf::from(":memory:"),
        },
        server: ServerConfig {
            bind: "127.0.0.1:0".to_string(),
        },
        openai: OpenAiConfig {
            base_url: "http://localhost:9".to_string(),
            chat_model: "gpt-4o-mini".to_string(),
            embed_model: "text-embedding-3-small".to_string(),
            embed_dims: 3,
            assistant_id: "asst_test".to_string(),
            timeout_secs: 1,
            max_retries: 0,
        },
        tabular: TabularConfig {
            url: "http://localhost:9".to_string(),
            timeout_secs: 1,
        },
        storage: StorageConfig {
            url: "http://localhost:9".to_string(),
            bucket: "documents".to_string(),
            signed_url_ttl_secs: 60,
        },
        chunking: ChunkingConfig::default(),
        retrieval: RetrievalConfig::default(),
        run: RunConfig::default(),
        codegen: CodegenConfig::default(),
    }
}

/// Engine wired against unreachable endpoints. Fine for paths that fail
/// before any network call.
fn offline_engine(pool: SqlitePool) -> Engine {
    std::env::set_var("OPENAI_API_KEY", "sk-test");
    let config = test_config();
    let openai = Arc::new(OpenAiClient::new(&config.openai).unwrap());
    let tabular = Arc::new(TabularClient::new(&config.tabular).unwrap());
    Engine::new(pool, config, openai, tabular)
}

async fn insert_project(pool: &SqlitePool, id: &str, user_id: &str) {
    sqlx::query("INSERT INTO projects (id, name, user_id, thread_id) VALUES (?1, ?2, ?3, NULL)")
        .bind(id)
        .bind(format!("project {}", id))
        .bind(user_id)
        .execute(pool)
        .await
        .unwrap();
}

async fn insert_document(pool: &SqlitePool, id: &str, project_id: &str, user_id: &str, body: Option<&str>) {
    sqlx::query(
        "INSERT INTO documents
            (id, project_id, user_id, filename, storage_path, file_type, provider_file_id, body, content_hash, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'txt', NULL, ?6, NULL, 0)",
    )
    .bind(id)
    .bind(project_id)
    .bind(user_id)
    .bind(format!("{}.txt", id))
    .bind(format!("uploads/{}.txt", id))
    .bind(body)
    .execute(pool)
    .await
    .unwrap();
}

async fn insert_chunk(pool: &SqlitePool, document_id: &str, position: i64, content: &str, embedding: &[f32]) {
    sqlx::query(
        "INSERT INTO document_chunks (id, document_id, position, content, embedding)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )
    .bind(format!("{}-{}", document_id, position))
    .bind(document_id)
    .bind(position)
    .bind(content)
    .bind(vec_to_blob(embedding))
    .execute(pool)
    .await
    .unwrap();
}

fn doc(id: &str, project_id: &str, user_id: &str, body: Option<&str>) -> Document {
    Document {
        id: id.to_string(),
        project_id: project_id.to_string(),
        user_id: user_id.to_string(),
        filename: format!("{}.txt", id),
        storage_path: format!("uploads/{}.txt", id),
        file_type: "txt".to_string(),
        provider_file_id: None,
        body: body.map(|b| b.to_string()),
    }
}

#[tokio::test]
async fn retrieval_never_crosses_principals() {
    let pool = test_pool().await;
    insert_project(&pool, "p-alice", "alice").await;
    insert_project(&pool, "p-bob", "bob").await;
    insert_document(&pool, "d-alice", "p-alice", "alice", None).await;
    insert_document(&pool, "d-bob", "p-bob", "bob", None).await;

    // Identical embeddings on both sides: only the scope separates them.
    let v = [1.0_f32, 0.0, 0.0];
    insert_chunk(&pool, "d-alice", 0, "alice secret", &v).await;
    insert_chunk(&pool, "d-bob", 0, "bob secret", &v).await;

    let scope = SearchScope::project("alice", "p-alice");
    let results = search(&pool, &v, &scope, 0.1, 5).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].document_id, "d-alice");

    // Even naming bob's document directly yields nothing for alice.
    let scope = SearchScope::document("alice", "d-bob");
    let results = search(&pool, &v, &scope, 0.1, 5).await.unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn retrieval_is_bounded_thresholded_and_sorted() {
    let pool = test_pool().await;
    insert_project(&pool, "p1", "u1").await;
    insert_document(&pool, "d1", "p1", "u1", None).await;

    let query = [1.0_f32, 0.0, 0.0];
    // Eight chunks with decreasing alignment to the query; the last two
    // fall at or below the threshold.
    for (i, x) in [1.0_f32, 0.9, 0.8, 0.7, 0.6, 0.5, 0.05, -1.0]
        .iter()
        .enumerate()
    {
        let y = (1.0 - x * x).max(0.0).sqrt();
        insert_chunk(&pool, "d1", i as i64, &format!("chunk {}", i), &[*x, y, 0.0]).await;
    }

    let scope = SearchScope::document("u1", "d1");
    let results = search(&pool, &query, &scope, 0.1, 5).await.unwrap();

    assert_eq!(results.len(), 5);
    for window in results.windows(2) {
        assert!(window[0].similarity >= window[1].similarity);
    }
    for r in &results {
        assert!(r.similarity > 0.1);
    }
    assert_eq!(results[0].position, 0);
}

#[tokio::test]
async fn retrieval_empty_scope_is_not_an_error() {
    let pool = test_pool().await;
    insert_project(&pool, "p1", "u1").await;
    insert_document(&pool, "d1", "p1", "u1", None).await;

    let scope = SearchScope::document("u1", "d1");
    let results = search(&pool, &[1.0, 0.0, 0.0], &scope, 0.1, 5).await.unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn router_prefers_registered_dataframe() {
    let pool = test_pool().await;
    insert_project(&pool, "p1", "u1").await;
    insert_document(&pool, "d1", "p1", "u1", Some("small body")).await;

    sqlx::query(
        "INSERT INTO dataframe_schemas (document_id, row_count, columns_json, sample_json, loaded_at)
         VALUES ('d1', 10, '[]', '[]', 0)",
    )
    .execute(&pool)
    .await
    .unwrap();

    let route = choose_route(&pool, &doc("d1", "p1", "u1", Some("small body")), 200_000)
        .await
        .unwrap();
    assert_eq!(route.strategy, Strategy::Structured);

    let schema = load_schema(&pool, "d1").await.unwrap().unwrap();
    assert_eq!(schema.row_count, 10);
}

#[tokio::test]
async fn router_full_text_within_ceiling_else_vector() {
    let pool = test_pool().await;

    let small = doc("d-small", "p1", "u1", Some("short extracted text"));
    let route = choose_route(&pool, &small, 100).await.unwrap();
    assert_eq!(route.strategy, Strategy::FullText);
    assert_eq!(route.context_chars, "short extracted text".chars().count());

    let big_body = "x".repeat(101);
    let big = doc("d-big", "p1", "u1", Some(&big_body));
    let route = choose_route(&pool, &big, 100).await.unwrap();
    assert_eq!(route.strategy, Strategy::Vector);

    let bodyless = doc("d-none", "p1", "u1", None);
    let route = choose_route(&pool, &bodyless, 100).await.unwrap();
    assert_eq!(route.strategy, Strategy::Vector);
}

#[tokio::test]
async fn thread_claim_is_first_writer_wins() {
    let pool = test_pool().await;
    insert_project(&pool, "p1", "u1").await;

    let claim = "UPDATE projects SET thread_id = ?1 WHERE id = ?2 AND thread_id IS NULL";

    let first = sqlx::query(claim)
        .bind("thread_a")
        .bind("p1")
        .execute(&pool)
        .await
        .unwrap()
        .rows_affected();
    assert_eq!(first, 1);

    let second = sqlx::query(claim)
        .bind("thread_b")
        .bind("p1")
        .execute(&pool)
        .await
        .unwrap()
        .rows_affected();
    assert_eq!(second, 0);

    let stored: String = sqlx::query_scalar("SELECT thread_id FROM projects WHERE id = 'p1'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(stored, "thread_a");
}

#[tokio::test]
async fn chunkless_document_gets_explicit_no_information_answer() {
    let pool = test_pool().await;
    insert_project(&pool, "p1", "u1").await;
    // No body, no chunks, no dataframe schema: routes to vector, which
    // must answer without touching the (unreachable) provider.
    insert_document(&pool, "d1", "p1", "u1", None).await;
    let engine = offline_engine(pool);

    let request = QueryRequest {
        question: "what does this say?".to_string(),
        document_id: Some("d1".to_string()),
        project_id: None,
    };
    let response = engine.answer_query("u1", &request).await.unwrap();

    assert_eq!(response.metadata.strategy, Strategy::Vector);
    assert!(response.metadata.low_confidence);
    assert!(response.citations.is_empty());
    assert!(response.answer.contains("couldn't find"));
}

#[tokio::test]
async fn query_requires_nonempty_question_and_exactly_one_scope() {
    let pool = test_pool().await;
    let engine = offline_engine(pool);

    let empty = QueryRequest {
        question: "   ".to_string(),
        document_id: Some("d1".to_string()),
        project_id: None,
    };
    assert!(matches!(
        engine.answer_query("u1", &empty).await,
        Err(EngineError::Validation(_))
    ));

    let none = QueryRequest {
        question: "what is the total?".to_string(),
        document_id: None,
        project_id: None,
    };
    assert!(matches!(
        engine.answer_query("u1", &none).await,
        Err(EngineError::Validation(_))
    ));

    let both = QueryRequest {
        question: "what is the total?".to_string(),
        document_id: Some("d1".to_string()),
        project_id: Some("p1".to_string()),
    };
    assert!(matches!(
        engine.answer_query("u1", &both).await,
        Err(EngineError::Validation(_))
    ));
}

#[tokio::test]
async fn foreign_documents_read_as_not_found() {
    let pool = test_pool().await;
    insert_project(&pool, "p-bob", "bob").await;
    insert_document(&pool, "d-bob", "p-bob", "bob", Some("bob's text")).await;
    let engine = offline_engine(pool);

    let request = QueryRequest {
        question: "summarize".to_string(),
        document_id: Some("d-bob".to_string()),
        project_id: None,
    };
    assert!(matches!(
        engine.answer_query("alice", &request).await,
        Err(EngineError::NotFound(_))
    ));

    let request = QueryRequest {
        question: "summarize".to_string(),
        document_id: None,
        project_id: Some("p-bob".to_string()),
    };
    assert!(matches!(
        engine.answer_query("alice", &request).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn history_is_chronological_and_owner_scoped() {
    let pool = test_pool().await;
    insert_project(&pool, "p1", "u1").await;

    sqlx::query("INSERT INTO conversations (id, project_id, created_at) VALUES ('c1', 'p1', 1)")
        .execute(&pool)
        .await
        .unwrap();
    for (id, role, content, at) in [
        ("m1", "user", "first question", 10_i64),
        ("m2", "assistant", "first answer", 11),
        ("m3", "user", "second question", 20),
        ("m4", "assistant", "second answer", 21),
    ] {
        sqlx::query(
            "INSERT INTO chat_messages (id, conversation_id, role, content, created_at)
             VALUES (?1, 'c1', ?2, ?3, ?4)",
        )
        .bind(id)
        .bind(role)
        .bind(content)
        .bind(at)
        .execute(&pool)
        .await
        .unwrap();
    }

    let engine = offline_engine(pool);

    let messages = engine.history("u1", "p1").await.unwrap();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0].content, "first question");
    assert_eq!(messages[3].content, "second answer");
    for window in messages.windows(2) {
        assert!(window[0].created_at <= window[1].created_at);
    }

    assert!(matches!(
        engine.history("mallory", "p1").await,
        Err(EngineError::NotFound(_))
    ));
}
