//! # DocQuery
//!
//! A document question-answering engine that routes natural-language
//! questions over uploaded files to the cheapest strategy that can answer
//! them correctly: deterministic tabular computation for spreadsheet math,
//! full-text or vector-retrieval synthesis for prose, and a durable
//! provider-hosted thread for project-wide conversations.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────────┐   ┌──────────────┐
//! │ Storage  │──▶│   Ingestion     │──▶│   SQLite      │
//! │ (objects)│   │ extract/chunk/  │   │ bodies, chunks│
//! └──────────┘   │ embed, df load  │   │ schemas, chat │
//!                └────────────────┘   └──────┬───────┘
//!                                            │
//!                     ┌──────────────────────┤
//!                     ▼                      ▼
//!               ┌──────────┐          ┌──────────────┐
//!               │  Router  │          │ Thread runs  │
//!               │ struct/  │          │ (provider-   │
//!               │ text/vec │          │  hosted)     │
//!               └──────────┘          └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy shared by engine and HTTP layer |
//! | [`models`] | Core data types |
//! | [`ingest`] | File → queryable document pipeline |
//! | [`chunk`] | Sliding-window text chunking |
//! | [`embedding`] | Embedding BLOB codec and similarity |
//! | [`retriever`] | Principal-scoped vector search |
//! | [`router`] | Per-query strategy selection |
//! | [`structured`] | Four-phase tabular computation protocol |
//! | [`thread`] | Durable provider threads and run polling |
//! | [`engine`] | Query orchestration and chat history |
//! | [`server`] | JSON HTTP API |

pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod openai;
pub mod retriever;
pub mod router;
pub mod server;
pub mod storage;
pub mod structured;
pub mod tabular;
pub mod thread;
