//! # Filesense
//!
//! The core of a multi-tenant "upload a file, get AI analysis and ask
//! questions about it" platform: a retrieval-augmented generation pipeline
//! with an asynchronous job pipeline driving files from upload to
//! searchable knowledge.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────┐   ┌─────────────────────────────┐   ┌──────────┐
//! │ Upload │──▶│  Queue → Worker → Pipeline   │──▶│  SQLite  │
//! │ (HTTP) │   │ download→extract→analyze→    │   │ files    │
//! └────────┘   │ chunk→embed→persist          │   │ chunks   │
//!              └─────────────────────────────┘   └────┬─────┘
//!                                                     │
//!                              ┌──────────────────────┤
//!                              ▼                      ▼
//!                        ┌───────────┐         ┌───────────┐
//!                        │  /chat    │         │ /knowledge│
//!                        │ (streamed,│         │  /search  │
//!                        │  cited)   │         │           │
//!                        └───────────┘         └───────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy with retryability |
//! | [`extract`] | Media-type driven text extraction |
//! | [`chunk`] | Fixed-window overlapping chunker |
//! | [`embedding`] | Embedding provider boundary |
//! | [`genai`] | Generative-model boundary (analysis + streaming chat) |
//! | [`analyzer`] | Per-media-type structured analysis |
//! | [`storage`] | Object storage boundary |
//! | [`store`] | Persistence: files, analyses, knowledge chunks, search |
//! | [`queue`] | Durable file-processing queue |
//! | [`worker`] | Bounded worker pool |
//! | [`pipeline`] | Upload-to-completed orchestration |
//! | [`retriever`] | Query-time retrieval and context building |
//! | [`chat`] | Grounded, cited, streamed answers |
//! | [`server`] | HTTP API |
//! | [`testing`] | Offline test doubles for the external boundaries |

pub mod analyzer;
pub mod chat;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod genai;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod retriever;
pub mod server;
pub mod storage;
pub mod store;
pub mod testing;
pub mod worker;
