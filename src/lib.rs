//! # Mail Harness
//!
//! Mailbox ingestion, enrichment, and grounded retrieval for an AI mail
//! assistant.
//!
//! Messages flow one way through the pipeline; the assistant reads across
//! every store at query time:
//!
//! ```text
//! ┌──────────┐   ┌──────┐   ┌─────────┐   ┌────────┐   ┌───────┐
//! │ Provider │──▶│ Sync │──▶│ Threads │──▶│ Enrich │──▶│ Index │
//! │ Graph/Dir│   └──┬───┘   └────┬────┘   └───┬────┘   └───┬───┘
//! └──────────┘      ▼            ▼            ▼            ▼
//!               ┌────────────────────────────────┐   ┌──────────┐
//!               │     SQLite (users, messages,   │   │ vectors  │
//!               │     threads, chat log)         │   │ per user │
//!               └───────────────┬────────────────┘   └────┬─────┘
//!                               └──────────┬──────────────┘
//!                                          ▼
//!                                    ┌───────────┐
//!                                    │ Assistant │
//!                                    └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! mailctx init
//! mailctx user add me@example.com --name "Me"
//! mailctx sync --user me@example.com
//! mailctx ask --user me@example.com "summarize my unread emails"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`], [`migrate`] | SQLite pool and schema |
//! | [`models`] | Core data types |
//! | [`store`] | Message Store |
//! | [`provider`], [`provider_graph`], [`provider_dir`] | Upstream mailbox sources |
//! | [`sync`] | Sync Engine |
//! | [`threads`] | Thread Aggregator |
//! | [`llm`], [`enrich`] | LLM client and Enrichment Engine |
//! | [`embedding`], [`vector_store`], [`index`] | Embeddings and the Vector Index |
//! | [`intent`], [`assistant`] | Retrieval & Context Assembler |
//! | [`stats`] | Mailbox analytics |
//! | [`pipeline`] | Caller-facing API |

pub mod assistant;
pub mod cancel;
pub mod config;
pub mod db;
pub mod embedding;
pub mod enrich;
pub mod extract;
pub mod index;
pub mod intent;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod provider;
pub mod provider_dir;
pub mod provider_graph;
pub mod stats;
pub mod store;
pub mod sync;
pub mod threads;
pub mod vector_store;
