//! Memory Palace — a persistent, auditable, searchable long-term memory
//! store for AI agents, exposed over MCP with an HTTP control plane.
//!
//! Memories are addressed as `domain://path` URIs; many paths (aliases) may
//! point at one memory. Every content write is pre-screened by a Write Guard,
//! serialized through a Write Lane, snapshotted per session for diff and
//! rollback, and indexed asynchronously by a background worker.
//!
//! # Architecture
//!
//! - **Storage**: SQLite with FTS5 for keyword search and
//!   [sqlite-vec](https://github.com/asg017/sqlite-vec) for vector search
//! - **Embeddings**: remote API (OpenAI-compatible) or a deterministic local
//!   hashing fallback
//! - **Retrieval**: multi-stage pipeline — intent routing, keyword + vector
//!   union, optional remote rerank, graceful degradation
//! - **Governance**: vitality decay, human-confirmed two-phase cleanup,
//!   sleep-time consolidation
//! - **Transport**: MCP over stdio (primary) or streamable HTTP, plus an
//!   axum maintenance plane
//!
//! # Modules
//!
//! - [`config`] — configuration from TOML files and environment variables
//! - [`db`] — database initialization, schema, migrations, migration lock
//! - [`store`] — memory/path records, version chain, side-indices
//! - [`guard`] — pre-write duplicate classification
//! - [`lane`] — the global + per-record write serializer
//! - [`snapshot`] — per-session pre-mutation ledger (diff/rollback)
//! - [`retrieval`] — the search pipeline
//! - [`worker`] — the async index job queue
//! - [`governance`] — decay, cleanup review, sleep consolidation
//! - [`core`] — the composition root wiring it all together

pub mod address;
pub mod config;
pub mod core;
pub mod db;
pub mod errors;
pub mod gist;
pub mod governance;
pub mod guard;
pub mod http;
pub mod lane;
pub mod remote;
pub mod resolver;
pub mod retrieval;
pub mod server;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod tools;
pub mod vitality;
pub mod worker;
