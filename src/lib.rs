//! # Axon Context Core
//!
//! **Semantic ingestion and retrieval core for a local-first context
//! system.** Given content and a [`source_id::SourceId`], chunk it,
//! embed it, and keep a vector store in sync with exactly the chunks
//! that content currently implies — no older copies, no duplicates.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌─────────────┐
//! │ ScrapeClient│──▶│ EmbedQueue    │──▶│ Background  │
//! │ (external)  │   │ (C5)          │   │ Embedder (C6)│
//! └────────────┘   └──────────────┘   └──────┬──────┘
//!                                             │
//!         ┌───────────────┐                   ▼
//!         │  EmbedPipeline │◀──────────────────┘
//!         │      (C4)      │
//!         └───────┬────────┘
//!                 │
//!        ┌────────┴────────┐
//!        ▼                 ▼
//!  EmbeddingBackend    VectorStore
//!     (C2, HTTP)       (C3, Qdrant/mem)
//!                 ▲
//!                 │
//!            QueryCore (C8)
//! ```
//!
//! Reconciliation ([`reconcile`]) and settings ([`settings`],
//! [`config_root`]) are cross-cutting: the former keeps a domain's
//! tracked URLs honest across crawl passes, the latter resolves and
//! persists the on-disk configuration every other component reads.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`chunk`] | Header-aware, bounded-size text chunker (C1) |
//! | [`embedding`] | `EmbeddingBackend` trait + HTTP implementation (C2) |
//! | [`http_retry`] | Shared exponential-backoff HTTP retry helper |
//! | [`store`] | `VectorStore` trait + Qdrant/in-memory implementations (C3) |
//! | [`pipeline`] | `EmbedPipeline`: chunk → embed → replace-upsert (C4) |
//! | [`queue`] | `EmbedQueue`: crash-safe on-disk job queue (C5) |
//! | [`worker`] | `BackgroundEmbedder`: cooperative queue-draining daemon (C6) |
//! | [`scrape_client`] | Opaque scrape/crawl backend collaborator |
//! | [`reconcile`] | `ReconciliationStore`: per-domain stale-URL detection (C7) |
//! | [`query`] | `QueryCore`: embed, over-fetch, canonicalize, rerank (C8) |
//! | [`settings`] | `EffectiveSettings`: deep-merged, persisted configuration (C9) |
//! | [`config_root`] | Platform config root resolution with `AXON_HOME` override |
//! | [`models`] | `VectorPoint`/`VectorPayload` data model |
//! | [`source_id`] | `SourceId` and its derivation rules |
//! | [`error`] | `CoreError`, the error type every public entry point returns |

pub mod chunk;
pub mod config_root;
pub mod embedding;
pub mod error;
pub mod http_retry;
pub mod models;
pub mod pipeline;
pub mod query;
pub mod queue;
pub mod reconcile;
pub mod scrape_client;
pub mod settings;
pub mod source_id;
pub mod store;
pub mod worker;
