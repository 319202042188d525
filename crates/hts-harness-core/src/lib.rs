//! # HTS Harness Core
//!
//! Retrieval fusion and evidence-grounded guardrail engine for tariff
//! classification: document identity, chunking, BM25 and cosine scoring,
//! hybrid fusion, the answer/retry/abstain guardrail, and the response
//! contract validator.
//!
//! This crate contains no sqlx, HTTP, or filesystem I/O. Capabilities
//! with side effects (storage, embedding, generation, metrics) are traits
//! implemented by the `hts-harness` application.
//!
//! | Module | Role |
//! |--------|------|
//! | [`identity`] | `doc_id`, `chunk_id`, content hashes, version checks |
//! | [`chunk`] | Section-aware sliding-window chunker |
//! | [`lexical`] | BM25 index |
//! | [`semantic`] | Cosine scorer with unknown scores |
//! | [`fusion`] | Min-max normalized weighted fusion |
//! | [`search`] | Candidate pools over an [`index::IndexSnapshot`] |
//! | [`guardrail`] | ANSWER / RETRY / ABSTAIN |
//! | [`validate`] | Strict output schema with one repair |
//! | [`ingest`] | Idempotent ingestion against a [`store::Store`] |

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod fusion;
pub mod generation;
pub mod guardrail;
pub mod identity;
pub mod index;
pub mod ingest;
pub mod lexical;
pub mod metrics;
pub mod models;
pub mod search;
pub mod semantic;
pub mod store;
pub mod validate;
