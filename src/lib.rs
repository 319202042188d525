//! # HTS Harness
//!
//! Hybrid retrieval and evidence-grounded guardrails for classifying
//! products under the Harmonized Tariff Schedule of the United States.
//!
//! Statute text, CBP rulings and regulations are ingested into SQLite,
//! chunked and optionally embedded. A query is answered only when the fused
//! lexical + semantic evidence is strong enough and the generated answer
//! validates against a strict schema whose citations point at retrieved
//! chunks; otherwise the engine abstains.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌──────────┐
//! │ JSON/JSONL  │──▶│   Ingest    │──▶│  SQLite  │
//! │  records    │   │ Chunk+Embed │   │ docs/vec │
//! └─────────────┘   └─────────────┘   └────┬─────┘
//!                                          │ snapshot
//!                                          ▼
//!                   ┌──────────────────────────────┐
//!                   │ Engine: fuse → guardrail →   │
//!                   │ generate → validate → metrics│
//!                   └──────┬────────────────┬──────┘
//!                          ▼                ▼
//!                     ┌──────────┐     ┌──────────┐
//!                     │   CLI    │     │   HTTP   │
//!                     │  (hts)   │     │  (axum)  │
//!                     └──────────┘     └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! hts init                                 # create database
//! hts ingest data/htsus/                   # ingest JSON/JSONL records
//! hts embed pending                        # backfill embeddings
//! hts classify "reciprocating engine parts"
//! hts serve                                # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] / [`migrate`] | SQLite connection and schema |
//! | [`sqlite_store`] | `Store` implementation over SQLite |
//! | [`embedding`] | Embedding providers (OpenAI, Ollama, stub) |
//! | [`generation`] | Generation providers (OpenAI, Ollama, stub) |
//! | [`prompt`] | Grounded prompt and repair prompt |
//! | [`budget`] | Per-query and monthly token caps |
//! | [`metrics`] | JSONL metrics sink |
//! | [`engine`] | Query pipeline |
//! | [`ingest`] / [`embed_cmd`] | Ingestion and embedding backfill |
//! | [`search`] / [`classify`] / [`get`] / [`stats`] / [`eval`] | CLI commands |
//! | [`server`] | HTTP API |
//!
//! The scoring, fusion, guardrail and validation logic lives in the
//! `hts-harness-core` crate.

pub mod budget;
pub mod classify;
pub mod config;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod engine;
pub mod eval;
pub mod generation;
pub mod get;
mod http;
pub mod ingest;
pub mod metrics;
pub mod migrate;
pub mod prompt;
pub mod search;
pub mod server;
pub mod sqlite_store;
pub mod stats;
