//! Idempotent schema creation.
//!
//! | Table | Key | Notes |
//! |-------|-----|-------|
//! | `documents` | `doc_id` | canonical body, content hash, current revision |
//! | `document_revisions` | `(doc_id, revision)` | one row per accepted content version |
//! | `chunks` | `chunk_id` | nullable `embedding` BLOB (little-endian f32) |
//! | `index_version` | `id = 1` | bumped by triggers on every `chunks` write |
//!
//! Child tables reference `documents` with `ON DELETE CASCADE`. Cascaded
//! chunk deletes fire the version triggers too.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            doc_id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            natural_key TEXT NOT NULL,
            edition TEXT,
            revision INTEGER NOT NULL DEFAULT 1,
            content_hash TEXT NOT NULL,
            title TEXT,
            body TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            ingested_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_revisions (
            doc_id TEXT NOT NULL,
            revision INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            recorded_at INTEGER NOT NULL,
            PRIMARY KEY (doc_id, revision),
            FOREIGN KEY (doc_id) REFERENCES documents(doc_id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            chunk_id TEXT PRIMARY KEY,
            doc_id TEXT NOT NULL,
            section INTEGER NOT NULL,
            word_offset INTEGER NOT NULL,
            text TEXT NOT NULL,
            token_count INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            embedding BLOB,
            embedding_model TEXT,
            UNIQUE(doc_id, section, word_offset),
            FOREIGN KEY (doc_id) REFERENCES documents(doc_id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_version (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("INSERT OR IGNORE INTO index_version (id, version) VALUES (1, 0)")
        .execute(pool)
        .await?;

    for (name, event) in [
        ("chunks_version_insert", "INSERT"),
        ("chunks_version_update", "UPDATE"),
        ("chunks_version_delete", "DELETE"),
    ] {
        sqlx::query(&format!(
            "CREATE TRIGGER IF NOT EXISTS {} AFTER {} ON chunks \
             BEGIN UPDATE index_version SET version = version + 1 WHERE id = 1; END",
            name, event
        ))
        .execute(pool)
        .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_doc_id ON chunks(doc_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_source ON documents(source)")
        .execute(pool)
        .await?;

    Ok(())
}
