//! SQLite-backed [`Store`] implementation.
//!
//! Every multi-row write runs in one transaction, so a document and its
//! chunk set are replaced together or not at all.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use hts_harness_core::embedding::{blob_to_vec, vec_to_blob};
use hts_harness_core::error::Error;
use hts_harness_core::identity::Locator;
use hts_harness_core::models::{Chunk, Document, Metadata};
use hts_harness_core::store::{Revision, Store, StoreStats};

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

const CHUNK_COLUMNS: &str =
    "chunk_id, doc_id, section, word_offset, text, token_count, content_hash, embedding";

fn chunk_from_row(row: &SqliteRow) -> Result<Chunk> {
    let section: i64 = row.get("section");
    let offset: i64 = row.get("word_offset");
    let token_count: i64 = row.get("token_count");
    let embedding: Option<Vec<u8>> = row.get("embedding");
    Ok(Chunk {
        chunk_id: row.get("chunk_id"),
        doc_id: row.get("doc_id"),
        locator: Locator::new(
            u32::try_from(section).context("chunk section out of range")?,
            u32::try_from(offset).context("chunk offset out of range")?,
        ),
        text: row.get("text"),
        token_count: usize::try_from(token_count).context("chunk token count out of range")?,
        content_hash: row.get("content_hash"),
        embedding: embedding.map(|b| blob_to_vec(&b)),
    })
}

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    let source: String = row.get("source");
    let metadata_json: String = row.get("metadata_json");
    let metadata: Metadata = serde_json::from_str(&metadata_json).map_err(|e| {
        Error::Storage(format!("corrupt metadata for {}: {}", row.get::<String, _>("doc_id"), e))
    })?;
    Ok(Document {
        doc_id: row.get("doc_id"),
        source: source.parse()?,
        natural_key: row.get("natural_key"),
        edition: row.get("edition"),
        revision: row.get("revision"),
        content_hash: row.get("content_hash"),
        title: row.get("title"),
        body: row.get("body"),
        metadata,
        ingested_at: row.get("ingested_at"),
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn put_document(&self, doc: &Document, chunks: &[Chunk]) -> Result<()> {
        if let Some(stray) = chunks.iter().find(|c| c.doc_id != doc.doc_id) {
            bail!(
                "chunk {} does not belong to document {}",
                stray.chunk_id,
                doc.doc_id
            );
        }
        let metadata_json = serde_json::to_string(&doc.metadata)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO documents (doc_id, source, natural_key, edition, revision,
                                   content_hash, title, body, metadata_json, ingested_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(doc_id) DO UPDATE SET
                revision = excluded.revision,
                content_hash = excluded.content_hash,
                title = excluded.title,
                body = excluded.body,
                metadata_json = excluded.metadata_json,
                ingested_at = excluded.ingested_at
            "#,
        )
        .bind(&doc.doc_id)
        .bind(doc.source.as_str())
        .bind(&doc.natural_key)
        .bind(&doc.edition)
        .bind(doc.revision)
        .bind(&doc.content_hash)
        .bind(&doc.title)
        .bind(&doc.body)
        .bind(&metadata_json)
        .bind(doc.ingested_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO document_revisions (doc_id, revision, content_hash, recorded_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&doc.doc_id)
        .bind(doc.revision)
        .bind(&doc.content_hash)
        .bind(doc.ingested_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM chunks WHERE doc_id = ?")
            .bind(&doc.doc_id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            let blob = chunk.embedding.as_deref().map(vec_to_blob);
            sqlx::query(
                r#"
                INSERT INTO chunks (chunk_id, doc_id, section, word_offset, text,
                                    token_count, content_hash, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.chunk_id)
            .bind(&chunk.doc_id)
            .bind(i64::from(chunk.locator.section))
            .bind(i64::from(chunk.locator.offset))
            .bind(&chunk.text)
            .bind(chunk.token_count as i64)
            .bind(&chunk.content_hash)
            .bind(blob)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_document(&self, doc_id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(
            r#"
            SELECT doc_id, source, natural_key, edition, revision, content_hash,
                   title, body, metadata_json, ingested_at
            FROM documents WHERE doc_id = ?
            "#,
        )
        .bind(doc_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(document_from_row).transpose()
    }

    async fn get_chunks(&self, doc_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM chunks WHERE doc_id = ? ORDER BY section ASC, word_offset ASC",
            CHUNK_COLUMNS
        ))
        .bind(doc_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(chunk_from_row).collect()
    }

    async fn delete_document(&self, doc_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE doc_id = ?")
            .bind(doc_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_embedding(&self, chunk_id: &str, vector: &[f32], model: &str) -> Result<()> {
        let result =
            sqlx::query("UPDATE chunks SET embedding = ?, embedding_model = ? WHERE chunk_id = ?")
                .bind(vec_to_blob(vector))
                .bind(model)
                .bind(chunk_id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            bail!("unknown chunk {}", chunk_id);
        }
        Ok(())
    }

    async fn pending_embeddings(&self, limit: usize) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM chunks WHERE embedding IS NULL ORDER BY chunk_id ASC LIMIT ?",
            CHUNK_COLUMNS
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(chunk_from_row).collect()
    }

    async fn clear_embeddings(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE chunks SET embedding = NULL, embedding_model = NULL WHERE embedding IS NOT NULL",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn load_chunks(&self) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM chunks ORDER BY doc_id ASC, section ASC, word_offset ASC",
            CHUNK_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(chunk_from_row).collect()
    }

    async fn revisions(&self, doc_id: &str) -> Result<Vec<Revision>> {
        let rows = sqlx::query(
            r#"
            SELECT doc_id, revision, content_hash, recorded_at
            FROM document_revisions WHERE doc_id = ? ORDER BY revision ASC
            "#,
        )
        .bind(doc_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| Revision {
                doc_id: row.get("doc_id"),
                revision: row.get("revision"),
                content_hash: row.get("content_hash"),
                recorded_at: row.get("recorded_at"),
            })
            .collect())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let embedded: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE embedding IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;
        let revisions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM document_revisions")
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query(
            "SELECT source, COUNT(*) AS n FROM documents GROUP BY source ORDER BY source",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(StoreStats {
            documents: documents as u64,
            chunks: chunks as u64,
            embedded_chunks: embedded as u64,
            revisions: revisions as u64,
            by_source: rows
                .iter()
                .map(|r| (r.get::<String, _>("source"), r.get::<i64, _>("n") as u64))
                .collect(),
        })
    }

    async fn data_version(&self) -> Result<u64> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM index_version WHERE id = 1")
                .fetch_optional(&self.pool)
                .await
                .context("Failed to read index version (run `hts init`)")?;
        Ok(version.unwrap_or(0) as u64)
    }
}
