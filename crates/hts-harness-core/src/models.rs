//! Core data models: source documents, passage chunks, and ingestion input.
//!
//! Identifiers on these types are produced exclusively by
//! [`identity`](crate::identity); every other module treats them as opaque.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::identity::Locator;

/// Kind of legal source a document was ingested from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// Tariff schedule text (HTSUS headings, notes).
    StatuteText,
    /// Customs rulings (HQ / NY letters).
    Ruling,
    /// Regulations (19 CFR).
    Regulation,
}

impl SourceKind {
    /// Tag rendered as the first segment of a `doc_id`.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            SourceKind::StatuteText => "htsus",
            SourceKind::Ruling => "ruling",
            SourceKind::Regulation => "cfr",
        }
    }

    /// Name used in configuration files and ingestion records.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::StatuteText => "statute-text",
            SourceKind::Ruling => "ruling",
            SourceKind::Regulation => "regulation",
        }
    }

    /// Whether documents of this kind must carry an edition label.
    ///
    /// A ruling is issued once and never re-edited in place; schedule text
    /// and regulations are republished.
    pub fn is_versioned(&self) -> bool {
        !matches!(self, SourceKind::Ruling)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "statute-text" | "htsus" => Ok(SourceKind::StatuteText),
            "ruling" => Ok(SourceKind::Ruling),
            "regulation" | "cfr" => Ok(SourceKind::Regulation),
            other => Err(crate::error::Error::InvalidIdentity(format!(
                "unknown source kind '{}': expected statute-text, ruling, or regulation",
                other
            ))),
        }
    }
}

/// A scalar metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// Free-form document metadata. Ordered so serialization is stable.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// One ingested legal source unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: String,
    pub source: SourceKind,
    pub natural_key: String,
    pub edition: Option<String>,
    /// Starts at 1; bumped when a conflicting re-ingestion is accepted.
    pub revision: i64,
    /// SHA-256 of the canonical body.
    pub content_hash: String,
    pub title: Option<String>,
    /// Canonical text.
    pub body: String,
    pub metadata: Metadata,
    /// Unix timestamp (seconds).
    pub ingested_at: i64,
}

/// A contiguous passage of one [`Document`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub locator: Locator,
    pub text: String,
    pub token_count: usize,
    pub content_hash: String,
    /// Absent until embedded, or permanently in lexical-only deployments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// A raw document handed to [`ingest`](crate::ingest::ingest).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentInput {
    pub source: SourceKind,
    pub natural_key: String,
    #[serde(default)]
    pub edition: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_kind_parses_both_spellings() {
        assert_eq!(
            "statute-text".parse::<SourceKind>().unwrap(),
            SourceKind::StatuteText
        );
        assert_eq!("htsus".parse::<SourceKind>().unwrap(), SourceKind::StatuteText);
        assert_eq!("cfr".parse::<SourceKind>().unwrap(), SourceKind::Regulation);
        assert!("wiki".parse::<SourceKind>().is_err());
    }

    #[test]
    fn test_rulings_are_unversioned() {
        assert!(!SourceKind::Ruling.is_versioned());
        assert!(SourceKind::StatuteText.is_versioned());
        assert!(SourceKind::Regulation.is_versioned());
    }

    #[test]
    fn test_metadata_scalars_deserialize_untagged() {
        let m: Metadata =
            serde_json::from_str(r#"{"chapter": 84, "heading": "8407.10", "general": true, "w": 0.5}"#)
                .unwrap();
        assert_eq!(m["chapter"], MetadataValue::Int(84));
        assert_eq!(m["heading"], MetadataValue::Text("8407.10".into()));
        assert_eq!(m["general"], MetadataValue::Bool(true));
        assert_eq!(m["w"], MetadataValue::Float(0.5));
    }

    #[test]
    fn test_document_input_defaults() {
        let input: DocumentInput = serde_json::from_str(
            r#"{"source": "ruling", "natural_key": "HQ-H301619", "text": "Body"}"#,
        )
        .unwrap();
        assert_eq!(input.source, SourceKind::Ruling);
        assert!(input.edition.is_none());
        assert!(input.metadata.is_empty());
    }
}
