//! Deterministic document and chunk identity.
//!
//! | Identifier | Grammar | Example |
//! |------------|---------|---------|
//! | `doc_id` | `{source}:{natural_key}[@{edition}]` | `htsus:84:8407.10@2025-01-01` |
//! | `chunk_id` | `{doc_id}#{locator}` | `htsus:84:8407.10@2025-01-01#s2-o0` |
//! | locator | `s{section}-o{offset}` | `s2-o0` |
//!
//! `doc_id` is a pure function of `(source, natural_key, edition)`, and
//! `content_hash` is the SHA-256 of the canonical text, so re-ingesting the
//! same document reproduces every identifier and hash byte-for-byte.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::models::{Document, SourceKind};

/// Position of a chunk inside its document.
///
/// Orders numerically by `(section, offset)`, which is the document's
/// reading order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Locator {
    pub section: u32,
    pub offset: u32,
}

impl Locator {
    pub fn new(section: u32, offset: u32) -> Self {
        Self { section, offset }
    }
}

impl Ord for Locator {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.section, self.offset).cmp(&(other.section, other.offset))
    }
}

impl PartialOrd for Locator {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}-o{}", self.section, self.offset)
    }
}

impl FromStr for Locator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::InvalidIdentity(format!("malformed locator '{}'", s));
        let rest = s.strip_prefix('s').ok_or_else(bad)?;
        let (section, offset) = rest.split_once("-o").ok_or_else(bad)?;
        Ok(Locator {
            section: section.parse().map_err(|_| bad())?,
            offset: offset.parse().map_err(|_| bad())?,
        })
    }
}

impl TryFrom<String> for Locator {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Locator> for String {
    fn from(locator: Locator) -> Self {
        locator.to_string()
    }
}

/// Build the `doc_id` for a source unit.
///
/// Versioned sources (schedule text, regulations) require an edition;
/// rulings reject one. Keys and editions may not contain the grammar's
/// separators or whitespace.
pub fn assign_document_id(
    source: SourceKind,
    natural_key: &str,
    edition: Option<&str>,
) -> Result<String> {
    check_segment("natural key", natural_key)?;

    match (source.is_versioned(), edition) {
        (true, Some(ed)) => {
            check_segment("edition", ed)?;
            Ok(format!("{}:{}@{}", source.id_prefix(), natural_key, ed))
        }
        (true, None) => Err(Error::InvalidIdentity(format!(
            "{} documents require an edition (key '{}')",
            source, natural_key
        ))),
        (false, Some(ed)) => Err(Error::InvalidIdentity(format!(
            "{} documents are unversioned; unexpected edition '{}'",
            source, ed
        ))),
        (false, None) => Ok(format!("{}:{}", source.id_prefix(), natural_key)),
    }
}

/// Build the `chunk_id` for a locator within a document.
pub fn assign_chunk_id(doc_id: &str, locator: Locator) -> String {
    format!("{}#{}", doc_id, locator)
}

/// Split a `chunk_id` back into its `doc_id` and locator.
pub fn parse_chunk_id(chunk_id: &str) -> Result<(&str, Locator)> {
    let (doc_id, locator) = chunk_id
        .rsplit_once('#')
        .ok_or_else(|| Error::InvalidIdentity(format!("malformed chunk id '{}'", chunk_id)))?;
    Ok((doc_id, locator.parse()?))
}

/// Split a `doc_id` into `(source, natural_key, edition)`.
pub fn parse_document_id(doc_id: &str) -> Result<(SourceKind, &str, Option<&str>)> {
    let (prefix, rest) = doc_id
        .split_once(':')
        .ok_or_else(|| Error::InvalidIdentity(format!("malformed document id '{}'", doc_id)))?;
    let source: SourceKind = prefix.parse()?;
    let (key, edition) = match rest.split_once('@') {
        Some((key, edition)) => (key, Some(edition)),
        None => (rest, None),
    };
    assign_document_id(source, key, edition)?;
    Ok((source, key, edition))
}

/// Lowercase hex SHA-256 of `text`.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Canonical form of document text used for hashing and chunking.
///
/// BOM and no-break spaces become plain spaces, runs of spaces and tabs
/// collapse to one, three or more newlines collapse to a blank line.
pub fn canonicalize(text: &str) -> String {
    static SPACES: OnceLock<Regex> = OnceLock::new();
    static NEWLINES: OnceLock<Regex> = OnceLock::new();
    let spaces = SPACES.get_or_init(|| Regex::new(r"[ \t]+").expect("static regex"));
    let newlines = NEWLINES.get_or_init(|| Regex::new(r"\n{3,}").expect("static regex"));

    let text = text
        .replace("\r\n", "\n")
        .replace(['\u{feff}', '\u{a0}'], " ");
    let text = spaces.replace_all(&text, " ");
    let text = newlines.replace_all(&text, "\n\n");
    text.trim().to_string()
}

/// Outcome of comparing an incoming document against what is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionCheck {
    /// No document with this `doc_id` exists yet.
    New,
    /// Same `doc_id`, same hash: re-ingestion is a no-op.
    Unchanged,
    /// Same `doc_id`, different hash, and no edition bump.
    Conflict { stored_hash: String },
}

pub fn check_version(existing: Option<&Document>, incoming_hash: &str) -> VersionCheck {
    match existing {
        None => VersionCheck::New,
        Some(doc) if doc.content_hash == incoming_hash => VersionCheck::Unchanged,
        Some(doc) => VersionCheck::Conflict {
            stored_hash: doc.content_hash.clone(),
        },
    }
}

fn check_segment(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidIdentity(format!("{} must not be empty", what)));
    }
    if let Some(c) = value
        .chars()
        .find(|c| *c == '#' || *c == '@' || c.is_whitespace())
    {
        return Err(Error::InvalidIdentity(format!(
            "{} '{}' contains reserved character {:?}",
            what, value, c
        )));
    }
    Ok(())
}
