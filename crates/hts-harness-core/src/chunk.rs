//! Section-aware sliding-window chunker.
//!
//! Splits canonical document text into overlapping word windows. Each chunk
//! gets a [`Locator`] (`s{section}-o{word_offset}`), a word count, and a
//! SHA-256 of its text.
//!
//! # Algorithm
//!
//! 1. Canonicalize the text and split it into blocks on blank lines.
//! 2. Classify each block: a heading is a single line of at most
//!    [`MAX_HEADING_WORDS`] words that does not end in sentence punctuation,
//!    or any line starting with `#`.
//! 3. Merge consecutive headings and prefix them to the next body block. The
//!    merged block is one section. A trailing heading is its own section.
//! 4. Window each section over whitespace-delimited words: `window_size`
//!    words per window, stepping by `window_size - overlap`. The first window
//!    of a section always covers the whole heading plus one body word, so a
//!    heading never straddles a boundary.
//!
//! The output is a pure function of `(text, window_size, overlap)`.
//!
//! # Example
//!
//! ```rust
//! use hts_harness_core::chunk::{chunk_text, ChunkingPolicy};
//!
//! let policy = ChunkingPolicy::new(50, 10).unwrap();
//! let spans = chunk_text("8407\n\nSpark-ignition reciprocating engines.", &policy);
//! assert_eq!(spans.len(), 1);
//! assert_eq!(spans[0].text, "8407 Spark-ignition reciprocating engines.");
//! assert_eq!(spans[0].locator.to_string(), "s0-o0");
//! ```

use crate::error::{Error, Result};
use crate::identity::{assign_chunk_id, canonicalize, content_hash, Locator};
use crate::models::Chunk;

/// Longest single-line block still treated as a heading.
pub const MAX_HEADING_WORDS: usize = 12;

/// Validated window/overlap pair, in words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingPolicy {
    window_size: usize,
    overlap: usize,
}

impl ChunkingPolicy {
    /// Fails unless `0 < window_size` and `overlap < window_size`.
    pub fn new(window_size: usize, overlap: usize) -> Result<Self> {
        if window_size == 0 {
            return Err(Error::config("chunking.window_size must be > 0"));
        }
        if overlap >= window_size {
            return Err(Error::config(format!(
                "chunking.overlap ({}) must be smaller than chunking.window_size ({})",
                overlap, window_size
            )));
        }
        Ok(Self {
            window_size,
            overlap,
        })
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }
}

/// One window of text with its position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpan {
    pub text: String,
    pub locator: Locator,
    pub token_count: usize,
}

struct Section<'a> {
    heading_len: usize,
    words: Vec<&'a str>,
}

/// Split `text` into ordered, overlapping spans.
pub fn chunk_text(text: &str, policy: &ChunkingPolicy) -> Vec<ChunkSpan> {
    let canonical = canonicalize(text);
    let mut spans = Vec::new();

    for (section_idx, section) in split_sections(&canonical).iter().enumerate() {
        let n = section.words.len();
        let mut start = 0usize;
        let mut end = policy.window_size.max(section.heading_len + 1).min(n);

        loop {
            let words = &section.words[start..end];
            spans.push(ChunkSpan {
                text: words.join(" "),
                locator: Locator::new(section_idx as u32, start as u32),
                token_count: words.len(),
            });
            if end >= n {
                break;
            }
            start = end - policy.overlap;
            end = (start + policy.window_size).min(n);
        }
    }

    spans
}

/// Chunk a document body and assign chunk identities and hashes.
pub fn build_chunks(doc_id: &str, text: &str, policy: &ChunkingPolicy) -> Vec<Chunk> {
    chunk_text(text, policy)
        .into_iter()
        .map(|span| Chunk {
            chunk_id: assign_chunk_id(doc_id, span.locator),
            doc_id: doc_id.to_string(),
            content_hash: content_hash(&span.text),
            locator: span.locator,
            token_count: span.token_count,
            text: span.text,
            embedding: None,
        })
        .collect()
}

fn split_sections(canonical: &str) -> Vec<Section<'_>> {
    let mut sections = Vec::new();
    let mut pending_heading: Vec<&str> = Vec::new();

    for block in canonical.split("\n\n").map(str::trim) {
        if block.is_empty() {
            continue;
        }
        if is_heading(block) {
            pending_heading.extend(block.split_whitespace());
            continue;
        }
        let heading_len = pending_heading.len();
        let mut words = std::mem::take(&mut pending_heading);
        words.extend(block.split_whitespace());
        sections.push(Section { heading_len, words });
    }

    if !pending_heading.is_empty() {
        // Only a heading remains; it is its own section.
        sections.push(Section {
            heading_len: 0,
            words: pending_heading,
        });
    }

    sections
}

fn is_heading(block: &str) -> bool {
    if block.starts_with('#') && !block.contains('\n') {
        return true;
    }
    !block.contains('\n')
        && block.split_whitespace().count() <= MAX_HEADING_WORDS
        && !block.ends_with(['.', ';', ','])
}
