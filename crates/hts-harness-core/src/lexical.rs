//! BM25 lexical scorer over an in-memory inverted index.
//!
//! # Scoring
//!
//! ```text
//!                    tf · (k1 + 1)
//! score = Σ idf(t) · ─────────────────────────────
//!          t         tf + k1 · (1 − b + b · dl/avgdl)
//!
//! idf(t) = ln(1 + (N − df + 0.5) / (df + 0.5))
//! ```
//!
//! `k1` controls term-frequency saturation and `b` controls length
//! normalization. The IDF form is always positive, so every score is
//! non-negative. Distinct query terms count once; terms absent from the
//! vocabulary contribute nothing.
//!
//! Tokens are Unicode words, lowercased. Tariff numbers such as `8407.10`
//! survive as single tokens.
//!
//! # Coverage
//!
//! BM25 scores are only comparable within one query. [`LexicalIndex::coverage`]
//! gives an absolute measure in `[0, 1]` instead: the IDF-weighted share of
//! the query terms a passage contains. A term the vocabulary has never seen
//! weighs as much as a term present in no passage would, so query words the
//! corpus cannot match pull coverage down. A matched term counts in full once
//! its saturated frequency reaches that of one occurrence in an
//! average-length passage.

use std::collections::{BTreeSet, HashMap};

use unicode_segmentation::UnicodeSegmentation;

use crate::error::{Error, Result};

/// Validated BM25 parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bm25Params {
    k1: f64,
    b: f64,
}

impl Bm25Params {
    /// Requires `k1 > 0` and `0 < b <= 1`.
    pub fn new(k1: f64, b: f64) -> Result<Self> {
        if !(k1.is_finite() && k1 > 0.0) {
            return Err(Error::config(format!("retrieval.bm25_k1 must be > 0, got {}", k1)));
        }
        if !(b > 0.0 && b <= 1.0) {
            return Err(Error::config(format!(
                "retrieval.bm25_b must be in (0.0, 1.0], got {}",
                b
            )));
        }
        Ok(Self { k1, b })
    }

    pub fn k1(&self) -> f64 {
        self.k1
    }

    pub fn b(&self) -> f64 {
        self.b
    }
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.4, b: 0.8 }
    }
}

/// Lowercased Unicode word tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.unicode_words().map(str::to_lowercase).collect()
}

/// Distinct query terms in a stable order.
pub fn query_terms(query: &str) -> Vec<String> {
    tokenize(query)
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Inverted index over a fixed, ordered set of passages.
///
/// Passages are addressed by their position in the build input.
#[derive(Debug, Clone)]
pub struct LexicalIndex {
    params: Bm25Params,
    doc_lengths: Vec<usize>,
    avg_len: f64,
    /// term → (passage index, term frequency), sorted by passage index.
    postings: HashMap<String, Vec<(usize, u32)>>,
}

impl LexicalIndex {
    pub fn build<'a, I>(texts: I, params: Bm25Params) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut doc_lengths = Vec::new();
        let mut postings: HashMap<String, Vec<(usize, u32)>> = HashMap::new();

        for (idx, text) in texts.into_iter().enumerate() {
            let tokens = tokenize(text);
            doc_lengths.push(tokens.len());

            let mut tf: HashMap<String, u32> = HashMap::new();
            for token in tokens {
                *tf.entry(token).or_insert(0) += 1;
            }
            for (term, count) in tf {
                postings.entry(term).or_default().push((idx, count));
            }
        }

        let total: usize = doc_lengths.iter().sum();
        let avg_len = if doc_lengths.is_empty() {
            0.0
        } else {
            total as f64 / doc_lengths.len() as f64
        };

        Self {
            params,
            doc_lengths,
            avg_len,
            postings,
        }
    }

    pub fn len(&self) -> usize {
        self.doc_lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_lengths.is_empty()
    }

    pub fn params(&self) -> Bm25Params {
        self.params
    }

    /// Inverse document frequency; zero for unknown terms.
    pub fn idf(&self, term: &str) -> f64 {
        let df = match self.postings.get(term) {
            Some(p) => p.len() as f64,
            None => return 0.0,
        };
        let n = self.len() as f64;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    }

    /// IDF a term would have if no passage contained it.
    pub fn unseen_idf(&self) -> f64 {
        (1.0 + (self.len() as f64 + 0.5) / 0.5).ln()
    }

    /// IDF-weighted share of `query_terms` found in `passage`, in `[0, 1]`.
    pub fn coverage(&self, query_terms: &[String], passage: usize) -> f64 {
        if passage >= self.len() {
            return 0.0;
        }
        let mut matched = 0.0;
        let mut total = 0.0;
        for term in query_terms {
            let Some(list) = self.postings.get(term) else {
                total += self.unseen_idf();
                continue;
            };
            let idf = self.idf(term);
            total += idf;
            if let Ok(pos) = list.binary_search_by_key(&passage, |(idx, _)| *idx) {
                matched += idf * self.saturation(passage, list[pos].1).min(1.0);
            }
        }
        if total > 0.0 {
            (matched / total).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    /// BM25 score of one passage for a set of query terms.
    pub fn score(&self, query_terms: &[String], passage: usize) -> f64 {
        query_terms
            .iter()
            .filter_map(|term| {
                let list = self.postings.get(term)?;
                let pos = list.binary_search_by_key(&passage, |(idx, _)| *idx).ok()?;
                Some(self.term_score(term, passage, list[pos].1))
            })
            .sum()
    }

    /// Scores of every passage matching at least one term, unordered.
    pub fn score_all(&self, query_terms: &[String]) -> Vec<(usize, f64)> {
        let mut acc: HashMap<usize, f64> = HashMap::new();
        for term in query_terms {
            if let Some(list) = self.postings.get(term) {
                for &(passage, tf) in list {
                    *acc.entry(passage).or_insert(0.0) += self.term_score(term, passage, tf);
                }
            }
        }
        acc.into_iter().filter(|(_, s)| *s > 0.0).collect()
    }

    fn term_score(&self, term: &str, passage: usize, tf: u32) -> f64 {
        self.idf(term) * self.saturation(passage, tf)
    }

    /// Length-normalized term-frequency factor; `1.0` for a single
    /// occurrence in an average-length passage.
    fn saturation(&self, passage: usize, tf: u32) -> f64 {
        let tf = tf as f64;
        let dl = self.doc_lengths[passage] as f64;
        let norm = if self.avg_len > 0.0 {
            1.0 - self.params.b + self.params.b * dl / self.avg_len
        } else {
            1.0
        };
        tf * (self.params.k1 + 1.0) / (tf + self.params.k1 * norm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(texts: &[&str]) -> LexicalIndex {
        LexicalIndex::build(texts.iter().copied(), Bm25Params::default())
    }

    #[test]
    fn test_params_validation() {
        assert!(Bm25Params::new(0.0, 0.5).is_err());
        assert!(Bm25Params::new(-1.0, 0.5).is_err());
        assert!(Bm25Params::new(1.2, 0.0).is_err());
        assert!(Bm25Params::new(1.2, 1.1).is_err());
        assert!(Bm25Params::new(f64::NAN, 0.5).is_err());
        assert!(Bm25Params::new(1.2, 1.0).is_ok());
    }

    #[test]
    fn test_tokenize_keeps_tariff_numbers() {
        let tokens = tokenize("Heading 8407.10: Spark-ignition Engines");
        assert_eq!(tokens, vec!["heading", "8407.10", "spark", "ignition", "engines"]);
    }

    #[test]
    fn test_query_terms_are_distinct() {
        assert_eq!(query_terms("engine Engine parts"), vec!["engine", "parts"]);
    }

    #[test]
    fn test_unknown_terms_score_zero() {
        let idx = index(&["reciprocating piston engines", "electric motors"]);
        let terms = vec!["turbine".to_string()];
        assert_eq!(idx.score(&terms, 0), 0.0);
        assert!(idx.score_all(&terms).is_empty());
        assert_eq!(idx.idf("turbine"), 0.0);
    }

    #[test]
    fn test_matching_passage_ranks_first() {
        let idx = index(&[
            "reciprocating piston engines and parts",
            "electric motors and generators",
            "parts of electric motors",
        ]);
        let terms = query_terms("reciprocating engine parts");
        let s0 = idx.score(&terms, 0);
        let s2 = idx.score(&terms, 2);
        assert!(s0 > s2, "{} <= {}", s0, s2);
        assert_eq!(idx.score(&terms, 1), 0.0);
    }

    #[test]
    fn test_term_frequency_saturates() {
        let idx = index(&["motor", "motor motor", "motor motor motor motor motor motor", "x"]);
        let terms = vec!["motor".to_string()];
        let one = idx.score(&terms, 0);
        let two = idx.score(&terms, 1);
        let six = idx.score(&terms, 2);
        assert!(two > one);
        // Four extra occurrences add less than the second one did.
        assert!(six - two < two - one);
        let cap = idx.idf("motor") * (idx.params().k1() + 1.0);
        assert!(six < cap);
    }

    #[test]
    fn test_longer_passage_penalized() {
        let idx = index(&["converter", "converter with a great many other unrelated words in it"]);
        let terms = vec!["converter".to_string()];
        assert!(idx.score(&terms, 0) > idx.score(&terms, 1));
    }

    #[test]
    fn test_score_all_matches_score() {
        let idx = index(&["static converters", "converters and inductors", "engines"]);
        let terms = query_terms("static converters");
        let mut all = idx.score_all(&terms);
        all.sort_by_key(|(i, _)| *i);
        assert_eq!(all.len(), 2);
        for (i, s) in all {
            assert!((s - idx.score(&terms, i)).abs() < 1e-12);
        }
    }

    #[test]
    fn test_deterministic_and_non_negative() {
        let texts = ["a b c", "a a d", "e"];
        let terms = query_terms("a d e");
        let first: Vec<f64> = (0..3).map(|i| index(&texts).score(&terms, i)).collect();
        let second: Vec<f64> = (0..3).map(|i| index(&texts).score(&terms, i)).collect();
        assert_eq!(first, second);
        assert!(first.iter().all(|s| *s >= 0.0));
    }

    #[test]
    fn test_coverage_of_full_match_is_high() {
        let idx = index(&[
            "reciprocating piston engines and engine parts",
            "electric motors and generators",
            "live horses",
        ]);
        let terms = query_terms("reciprocating engine parts");
        let full = idx.coverage(&terms, 0);
        assert!(full > 0.75, "{}", full);
        assert_eq!(idx.coverage(&terms, 1), 0.0);
    }

    #[test]
    fn test_coverage_penalizes_unmatched_terms() {
        let idx = index(&[
            "electric motors of an output not exceeding 37.5 W",
            "spark ignition reciprocating piston engines",
            "ruling on parts of electric motors",
        ]);
        // Only "of" and "output" exist in the corpus.
        let terms = query_terms("output of a zeppelin gondola");
        let weak = idx.coverage(&terms, 0);
        assert!(weak < 0.2, "{}", weak);
        assert!(weak > 0.0);

        let strong = idx.coverage(&query_terms("electric motors output"), 0);
        assert!(strong > weak * 3.0, "{} vs {}", strong, weak);
    }

    #[test]
    fn test_coverage_bounds() {
        let idx = index(&["motor motor motor", "x"]);
        let terms = vec!["motor".to_string()];
        assert!((idx.coverage(&terms, 0) - 1.0).abs() < 1e-12);
        assert_eq!(idx.coverage(&terms, 5), 0.0);
        assert_eq!(idx.coverage(&[], 0), 0.0);
        assert!(idx.unseen_idf() > idx.idf("motor"));
    }

    #[test]
    fn test_empty_index() {
        let idx = index(&[]);
        assert!(idx.is_empty());
        assert!(idx.score_all(&["a".to_string()]).is_empty());
    }
}
