//! Scoring functions for search results
//!
//! Each scorer maps one index result to a relevance score:
//! - TFIDF / TFIDF.DOCNORM: term frequency times inverse document frequency
//! - BM25: classic BM25 scaled by the document score
//! - BM25STD and its TANH / NORM variants
//! - DISMAX: sum of weighted term frequencies
//! - DOCSCORE: the a-priori document score

use crate::index::iterator::IndexResult;
use crate::index::types::IndexStats;
use serde::{Deserialize, Serialize};

pub const DEFAULT_SCORER: &str = "TFIDF";

/// Scorer whose output is rescaled by the max-score normalizer
pub const BM25STD_NORM: &str = "BM25STD.NORM";

/// BM25 tuning parameters
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Bm25Weights {
    /// Term frequency saturation
    pub k1: f64,
    /// Document length normalization
    pub b: f64,
}

impl Default for Bm25Weights {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

/// Corpus-level inputs shared by every call of a scoring function
#[derive(Debug, Clone, Copy)]
pub struct ScoringArgs {
    pub stats: IndexStats,
    pub weights: Bm25Weights,
    /// Divisor applied before tanh in BM25STD.TANH
    pub tanh_factor: f64,
}

impl ScoringArgs {
    pub fn new(stats: IndexStats, tanh_factor: u64) -> Self {
        Self {
            stats,
            weights: Bm25Weights::default(),
            tanh_factor: tanh_factor.max(1) as f64,
        }
    }
}

/// A registered scoring function
pub type ScoringFn = fn(&ScoringArgs, &IndexResult) -> f64;

const SCORERS: &[(&str, ScoringFn)] = &[
    ("TFIDF", tfidf),
    ("TFIDF.DOCNORM", tfidf_docnorm),
    ("BM25", bm25),
    ("BM25STD", bm25std),
    ("BM25STD.TANH", bm25std_tanh),
    (BM25STD_NORM, bm25std),
    ("DISMAX", dismax),
    ("DOCSCORE", docscore),
];

/// Look up a scoring function by its registered name
pub fn get_scoring_function(name: &str) -> Option<ScoringFn> {
    SCORERS
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, f)| *f)
}

/// Names of all registered scorers
pub fn scorer_names() -> impl Iterator<Item = &'static str> {
    SCORERS.iter().map(|(n, _)| *n)
}

fn idf(num_docs: u64, doc_freq: u32) -> f64 {
    (1.0 + num_docs as f64 / doc_freq.max(1) as f64).log2()
}

fn bm25_idf(num_docs: u64, doc_freq: u32) -> f64 {
    let n = num_docs as f64;
    let df = doc_freq as f64;
    (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
}

fn tfidf(args: &ScoringArgs, res: &IndexResult) -> f64 {
    let raw: f64 = res
        .hits
        .iter()
        .map(|h| h.freq as f64 * h.weight * idf(args.stats.num_docs, h.doc_freq))
        .sum();
    raw * res.doc_score
}

fn tfidf_docnorm(args: &ScoringArgs, res: &IndexResult) -> f64 {
    if res.doc_len == 0 {
        return 0.0;
    }
    tfidf(args, res) / res.doc_len as f64
}

fn bm25_term_sum(args: &ScoringArgs, res: &IndexResult, idf_fn: fn(u64, u32) -> f64) -> f64 {
    let avg = args.stats.avg_doc_len().max(1.0);
    let Bm25Weights { k1, b } = args.weights;
    let len_norm = 1.0 - b + b * res.doc_len as f64 / avg;
    res.hits
        .iter()
        .map(|h| {
            let f = h.freq as f64;
            idf_fn(args.stats.num_docs, h.doc_freq) * h.weight * (f * (k1 + 1.0)) / (f + k1 * len_norm)
        })
        .sum()
}

fn bm25(args: &ScoringArgs, res: &IndexResult) -> f64 {
    bm25_term_sum(args, res, idf) * res.doc_score
}

fn bm25std(args: &ScoringArgs, res: &IndexResult) -> f64 {
    bm25_term_sum(args, res, bm25_idf) * res.doc_score
}

fn bm25std_tanh(args: &ScoringArgs, res: &IndexResult) -> f64 {
    (bm25std(args, res) / args.tanh_factor).tanh()
}

fn dismax(_args: &ScoringArgs, res: &IndexResult) -> f64 {
    res.hits.iter().map(|h| h.freq as f64 * h.weight).sum()
}

fn docscore(_args: &ScoringArgs, res: &IndexResult) -> f64 {
    res.doc_score
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::iterator::TermHit;

    fn result(freq: u32, doc_len: u32) -> IndexResult {
        IndexResult {
            doc_id: 0,
            hits: vec![TermHit {
                term: "shoe".into(),
                freq,
                doc_freq: 2,
                weight: 1.0,
                field_mask: 1,
            }],
            doc_len,
            doc_score: 1.0,
        }
    }

    fn args() -> ScoringArgs {
        ScoringArgs::new(
            IndexStats {
                num_docs: 10,
                num_terms: 100,
                total_doc_len: 100,
            },
            4,
        )
    }

    #[test]
    fn test_registry_lookup() {
        assert!(get_scoring_function("tfidf").is_some());
        assert!(get_scoring_function("BM25STD.NORM").is_some());
        assert!(get_scoring_function("NOPE").is_none());
        assert_eq!(scorer_names().count(), 8);
    }

    #[test]
    fn test_more_matches_score_higher() {
        for name in ["TFIDF", "BM25", "BM25STD", "DISMAX"] {
            let f = get_scoring_function(name).unwrap();
            assert!(f(&args(), &result(5, 10)) > f(&args(), &result(1, 10)), "{}", name);
        }
    }

    #[test]
    fn test_docnorm_penalizes_long_docs() {
        let f = get_scoring_function("TFIDF.DOCNORM").unwrap();
        assert!(f(&args(), &result(2, 5)) > f(&args(), &result(2, 50)));
    }

    #[test]
    fn test_tanh_is_bounded() {
        let f = get_scoring_function("BM25STD.TANH").unwrap();
        let score = f(&args(), &result(1000, 10));
        assert!(score > 0.0 && score <= 1.0);
    }

    #[test]
    fn test_docscore() {
        let f = get_scoring_function("DOCSCORE").unwrap();
        let mut res = result(1, 1);
        res.doc_score = 0.25;
        assert_eq!(f(&args(), &res), 0.25);
    }
}
