//! Query evaluation against the in-memory index and the owned result
//! iterator the pipeline's root stage pulls from.

use super::memory::MemoryIndex;
use super::types::{ALL_FIELDS, DocId, FieldMask, FieldType, stem};
use crate::error::{QueryError, Result};
use crate::query::parser::{NumericRange, QueryNode};
use roaring::RoaringBitmap;
use rustc_hash::FxHashMap;

/// Per-term match statistics for one document
#[derive(Debug, Clone, PartialEq)]
pub struct TermHit {
    pub term: String,
    /// Occurrences in the matched fields
    pub freq: u32,
    /// Number of documents containing the term
    pub doc_freq: u32,
    /// Highest weight among the matched fields
    pub weight: f64,
    pub field_mask: FieldMask,
}

/// One matching document as produced by the index scan
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IndexResult {
    pub doc_id: DocId,
    pub hits: Vec<TermHit>,
    /// Token count of the document
    pub doc_len: u32,
    /// A-priori document score
    pub doc_score: f64,
}

/// Source of index results for the root stage.
///
/// Implementations own their data so that a paused cursor does not keep the
/// index borrowed between reads.
pub trait DocIterator: Send {
    fn next_result(&mut self) -> Option<IndexResult>;

    /// Upper bound on the number of remaining results
    fn len_hint(&self) -> usize;
}

/// Materialized results, in doc id order
pub struct ResultsIterator {
    results: std::vec::IntoIter<IndexResult>,
}

impl ResultsIterator {
    pub fn new(results: Vec<IndexResult>) -> Self {
        Self {
            results: results.into_iter(),
        }
    }
}

impl DocIterator for ResultsIterator {
    fn next_result(&mut self) -> Option<IndexResult> {
        self.results.next()
    }

    fn len_hint(&self) -> usize {
        self.results.len()
    }
}

/// Options applied while evaluating a query
#[derive(Debug, Clone)]
pub struct IteratorOptions {
    /// Text fields terms may match in (INFIELDS)
    pub field_mask: FieldMask,
    /// Expand terms with their stem variants
    pub expand: bool,
    /// Documents allowed by legacy filters and INKEYS
    pub filter: Option<RoaringBitmap>,
}

impl Default for IteratorOptions {
    fn default() -> Self {
        Self {
            field_mask: ALL_FIELDS,
            expand: false,
            filter: None,
        }
    }
}

/// Matching documents with their term hits
#[derive(Debug, Default)]
pub(crate) struct MatchSet {
    pub docs: RoaringBitmap,
    pub hits: FxHashMap<DocId, Vec<TermHit>>,
}

impl MatchSet {
    fn intersect(mut self, other: MatchSet) -> MatchSet {
        self.docs &= &other.docs;
        let docs = &self.docs;
        self.hits.retain(|id, _| docs.contains(*id));
        for (id, hits) in other.hits {
            if docs.contains(id) {
                self.hits.entry(id).or_default().extend(hits);
            }
        }
        self
    }

    fn union(mut self, other: MatchSet) -> MatchSet {
        self.docs |= &other.docs;
        for (id, hits) in other.hits {
            self.hits.entry(id).or_default().extend(hits);
        }
        self
    }
}

/// Evaluate a query tree to its set of matching live documents
pub(crate) fn evaluate(
    index: &MemoryIndex,
    node: &QueryNode,
    mask: FieldMask,
    opts: &IteratorOptions,
) -> Result<MatchSet> {
    match node {
        QueryNode::Term(term) => Ok(term_matches(index, term, mask, opts.expand)),
        QueryNode::Prefix(prefix) => {
            let mut set = MatchSet::default();
            for term in index.terms_with_prefix(prefix) {
                set = set.union(term_matches(index, &term, mask, false));
            }
            Ok(set)
        }
        QueryNode::Phrase(words) => Ok(phrase_matches(index, words, mask)),
        QueryNode::Fields { fields, node } => {
            let mut field_mask = 0;
            for name in fields {
                field_mask |= index.field_bit_for_name(name);
            }
            evaluate(index, node, mask & field_mask, opts)
        }
        QueryNode::NumericRange(range) => numeric_matches(index, range),
        QueryNode::Tag { field, values } => {
            let spec = index
                .field_spec_by_name(field)
                .ok_or_else(|| QueryError::syntax(format!("Unknown field `{}`", field)))?;
            if spec.field_type != FieldType::Tag {
                return Err(QueryError::inval(format!("Field `{}` is not a TAG field", field)));
            }
            let mut docs = RoaringBitmap::new();
            for value in values {
                if let Some(bm) = index.tag_docs(field, value) {
                    docs |= bm;
                }
            }
            docs &= index.live_docs();
            Ok(MatchSet {
                docs,
                hits: FxHashMap::default(),
            })
        }
        QueryNode::Wildcard => Ok(MatchSet {
            docs: index.live_docs().clone(),
            hits: FxHashMap::default(),
        }),
        QueryNode::And(children) => {
            let mut iter = children.iter();
            let mut acc = match iter.next() {
                Some(first) => evaluate(index, first, mask, opts)?,
                None => return Ok(MatchSet::default()),
            };
            for child in iter {
                if acc.docs.is_empty() {
                    break;
                }
                acc = acc.intersect(evaluate(index, child, mask, opts)?);
            }
            Ok(acc)
        }
        QueryNode::Or(children) => {
            let mut acc = MatchSet::default();
            for child in children {
                acc = acc.union(evaluate(index, child, mask, opts)?);
            }
            Ok(acc)
        }
        QueryNode::Not(inner) => {
            let excluded = evaluate(index, inner, mask, opts)?;
            Ok(MatchSet {
                docs: index.live_docs() - &excluded.docs,
                hits: FxHashMap::default(),
            })
        }
        QueryNode::Empty => Ok(MatchSet::default()),
    }
}

fn term_matches(index: &MemoryIndex, term: &str, mask: FieldMask, expand: bool) -> MatchSet {
    let mut variants = vec![term.to_string()];
    if expand {
        for variant in index.stem_variants(stem(term)) {
            if variant != term {
                variants.push(variant.clone());
            }
        }
    }

    let mut set = MatchSet::default();
    for variant in &variants {
        let Some(postings) = index.postings(variant) else {
            continue;
        };
        let doc_freq = postings.len() as u32;
        for posting in postings {
            if posting.field_mask & mask == 0 || !index.is_live(posting.doc_id) {
                continue;
            }
            set.docs.insert(posting.doc_id);
            set.hits.entry(posting.doc_id).or_default().push(TermHit {
                term: variant.clone(),
                freq: posting.positions.len() as u32,
                doc_freq,
                weight: index.max_weight(posting.field_mask & mask),
                field_mask: posting.field_mask & mask,
            });
        }
    }
    set
}

fn phrase_matches(index: &MemoryIndex, words: &[String], mask: FieldMask) -> MatchSet {
    let mut set = MatchSet::default();
    let Some(first) = words.first().and_then(|w| index.postings(w)) else {
        return set;
    };

    'docs: for posting in first {
        if posting.field_mask & mask == 0 || !index.is_live(posting.doc_id) {
            continue;
        }
        let mut rest = Vec::with_capacity(words.len() - 1);
        for word in &words[1..] {
            match index.posting_for(word, posting.doc_id) {
                Some(p) if p.field_mask & mask != 0 => rest.push(p),
                _ => continue 'docs,
            }
        }

        let occurrences = posting
            .positions
            .iter()
            .filter(|&&start| {
                rest.iter()
                    .enumerate()
                    .all(|(i, p)| p.positions.binary_search(&(start + i as u32 + 1)).is_ok())
            })
            .count() as u32;
        if occurrences == 0 {
            continue;
        }

        set.docs.insert(posting.doc_id);
        let hits = set.hits.entry(posting.doc_id).or_default();
        for word in words {
            hits.push(TermHit {
                term: word.clone(),
                freq: occurrences,
                doc_freq: index.postings(word).map(|p| p.len() as u32).unwrap_or(0),
                weight: index.max_weight(posting.field_mask & mask),
                field_mask: posting.field_mask & mask,
            });
        }
    }
    set
}

fn numeric_matches(index: &MemoryIndex, range: &NumericRange) -> Result<MatchSet> {
    let docs = index.numeric_docs(&range.field, |v| range.contains(v))?;
    Ok(MatchSet {
        docs,
        hits: FxHashMap::default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::types::{FieldSpec, IndexSpec};
    use crate::pipeline::value::Value;

    fn index() -> MemoryIndex {
        let spec = IndexSpec::new(
            "idx",
            vec![
                FieldSpec::new("title", FieldType::Text).weight(2.0),
                FieldSpec::new("body", FieldType::Text),
                FieldSpec::new("price", FieldType::Numeric),
                FieldSpec::new("color", FieldType::Tag),
            ],
        );
        let mut idx = MemoryIndex::new(spec);
        idx.add_hash_document(
            "p:1",
            vec![
                ("title".into(), Value::from("red running shoe")),
                ("body".into(), Value::from("light shoe")),
                ("price".into(), Value::from(50.0)),
                ("color".into(), Value::from("red")),
            ],
            1.0,
        );
        idx.add_hash_document(
            "p:2",
            vec![
                ("title".into(), Value::from("blue boot")),
                ("body".into(), Value::from("running in the rain")),
                ("price".into(), Value::from(120.0)),
                ("color".into(), Value::from("blue,navy")),
            ],
            1.0,
        );
        idx
    }

    fn ids(set: &MatchSet) -> Vec<u32> {
        set.docs.iter().collect()
    }

    #[test]
    fn test_term_and_field_restriction() {
        let idx = index();
        let opts = IteratorOptions::default();
        let all = evaluate(&idx, &QueryNode::Term("running".into()), ALL_FIELDS, &opts).unwrap();
        assert_eq!(ids(&all), vec![0, 1]);

        let title_only = QueryNode::Fields {
            fields: vec!["title".into()],
            node: Box::new(QueryNode::Term("running".into())),
        };
        let set = evaluate(&idx, &title_only, ALL_FIELDS, &opts).unwrap();
        assert_eq!(ids(&set), vec![0]);
        assert_eq!(set.hits[&0][0].weight, 2.0);
    }

    #[test]
    fn test_phrase_requires_adjacency() {
        let idx = index();
        let opts = IteratorOptions::default();
        let hit = QueryNode::Phrase(vec!["running".into(), "shoe".into()]);
        assert_eq!(ids(&evaluate(&idx, &hit, ALL_FIELDS, &opts).unwrap()), vec![0]);

        let miss = QueryNode::Phrase(vec!["shoe".into(), "running".into()]);
        assert!(evaluate(&idx, &miss, ALL_FIELDS, &opts).unwrap().docs.is_empty());
    }

    #[test]
    fn test_tags_and_not() {
        let idx = index();
        let opts = IteratorOptions::default();
        let navy = QueryNode::Tag {
            field: "color".into(),
            values: vec!["navy".into()],
        };
        assert_eq!(ids(&evaluate(&idx, &navy, ALL_FIELDS, &opts).unwrap()), vec![1]);

        let not_navy = QueryNode::Not(Box::new(navy));
        assert_eq!(ids(&evaluate(&idx, &not_navy, ALL_FIELDS, &opts).unwrap()), vec![0]);
    }

    #[test]
    fn test_numeric_on_text_field_is_error() {
        let idx = index();
        let range = QueryNode::NumericRange(NumericRange {
            field: "title".into(),
            min: 0.0,
            max: 1.0,
            min_inclusive: true,
            max_inclusive: true,
        });
        assert!(evaluate(&idx, &range, ALL_FIELDS, &IteratorOptions::default()).is_err());
    }

    #[test]
    fn test_stem_expansion() {
        let idx = index();
        let mut opts = IteratorOptions::default();
        let node = QueryNode::Term("boots".into());
        assert!(evaluate(&idx, &node, ALL_FIELDS, &opts).unwrap().docs.is_empty());
        opts.expand = true;
        assert_eq!(ids(&evaluate(&idx, &node, ALL_FIELDS, &opts).unwrap()), vec![1]);
    }
}
