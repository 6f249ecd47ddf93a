//! In-memory document store and inverted index.

use super::iterator::{self, DocIterator, IndexResult, IteratorOptions, ResultsIterator};
use super::types::*;
use crate::error::{QueryError, Result};
use crate::pipeline::value::Value;
use crate::query::parser::QueryNode;
use crate::utils::tokenizer;
use anyhow::Context;
use roaring::RoaringBitmap;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

/// Position gap between fields so phrases never span two fields
const FIELD_POSITION_GAP: u32 = 1000;

/// Postings of one term in one document
#[derive(Debug, Clone)]
pub struct Posting {
    pub doc_id: DocId,
    pub field_mask: FieldMask,
    /// Sorted token positions
    pub positions: Vec<u32>,
}

/// Stored document body
#[derive(Debug, Clone)]
pub enum DocBody {
    Hash(Vec<(String, Value)>),
    Json(serde_json::Value),
}

/// Document entry in the document table
#[derive(Debug, Clone)]
pub struct StoredDoc {
    pub key: String,
    pub body: DocBody,
    pub score: f64,
    /// Number of indexed tokens
    pub len: u32,
}

/// In-memory index over HASH or JSON documents
pub struct MemoryIndex {
    spec: IndexSpec,
    schema: Arc<SchemaCache>,
    docs: Vec<Option<StoredDoc>>,
    keys: FxHashMap<String, DocId>,
    live: RoaringBitmap,
    terms: FxHashMap<String, Vec<Posting>>,
    stems: FxHashMap<String, Vec<String>>,
    tags: FxHashMap<String, FxHashMap<String, RoaringBitmap>>,
    numeric: FxHashMap<String, Vec<(DocId, f64)>>,
    geo: FxHashMap<String, Vec<(DocId, f64, f64)>>,
    total_doc_len: u64,
}

impl MemoryIndex {
    pub fn new(spec: IndexSpec) -> Self {
        let schema = Arc::new(SchemaCache::new(spec.fields.clone()));
        Self {
            spec,
            schema,
            docs: Vec::new(),
            keys: FxHashMap::default(),
            live: RoaringBitmap::new(),
            terms: FxHashMap::default(),
            stems: FxHashMap::default(),
            tags: FxHashMap::default(),
            numeric: FxHashMap::default(),
            geo: FxHashMap::default(),
            total_doc_len: 0,
        }
    }

    /// Load an index definition plus documents from a JSON fixture file
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read index file {}", path.display()))?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> anyhow::Result<Self> {
        let def: IndexFile = serde_json::from_str(content).context("Failed to parse index file")?;
        let mut spec = IndexSpec::new(&def.name, def.schema);
        spec.kind = def.kind;
        spec.store_offsets = def.store_offsets;
        if let Some(words) = def.stopwords {
            spec.stopwords = Arc::new(StopWordList::from_words(words));
        }
        if !def.prefixes.is_empty() {
            spec.prefixes = def.prefixes;
        }
        if let Some(lang) = def.language {
            spec.language = Language::from_name(&lang)
                .with_context(|| format!("Unknown index language {}", lang))?;
        }
        if spec.kind == IndexKind::Json {
            for field in &mut spec.fields {
                if field.path.is_empty() {
                    field.path = format!("$.{}", field.name);
                }
            }
        }

        let mut index = MemoryIndex::new(spec);
        for doc in def.documents {
            match index.spec.kind {
                IndexKind::Hash => {
                    let fields = match doc.fields {
                        serde_json::Value::Object(map) => map
                            .iter()
                            .map(|(k, v)| (k.clone(), Value::from_json(v)))
                            .collect(),
                        other => anyhow::bail!("Document {} must be an object, got {}", doc.key, other),
                    };
                    index.add_hash_document(&doc.key, fields, doc.score);
                }
                IndexKind::Json => {
                    index.add_json_document(&doc.key, doc.fields, doc.score);
                }
            }
        }
        Ok(index)
    }

    pub fn spec(&self) -> &IndexSpec {
        &self.spec
    }

    pub fn schema_cache(&self) -> Arc<SchemaCache> {
        Arc::clone(&self.schema)
    }

    pub fn field_spec_by_name(&self, name: &str) -> Option<&FieldSpec> {
        self.schema.field(name)
    }

    /// Field bit of a TEXT field, 0 for anything else
    pub fn field_bit_for_name(&self, name: &str) -> FieldMask {
        self.schema
            .field(name)
            .filter(|f| f.is_text())
            .map(|f| f.bit)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            num_docs: self.live.len(),
            num_terms: self.terms.len() as u64,
            total_doc_len: self.total_doc_len,
        }
    }

    pub fn num_docs(&self) -> u64 {
        self.live.len()
    }

    /// Add a HASH document, replacing any document with the same key
    pub fn add_hash_document(&mut self, key: &str, fields: Vec<(String, Value)>, score: f64) -> DocId {
        self.insert(key, DocBody::Hash(fields), score)
    }

    /// Add a JSON document, replacing any document with the same key
    pub fn add_json_document(&mut self, key: &str, json: serde_json::Value, score: f64) -> DocId {
        self.insert(key, DocBody::Json(json), score)
    }

    fn insert(&mut self, key: &str, body: DocBody, score: f64) -> DocId {
        self.delete_document(key);

        let doc_id = self.docs.len() as DocId;
        let mut doc = StoredDoc {
            key: key.to_string(),
            body,
            score,
            len: 0,
        };

        let fields = self.schema.fields().to_vec();
        for (field_idx, field) in fields.iter().enumerate() {
            let Some(value) = body_field(&doc.body, &field.path) else {
                continue;
            };
            match field.field_type {
                FieldType::Text => {
                    let base = field_idx as u32 * FIELD_POSITION_GAP;
                    let mut pos = 0u32;
                    for element in value.elements() {
                        for term in tokenizer::terms(&element.to_string()) {
                            if !self.spec.stopwords.contains(&term) {
                                self.add_posting(&term, doc_id, field.bit, base + pos);
                                doc.len += 1;
                            }
                            pos += 1;
                        }
                    }
                }
                FieldType::Numeric => {
                    if let Some(n) = value.as_number() {
                        self.numeric.entry(field.name.clone()).or_default().push((doc_id, n));
                    }
                }
                FieldType::Tag => {
                    for tag in tag_values(&value) {
                        self.tags
                            .entry(field.name.clone())
                            .or_default()
                            .entry(tag)
                            .or_default()
                            .insert(doc_id);
                    }
                }
                FieldType::Geo => {
                    if let Some((lon, lat)) = parse_geo(&value) {
                        self.geo.entry(field.name.clone()).or_default().push((doc_id, lon, lat));
                    }
                }
            }
        }

        self.total_doc_len += doc.len as u64;
        self.keys.insert(key.to_string(), doc_id);
        self.live.insert(doc_id);
        self.docs.push(Some(doc));
        doc_id
    }

    fn add_posting(&mut self, term: &str, doc_id: DocId, bit: FieldMask, pos: u32) {
        let postings = match self.terms.get_mut(term) {
            Some(p) => p,
            None => {
                self.stems
                    .entry(stem(term).to_string())
                    .or_default()
                    .push(term.to_string());
                self.terms.entry(term.to_string()).or_default()
            }
        };
        match postings.last_mut() {
            Some(last) if last.doc_id == doc_id => {
                last.field_mask |= bit;
                last.positions.push(pos);
            }
            _ => postings.push(Posting {
                doc_id,
                field_mask: bit,
                positions: vec![pos],
            }),
        }
    }

    /// Delete a document by key. Postings stay until the index is rebuilt; the
    /// document is dropped from the live set immediately.
    pub fn delete_document(&mut self, key: &str) -> bool {
        let Some(doc_id) = self.keys.remove(key) else {
            return false;
        };
        if let Some(doc) = self.docs.get_mut(doc_id as usize).and_then(|d| d.take()) {
            self.total_doc_len -= doc.len as u64;
        }
        self.live.remove(doc_id);
        true
    }

    pub fn live_docs(&self) -> &RoaringBitmap {
        &self.live
    }

    pub fn is_live(&self, doc_id: DocId) -> bool {
        self.live.contains(doc_id)
    }

    pub fn document(&self, doc_id: DocId) -> Option<&StoredDoc> {
        self.docs.get(doc_id as usize).and_then(|d| d.as_ref())
    }

    pub fn doc_id_for_key(&self, key: &str) -> Option<DocId> {
        self.keys.get(key).copied()
    }

    /// Read one field of a stored document.
    ///
    /// On JSON indexes a plain name is resolved through the schema to its
    /// JSON path, then tried as a top-level member.
    pub fn document_field(&self, doc_id: DocId, path: &str) -> Option<Value> {
        let doc = self.document(doc_id)?;
        match &doc.body {
            DocBody::Hash(_) => body_field(&doc.body, path),
            DocBody::Json(_) if path.starts_with('$') => body_field(&doc.body, path),
            DocBody::Json(_) => {
                let json_path = self
                    .schema
                    .field(path)
                    .map(|f| f.path.clone())
                    .unwrap_or_else(|| format!("$.{}", path));
                body_field(&doc.body, &json_path)
            }
        }
    }

    /// All fields of a stored document. JSON documents come back as a single
    /// `$` field holding the serialized document.
    pub fn document_fields(&self, doc_id: DocId) -> Vec<(String, Value)> {
        match self.document(doc_id).map(|d| &d.body) {
            Some(DocBody::Hash(fields)) => fields.clone(),
            Some(DocBody::Json(json)) => vec![("$".to_string(), Value::String(json.to_string()))],
            None => Vec::new(),
        }
    }

    pub(crate) fn postings(&self, term: &str) -> Option<&[Posting]> {
        self.terms.get(term).map(|p| p.as_slice())
    }

    pub(crate) fn posting_for(&self, term: &str, doc_id: DocId) -> Option<&Posting> {
        let postings = self.terms.get(term)?;
        postings
            .binary_search_by_key(&doc_id, |p| p.doc_id)
            .ok()
            .map(|i| &postings[i])
    }

    pub(crate) fn stem_variants(&self, stem: &str) -> &[String] {
        self.stems.get(stem).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub(crate) fn terms_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut terms: Vec<String> = self
            .terms
            .keys()
            .filter(|t| t.starts_with(prefix))
            .cloned()
            .collect();
        terms.sort();
        terms
    }

    pub(crate) fn tag_docs(&self, field: &str, tag: &str) -> Option<&RoaringBitmap> {
        self.tags.get(field).and_then(|t| t.get(tag))
    }

    /// Highest weight among the text fields in `mask`
    pub(crate) fn max_weight(&self, mask: FieldMask) -> f64 {
        self.schema
            .text_fields()
            .filter(|f| f.bit & mask != 0)
            .map(|f| f.weight)
            .fold(0.0, f64::max)
    }

    /// Live documents whose NUMERIC `field` satisfies `pred`
    pub fn numeric_docs(&self, field: &str, pred: impl Fn(f64) -> bool) -> Result<RoaringBitmap> {
        self.require_field(field, FieldType::Numeric)?;
        let mut docs = RoaringBitmap::new();
        for &(doc_id, value) in self.numeric.get(field).map(|v| v.as_slice()).unwrap_or(&[]) {
            if self.live.contains(doc_id) && pred(value) {
                docs.insert(doc_id);
            }
        }
        Ok(docs)
    }

    /// Live documents whose GEO `field` lies within `radius_m` meters
    pub fn geo_docs(&self, field: &str, lon: f64, lat: f64, radius_m: f64) -> Result<RoaringBitmap> {
        self.require_field(field, FieldType::Geo)?;
        let mut docs = RoaringBitmap::new();
        for &(doc_id, dlon, dlat) in self.geo.get(field).map(|v| v.as_slice()).unwrap_or(&[]) {
            if self.live.contains(doc_id) && haversine_m(lon, lat, dlon, dlat) <= radius_m {
                docs.insert(doc_id);
            }
        }
        Ok(docs)
    }

    /// Live documents with one of the given keys
    pub fn docs_for_keys<S: AsRef<str>>(&self, keys: &[S]) -> RoaringBitmap {
        keys.iter()
            .filter_map(|k| self.doc_id_for_key(k.as_ref()))
            .filter(|id| self.live.contains(*id))
            .collect()
    }

    fn require_field(&self, field: &str, expected: FieldType) -> Result<&FieldSpec> {
        let spec = self
            .schema
            .field(field)
            .ok_or_else(|| QueryError::syntax(format!("Unknown field `{}`", field)))?;
        if spec.field_type != expected {
            return Err(QueryError::inval(format!(
                "Field `{}` is not a {} field",
                field,
                expected.as_str()
            )));
        }
        Ok(spec)
    }

    /// Evaluate a query and materialize the matching documents.
    ///
    /// The returned iterator owns its results, so it can outlive the read
    /// lock this index is borrowed under.
    pub fn iterator_for_query(
        &self,
        root: &QueryNode,
        opts: &IteratorOptions,
    ) -> Result<Box<dyn DocIterator>> {
        let mut matches = iterator::evaluate(self, root, opts.field_mask, opts)?;
        if let Some(filter) = &opts.filter {
            matches.docs &= filter;
        }

        let mut results = Vec::with_capacity(matches.docs.len() as usize);
        for doc_id in matches.docs.iter() {
            let Some(doc) = self.document(doc_id) else {
                continue;
            };
            results.push(IndexResult {
                doc_id,
                hits: matches.hits.remove(&doc_id).unwrap_or_default(),
                doc_len: doc.len,
                doc_score: doc.score,
            });
        }
        Ok(Box::new(ResultsIterator::new(results)))
    }
}

fn body_field(body: &DocBody, path: &str) -> Option<Value> {
    match body {
        DocBody::Hash(fields) => fields
            .iter()
            .find(|(name, _)| name == path)
            .map(|(_, v)| v.clone()),
        DocBody::Json(json) => {
            let rest = path.strip_prefix('$').unwrap_or(path);
            if rest.is_empty() {
                return Some(Value::String(json.to_string()));
            }
            let mut cur = json;
            for segment in rest.trim_start_matches('.').split('.') {
                cur = cur.get(segment)?;
            }
            Some(Value::from_json(cur))
        }
    }
}

fn tag_values(value: &Value) -> Vec<String> {
    let mut tags = Vec::new();
    for element in value.elements() {
        for tag in element.to_string().split(',') {
            let tag = tag.trim().to_lowercase();
            if !tag.is_empty() {
                tags.push(tag);
            }
        }
    }
    tags
}

/// Parse a `lon,lat` pair
pub fn parse_geo(value: &Value) -> Option<(f64, f64)> {
    let text = value.to_string();
    let (lon, lat) = text.split_once(',')?;
    let lon: f64 = lon.trim().parse().ok()?;
    let lat: f64 = lat.trim().parse().ok()?;
    ((-180.0..=180.0).contains(&lon) && (-85.06..=85.06).contains(&lat)).then_some((lon, lat))
}

const EARTH_RADIUS_M: f64 = 6_372_797.560856;

/// Great-circle distance in meters
pub fn haversine_m(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> f64 {
    let (lat1, lat2) = (lat1.to_radians(), lat2.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

/// On-disk fixture format
#[derive(Debug, Deserialize)]
struct IndexFile {
    #[serde(default = "default_index_name")]
    name: String,
    #[serde(default)]
    kind: IndexKind,
    schema: Vec<FieldSpec>,
    #[serde(default)]
    stopwords: Option<Vec<String>>,
    #[serde(default = "default_true")]
    store_offsets: bool,
    #[serde(default)]
    prefixes: Vec<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    documents: Vec<DocumentFile>,
}

#[derive(Debug, Deserialize)]
struct DocumentFile {
    key: String,
    #[serde(default = "default_doc_score")]
    score: f64,
    fields: serde_json::Value,
}

fn default_index_name() -> String {
    "idx".to_string()
}

fn default_true() -> bool {
    true
}

fn default_doc_score() -> f64 {
    1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"{
        "name": "products",
        "schema": [
            {"name": "title", "type": "TEXT", "weight": 2.0},
            {"name": "price", "type": "NUMERIC", "sortable": true},
            {"name": "loc", "type": "GEO"}
        ],
        "documents": [
            {"key": "p:1", "fields": {"title": "Red shoe", "price": 10, "loc": "-0.1,51.5"}},
            {"key": "p:2", "fields": {"title": "Blue boot", "price": "25", "loc": "2.35,48.85"}}
        ]
    }"#;

    #[test]
    fn test_load_fixture() {
        let idx = MemoryIndex::from_json_str(FIXTURE).unwrap();
        assert_eq!(idx.num_docs(), 2);
        assert_eq!(idx.field_bit_for_name("title"), 1);
        assert_eq!(idx.field_bit_for_name("price"), 0);
        assert_eq!(idx.document_field(1, "price"), Some(Value::from("25")));
    }

    #[test]
    fn test_load_json_kind() {
        let idx = MemoryIndex::from_json_str(
            r#"{
                "kind": "JSON",
                "schema": [{ "name": "stock", "type": "NUMERIC" }],
                "documents": [
                    { "key": "item:1", "fields": { "stock": 3 } },
                    { "key": "item:2", "fields": { "stock": 0 } }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(idx.spec().kind, IndexKind::Json);
        assert_eq!(idx.num_docs(), 2);
        assert_eq!(idx.spec().fields[0].path, "$.stock");
    }

    #[test]
    fn test_replace_and_delete() {
        let mut idx = MemoryIndex::from_json_str(FIXTURE).unwrap();
        let new_id = idx.add_hash_document("p:1", vec![("title".into(), Value::from("green"))], 1.0);
        assert_eq!(new_id, 2);
        assert!(!idx.is_live(0));
        assert_eq!(idx.num_docs(), 2);

        assert!(idx.delete_document("p:2"));
        assert!(!idx.delete_document("p:2"));
        assert!(idx.document(1).is_none());
        assert_eq!(idx.num_docs(), 1);
    }

    #[test]
    fn test_numeric_and_geo_filters() {
        let idx = MemoryIndex::from_json_str(FIXTURE).unwrap();
        let cheap = idx.numeric_docs("price", |v| v < 20.0).unwrap();
        assert_eq!(cheap.iter().collect::<Vec<_>>(), vec![0]);

        let london = idx.geo_docs("loc", -0.12, 51.5, 10_000.0).unwrap();
        assert_eq!(london.iter().collect::<Vec<_>>(), vec![0]);

        assert!(idx.numeric_docs("title", |_| true).is_err());
        assert!(idx.numeric_docs("nope", |_| true).is_err());
    }

    #[test]
    fn test_json_documents() {
        let mut spec = IndexSpec::new(
            "j",
            vec![FieldSpec {
                path: "$.info.name".into(),
                ..FieldSpec::new("name", FieldType::Text)
            }],
        );
        spec.kind = IndexKind::Json;
        let mut idx = MemoryIndex::new(spec);
        idx.add_json_document("j:1", serde_json::json!({"info": {"name": "Widget"}}), 1.0);

        assert_eq!(idx.document_field(0, "name"), Some(Value::from("Widget")));
        let all = idx.document_fields(0);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "$");
        assert!(idx.postings("widget").is_some());
    }

    #[test]
    fn test_iterator_skips_filtered_docs() {
        let idx = MemoryIndex::from_json_str(FIXTURE).unwrap();
        let opts = IteratorOptions {
            filter: Some(idx.docs_for_keys(&["p:2"])),
            ..IteratorOptions::default()
        };
        let mut it = idx.iterator_for_query(&QueryNode::Wildcard, &opts).unwrap();
        assert_eq!(it.len_hint(), 1);
        assert_eq!(it.next_result().map(|r| r.doc_id), Some(1));
        assert!(it.next_result().is_none());
    }
}
