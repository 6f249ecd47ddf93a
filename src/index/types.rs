use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Unique identifier for a document in the index
pub type DocId = u32;

/// Bit mask of text fields (one bit per TEXT field, at most 64)
pub type FieldMask = u64;

pub const ALL_FIELDS: FieldMask = FieldMask::MAX;

/// Schema field types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldType {
    Text,
    Numeric,
    Tag,
    Geo,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "TEXT",
            FieldType::Numeric => "NUMERIC",
            FieldType::Tag => "TAG",
            FieldType::Geo => "GEO",
        }
    }
}

/// A single schema field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    /// Storage path; equals `name` for HASH indexes, `$.name` style for JSON
    #[serde(default)]
    pub path: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub sortable: bool,
    /// Scoring weight for TEXT fields
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Field bit assigned by the schema cache (TEXT fields only)
    #[serde(skip)]
    pub bit: FieldMask,
}

fn default_weight() -> f64 {
    1.0
}

impl FieldSpec {
    pub fn new(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            path: name.to_string(),
            field_type,
            sortable: false,
            weight: 1.0,
            bit: 0,
        }
    }

    pub fn sortable(mut self) -> Self {
        self.sortable = true;
        self
    }

    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn is_text(&self) -> bool {
        self.field_type == FieldType::Text
    }
}

/// Kind of documents the index stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IndexKind {
    #[default]
    Hash,
    Json,
}

/// Supported document languages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    English,
    French,
    German,
    Spanish,
    Italian,
    Portuguese,
    Dutch,
    Russian,
    Chinese,
}

impl Language {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "english" => Some(Language::English),
            "french" => Some(Language::French),
            "german" => Some(Language::German),
            "spanish" => Some(Language::Spanish),
            "italian" => Some(Language::Italian),
            "portuguese" => Some(Language::Portuguese),
            "dutch" => Some(Language::Dutch),
            "russian" => Some(Language::Russian),
            "chinese" => Some(Language::Chinese),
            _ => None,
        }
    }

    /// Whether query term expansion uses the suffix stemmer
    pub fn has_stemmer(&self) -> bool {
        matches!(self, Language::English)
    }
}

/// Reduce an English word to a crude stem by stripping common suffixes
pub fn stem(word: &str) -> &str {
    for suffix in ["ing", "ed", "es", "s"] {
        if let Some(base) = word.strip_suffix(suffix) {
            if base.len() >= 3 {
                return base;
            }
        }
    }
    word
}

const DEFAULT_STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is", "it",
    "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there", "these",
    "they", "this", "to", "was", "will", "with",
];

/// Words ignored when indexing and querying text
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StopWordList {
    words: FxHashSet<String>,
}

impl StopWordList {
    pub fn from_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            words: words.into_iter().map(|w| w.as_ref().to_lowercase()).collect(),
        }
    }

    pub fn default_list() -> Self {
        Self::from_words(DEFAULT_STOPWORDS.iter())
    }

    pub fn contains(&self, word: &str) -> bool {
        self.words.contains(word)
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

/// Index definition
#[derive(Debug, Clone)]
pub struct IndexSpec {
    pub name: String,
    pub kind: IndexKind,
    pub fields: Vec<FieldSpec>,
    pub stopwords: Arc<StopWordList>,
    /// Term offsets are kept, which highlighting needs
    pub store_offsets: bool,
    pub prefixes: Vec<String>,
    pub language: Language,
}

impl IndexSpec {
    pub fn new(name: &str, fields: Vec<FieldSpec>) -> Self {
        Self {
            name: name.to_string(),
            kind: IndexKind::Hash,
            fields,
            stopwords: Arc::new(StopWordList::default_list()),
            store_offsets: true,
            prefixes: vec![String::new()],
            language: Language::English,
        }
    }
}

/// Read-only view of the schema shared with key registries
#[derive(Debug, Clone, Default)]
pub struct SchemaCache {
    fields: Vec<FieldSpec>,
    by_name: FxHashMap<String, usize>,
}

impl SchemaCache {
    /// Build the cache, assigning one bit per TEXT field in declaration order
    pub fn new(mut fields: Vec<FieldSpec>) -> Self {
        let mut by_name = FxHashMap::default();
        let mut next_bit = 0u32;
        for (i, field) in fields.iter_mut().enumerate() {
            if field.path.is_empty() {
                field.path = field.name.clone();
            }
            if field.is_text() && next_bit < 64 {
                field.bit = 1 << next_bit;
                next_bit += 1;
            }
            by_name.insert(field.name.clone(), i);
            if field.path != field.name {
                by_name.entry(field.path.clone()).or_insert(i);
            }
        }
        Self { fields, by_name }
    }

    /// Look up a field by name or path
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.by_name.get(name).map(|&i| &self.fields[i])
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn text_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.is_text())
    }
}

/// Corpus statistics used by scorers
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IndexStats {
    pub num_docs: u64,
    pub num_terms: u64,
    pub total_doc_len: u64,
}

impl IndexStats {
    pub fn avg_doc_len(&self) -> f64 {
        if self.num_docs == 0 {
            0.0
        } else {
            self.total_doc_len as f64 / self.num_docs as f64
        }
    }
}
