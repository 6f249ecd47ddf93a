use super::lookup::KeyId;
use super::value::Value;
use crate::index::iterator::IndexResult;
use crate::index::types::DocId;

/// Document identity carried by rows that come from the index scan
#[derive(Debug, Clone, PartialEq)]
pub struct DocRef {
    pub id: DocId,
    pub key: String,
}

/// One row travelling through the chain.
///
/// Values are stored by [`KeyId`] of the registry the current stage works
/// against. Rows produced by a grouper carry no document.
#[derive(Debug, Clone, Default)]
pub struct Row {
    pub doc: Option<DocRef>,
    pub score: f64,
    /// Match data from the index scan, used by scorers and highlighters
    pub index_result: Option<IndexResult>,
    values: Vec<Option<Value>>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_doc(id: DocId, key: String, result: IndexResult) -> Self {
        Self {
            doc: Some(DocRef { id, key }),
            score: 0.0,
            index_result: Some(result),
            values: Vec::new(),
        }
    }

    pub fn get(&self, key: KeyId) -> Option<&Value> {
        self.values.get(key).and_then(|v| v.as_ref())
    }

    pub fn has(&self, key: KeyId) -> bool {
        self.get(key).is_some()
    }

    pub fn set(&mut self, key: KeyId, value: Value) {
        if key >= self.values.len() {
            self.values.resize(key + 1, None);
        }
        self.values[key] = Some(value);
    }

    pub fn take(&mut self, key: KeyId) -> Option<Value> {
        self.values.get_mut(key).and_then(|v| v.take())
    }

    /// Populated slots in key order
    pub fn iter(&self) -> impl Iterator<Item = (KeyId, &Value)> {
        self.values
            .iter()
            .enumerate()
            .filter_map(|(id, v)| v.as_ref().map(|v| (id, v)))
    }

    pub fn doc_id(&self) -> Option<DocId> {
        self.doc.as_ref().map(|d| d.id)
    }
}
