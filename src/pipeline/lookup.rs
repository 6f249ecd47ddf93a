//! Key registry ("lookup"): maps field names to row slots for one segment of
//! the pipeline.
//!
//! A registry is append-only. Keys are addressed by [`KeyId`], which doubles as
//! the slot index inside a [`Row`](super::row::Row). The root registry is bound
//! to the index schema so that unresolved names can be promoted to loads; the
//! registry owned by a GROUP step starts empty and unbound.

use crate::index::types::SchemaCache;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Stable handle of a key inside its registry
pub type KeyId = usize;

/// Shared handle to a registry.
///
/// Plan steps and processors hold the same registry; load-all loaders add
/// dynamic keys while the chain runs.
pub type LookupRef = Arc<RwLock<Lookup>>;

/// Key flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyFlags(pub u32);

impl KeyFlags {
    pub const NONE: u32 = 0;
    /// Backed by a schema field
    pub const SCHEMA_SRC: u32 = 1 << 0;
    /// Named by RETURN
    pub const EXPLICIT_RETURN: u32 = 1 << 1;
    /// Not part of the output
    pub const HIDDEN: u32 = 1 << 2;
    /// Load even if a value is already present
    pub const FORCE_LOAD: u32 = 1 << 3;
    /// A loader was scheduled for this key
    pub const IS_LOADED: u32 = 1 << 4;
    /// Value is produced by an earlier stage
    pub const VAL_AVAILABLE: u32 = 1 << 5;
    /// Value comes from the stored document
    pub const DOC_SRC: u32 = 1 << 6;
    /// Writing over an existing key is allowed
    pub const OVERRIDE: u32 = 1 << 7;

    pub fn new(bits: u32) -> Self {
        Self(bits)
    }

    pub fn contains(&self, bits: u32) -> bool {
        self.0 & bits == bits
    }

    pub fn intersects(&self, bits: u32) -> bool {
        self.0 & bits != 0
    }

    pub fn insert(&mut self, bits: u32) {
        self.0 |= bits;
    }

    pub fn remove(&mut self, bits: u32) {
        self.0 &= !bits;
    }

    pub fn is_hidden(&self) -> bool {
        self.intersects(Self::HIDDEN)
    }

    pub fn is_schema_backed(&self) -> bool {
        self.intersects(Self::SCHEMA_SRC)
    }
}

/// A named slot in the registry
#[derive(Debug, Clone)]
pub struct LookupKey {
    /// Output name
    pub name: String,
    /// Storage path the value is loaded from (differs from `name` with `AS`)
    pub path: String,
    pub flags: KeyFlags,
}

/// Registry-wide options
pub mod options {
    /// Every document field is loaded by an earlier load-all
    pub const ALL_LOADED: u32 = 1 << 0;
}

/// Per-segment key registry
#[derive(Debug, Default)]
pub struct Lookup {
    keys: Vec<LookupKey>,
    by_name: FxHashMap<String, KeyId>,
    schema: Option<Arc<SchemaCache>>,
    options: u32,
}

impl Lookup {
    /// Create an unbound registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry already wrapped for sharing
    pub fn new_shared() -> LookupRef {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Bind the registry to the index schema
    pub fn bind_schema(&mut self, schema: Arc<SchemaCache>) {
        self.schema = Some(schema);
    }

    pub fn schema(&self) -> Option<&Arc<SchemaCache>> {
        self.schema.as_ref()
    }

    pub fn is_schema_field(&self, path: &str) -> bool {
        self.schema
            .as_ref()
            .is_some_and(|s| s.field(path).is_some())
    }

    pub fn set_option(&mut self, opt: u32) {
        self.options |= opt;
    }

    pub fn clear_option(&mut self, opt: u32) {
        self.options &= !opt;
    }

    pub fn has_option(&self, opt: u32) -> bool {
        self.options & opt != 0
    }

    /// Find a key by name without creating anything
    pub fn find(&self, name: &str) -> Option<KeyId> {
        self.by_name.get(name).copied()
    }

    /// Resolve a key whose value some earlier stage provides.
    ///
    /// Returns `None` when nothing produces the value yet. Schema fields are
    /// not created here; they have to go through [`Lookup::get_key_load`].
    /// After a load-all every name resolves, since any document field may be
    /// present in the row.
    pub fn get_key_read(&mut self, name: &str) -> Option<KeyId> {
        if let Some(id) = self.find(name) {
            return Some(id);
        }
        if self.has_option(options::ALL_LOADED) {
            let mut flags = KeyFlags::DOC_SRC | KeyFlags::VAL_AVAILABLE;
            if self.is_schema_field(name) {
                flags |= KeyFlags::SCHEMA_SRC;
            }
            return Some(self.push(name, name, KeyFlags(flags)));
        }
        None
    }

    /// Declare a key the current stage writes.
    ///
    /// With `OVERRIDE`, an existing key is reused and becomes a computed key.
    /// Without it an existing name is a duplicate and yields `None`.
    pub fn get_key_write(&mut self, name: &str, flags: u32) -> Option<KeyId> {
        let flags = KeyFlags(flags);
        if let Some(id) = self.find(name) {
            if !flags.intersects(KeyFlags::OVERRIDE) {
                return None;
            }
            let key = &mut self.keys[id];
            key.flags.remove(KeyFlags::DOC_SRC | KeyFlags::SCHEMA_SRC | KeyFlags::IS_LOADED);
            key.flags.insert(KeyFlags::VAL_AVAILABLE | (flags.0 & KeyFlags::HIDDEN));
            return Some(id);
        }
        let mut stored = flags;
        stored.remove(KeyFlags::OVERRIDE);
        stored.insert(KeyFlags::VAL_AVAILABLE);
        Some(self.push(name, name, stored))
    }

    /// Declare a key whose value is loaded from the document at `path`.
    ///
    /// Returns `None` when the value is already produced or already scheduled
    /// for loading, unless `FORCE_LOAD` is given.
    pub fn get_key_load(&mut self, name: &str, path: &str, flags: u32) -> Option<KeyId> {
        let flags = KeyFlags(flags);
        let schema_backed = self.is_schema_field(path);

        if let Some(id) = self.find(name) {
            let key = &mut self.keys[id];
            let already = key
                .flags
                .intersects(KeyFlags::IS_LOADED | KeyFlags::VAL_AVAILABLE);
            if already && !flags.intersects(KeyFlags::FORCE_LOAD) {
                // Still record RETURN visibility on the existing key
                key.flags.insert(flags.0 & KeyFlags::EXPLICIT_RETURN);
                return None;
            }
            key.path = path.to_string();
            key.flags.insert(flags.0 | KeyFlags::DOC_SRC | KeyFlags::IS_LOADED);
            if schema_backed {
                key.flags.insert(KeyFlags::SCHEMA_SRC);
            }
            return Some(id);
        }

        let mut stored = KeyFlags(flags.0 | KeyFlags::DOC_SRC | KeyFlags::IS_LOADED);
        if schema_backed {
            stored.insert(KeyFlags::SCHEMA_SRC);
        }
        Some(self.push(name, path, stored))
    }

    /// Find or create a key for a field discovered at runtime by a load-all
    pub fn get_or_create_dynamic(&mut self, name: &str) -> KeyId {
        if let Some(id) = self.find(name) {
            return id;
        }
        let mut flags = KeyFlags(KeyFlags::DOC_SRC | KeyFlags::VAL_AVAILABLE);
        if self.is_schema_field(name) {
            flags.insert(KeyFlags::SCHEMA_SRC);
        }
        self.push(name, name, flags)
    }

    fn push(&mut self, name: &str, path: &str, flags: KeyFlags) -> KeyId {
        let id = self.keys.len();
        self.keys.push(LookupKey {
            name: name.to_string(),
            path: path.to_string(),
            flags,
        });
        self.by_name.insert(name.to_string(), id);
        id
    }

    pub fn key(&self, id: KeyId) -> &LookupKey {
        &self.keys[id]
    }

    pub fn key_mut(&mut self, id: KeyId) -> &mut LookupKey {
        &mut self.keys[id]
    }

    pub fn keys(&self) -> impl Iterator<Item = (KeyId, &LookupKey)> {
        self.keys.iter().enumerate()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Keys that belong in the output, in creation order
    pub fn visible_keys(&self) -> Vec<KeyId> {
        self.keys
            .iter()
            .enumerate()
            .filter(|(_, k)| !k.flags.is_hidden())
            .map(|(id, _)| id)
            .collect()
    }

    /// Keys explicitly named by RETURN, in creation order
    pub fn explicit_return_keys(&self) -> Vec<KeyId> {
        self.keys
            .iter()
            .enumerate()
            .filter(|(_, k)| k.flags.intersects(KeyFlags::EXPLICIT_RETURN))
            .map(|(id, _)| id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::types::{FieldSpec, FieldType, SchemaCache};

    fn schema() -> Arc<SchemaCache> {
        Arc::new(SchemaCache::new(vec![
            FieldSpec::new("title", FieldType::Text),
            FieldSpec::new("price", FieldType::Numeric),
        ]))
    }

    #[test]
    fn test_read_does_not_create_schema_keys() {
        let mut lk = Lookup::new();
        lk.bind_schema(schema());
        assert_eq!(lk.get_key_read("title"), None);
        assert!(lk.is_empty());
    }

    #[test]
    fn test_same_name_same_key() {
        let mut lk = Lookup::new();
        lk.bind_schema(schema());
        let a = lk.get_key_load("price", "price", KeyFlags::NONE).unwrap();
        assert!(lk.key(a).flags.is_schema_backed());
        assert_eq!(lk.get_key_read("price"), Some(a));
        assert_eq!(lk.find("price"), Some(a));
    }

    #[test]
    fn test_load_twice_is_noop() {
        let mut lk = Lookup::new();
        assert!(lk.get_key_load("x", "x", KeyFlags::NONE).is_some());
        assert!(lk.get_key_load("x", "x", KeyFlags::NONE).is_none());
        assert!(lk.get_key_load("x", "x", KeyFlags::FORCE_LOAD).is_some());
    }

    #[test]
    fn test_write_duplicate_and_override() {
        let mut lk = Lookup::new();
        let a = lk.get_key_write("n", KeyFlags::NONE).unwrap();
        assert!(lk.get_key_write("n", KeyFlags::NONE).is_none());
        assert_eq!(lk.get_key_write("n", KeyFlags::OVERRIDE), Some(a));
    }

    #[test]
    fn test_load_over_computed_key_is_noop() {
        let mut lk = Lookup::new();
        lk.get_key_write("score", KeyFlags::NONE).unwrap();
        assert!(lk.get_key_load("score", "score", KeyFlags::NONE).is_none());
    }

    #[test]
    fn test_all_loaded_resolves_anything() {
        let mut lk = Lookup::new();
        lk.set_option(options::ALL_LOADED);
        let id = lk.get_key_read("whatever").unwrap();
        assert!(lk.key(id).flags.contains(KeyFlags::DOC_SRC));
    }

    #[test]
    fn test_hidden_keys_not_visible() {
        let mut lk = Lookup::new();
        lk.get_key_write("a", KeyFlags::NONE);
        lk.get_key_write("b", KeyFlags::HIDDEN);
        assert_eq!(lk.visible_keys(), vec![0]);
    }
}
