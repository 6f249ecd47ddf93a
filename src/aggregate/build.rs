//! Compiles a bound request's plan into a processor chain.

use super::args::ArgsCursor;
use super::plan::{ArrangeStep, GroupStep, LoadStep, MapFilterStep, Step};
use super::request::Request;
use crate::error::{QueryError, Result};
use crate::index::memory::MemoryIndex;
use crate::pipeline::grouper::Grouper;
use crate::pipeline::highlight::Highlighter;
use crate::pipeline::lookup::{KeyFlags, KeyId, Lookup, options};
use crate::pipeline::processor::{
    Chain, Counter, FilterStage, IndexIteratorStage, Loader, MaxScoreNormalizer, Pager, Projector,
    QueryState, ScorerStage,
};
use crate::pipeline::reducers::create_reducer;
use crate::pipeline::sorter::{SortBy, Sorter};
use crate::query::expr;
use crate::query::scorer::{BM25STD_NORM, ScoringArgs, get_scoring_function};
use std::sync::Arc;
use tracing::debug;

/// Rows returned when no LIMIT is given
pub const DEFAULT_LIMIT: u64 = 10;

/// Field the score is exposed under with ADDSCORES
pub const SCORE_KEY: &str = "__score";

/// Resolve `name` for reading, falling back to a document load when the
/// registry is schema-bound and the field is in the schema.
fn resolve_or_load(
    lookup: &mut Lookup,
    name: &str,
    load_flags: u32,
    loads: &mut Vec<(KeyId, String)>,
) -> Option<KeyId> {
    if let Some(id) = lookup.get_key_read(name) {
        return Some(id);
    }
    if !lookup.is_schema_field(name) {
        return None;
    }
    match lookup.get_key_load(name, name, load_flags) {
        Some(id) => {
            loads.push((id, name.to_string()));
            Some(id)
        }
        None => lookup.find(name),
    }
}

impl Request {
    /// Build the processor chain for the bound request
    pub fn build_pipeline(&mut self) -> Result<()> {
        let handle = self.bound_index()?;
        let index = handle.read();

        let mut chain = Chain::new(QueryState::new(
            self.opts.timeout_ms,
            self.config.timeout_policy,
        ));
        self.build_implicit(&index, &mut chain)?;

        for (i, step) in self.plan.steps().iter().enumerate() {
            match step {
                Step::Root { .. } => {}
                Step::Group(group) => self.push_group(i, group, &mut chain)?,
                Step::Arrange(arrange) => self.push_arrange(i, arrange, &mut chain)?,
                Step::Apply(map) => self.push_apply(i, map, &mut chain)?,
                Step::Filter(map) => self.push_filter(i, map, &mut chain)?,
                Step::Load(load) => self.push_load(i, load, &mut chain)?,
            }
        }

        if self.is_search() {
            if !self.plan.has_arrange() {
                self.push_arrange(self.plan.len(), &ArrangeStep::default(), &mut chain)?;
            }
            if !self.flags.no_content {
                self.push_output(&mut chain)?;
            }
        }
        drop(index);

        debug!(stages = ?chain.kinds(), "pipeline built");
        chain.state_mut().arm();
        self.chain = Some(chain);
        Ok(())
    }

    fn scorer_name(&self) -> &str {
        self.opts
            .scorer
            .as_deref()
            .unwrap_or(&self.config.default_scorer)
    }

    /// Index scan, then scoring when the request needs scores
    fn build_implicit(&self, index: &MemoryIndex, chain: &mut Chain) -> Result<()> {
        let root = self.plan.first_lookup();
        root.write().bind_schema(index.schema_cache());

        let ast = self
            .ast
            .as_ref()
            .ok_or_else(|| QueryError::inval("Request is not bound to an index"))?;
        let iter = index.iterator_for_query(&ast.root, &self.iter_opts)?;
        chain.push(Box::new(IndexIteratorStage::new(iter)));

        let named_scorer = self.opts.scorer.is_some();
        let explicit = self.flags.with_scores || self.flags.add_scores;
        let implicit = self.is_search()
            && !self.flags.no_rows
            && if self.flags.optimize {
                named_scorer
            } else {
                !self.plan.has_query_sortby()
            };
        if !explicit && !implicit {
            return Ok(());
        }

        let name = self.scorer_name();
        let scorer = get_scoring_function(name)
            .ok_or_else(|| QueryError::inval(format!("No such scorer {}", name)))?;
        let args = ScoringArgs::new(index.stats(), self.opts.tanh_factor);
        let score_key = if self.flags.add_scores {
            if index.field_spec_by_name(SCORE_KEY).is_some() {
                return Err(QueryError::index_exists(SCORE_KEY));
            }
            let key = root
                .write()
                .get_key_write(SCORE_KEY, KeyFlags::NONE)
                .ok_or_else(|| QueryError::dup_field(SCORE_KEY))?;
            Some(key)
        } else {
            None
        };
        chain.push(Box::new(ScorerStage::new(scorer, args, score_key)));

        if name.eq_ignore_ascii_case(BM25STD_NORM) {
            let norm_key = if self.flags.add_scores {
                root.write().get_key_write(SCORE_KEY, KeyFlags::OVERRIDE)
            } else {
                None
            };
            chain.push(Box::new(MaxScoreNormalizer::new(norm_key)));
        }
        Ok(())
    }

    fn push_group(&self, idx: usize, group: &GroupStep, chain: &mut Chain) -> Result<()> {
        let prev = self.plan.lookup_before(idx);
        // Only the schema-bound root registry can promote fields to loads
        let can_load = self.plan.is_root_lookup(&prev);
        let mut loads = Vec::new();

        let grouper = {
            let mut src = prev.write();
            let mut dst = group.lookup.write();
            let mut resolve = |name: &str| -> Result<KeyId> {
                let id = if can_load {
                    resolve_or_load(&mut src, name, self.load_flags, &mut loads)
                } else {
                    src.get_key_read(name)
                };
                id.ok_or_else(|| QueryError::no_prop(format!("No such property `{}`", name)))
            };

            let mut src_keys = Vec::with_capacity(group.properties.len());
            let mut dst_keys = Vec::with_capacity(group.properties.len());
            for prop in &group.properties {
                src_keys.push(resolve(prop)?);
                let out = dst
                    .get_key_write(prop, KeyFlags::NONE)
                    .ok_or_else(|| QueryError::dup_field(prop))?;
                dst_keys.push(out);
            }

            let mut grouper = Grouper::new(src_keys, dst_keys);
            for spec in &group.reducers {
                let reducer = create_reducer(&spec.name, &spec.args, &mut resolve)?;
                let out = dst
                    .get_key_write(&spec.alias, KeyFlags::NONE)
                    .ok_or_else(|| QueryError::dup_field(&spec.alias))?;
                grouper.add_reducer(reducer, out);
            }
            grouper
        };

        if !loads.is_empty() {
            chain.push(Box::new(Loader::new(loads)));
        }
        chain.push(Box::new(grouper));
        Ok(())
    }

    fn push_arrange(&self, idx: usize, arrange: &ArrangeStep, chain: &mut Chain) -> Result<()> {
        let max = if self.is_search() {
            self.config.max_search_results
        } else {
            self.config.max_aggregate_results
        };
        let mut cap = arrange.offset.saturating_add(arrange.limit);
        if cap == 0 {
            cap = DEFAULT_LIMIT;
        }
        let cap = cap.min(max);

        if self.flags.no_rows || cap == 0 {
            chain.push(Box::new(Counter::new()));
            return Ok(());
        }
        let cap = usize::try_from(cap).unwrap_or(usize::MAX);

        let mut has_sorter = false;
        if let Some(names) = &arrange.sort_keys {
            let lookup = self.plan.lookup_before(idx);
            let mut loads = Vec::new();
            let mut keys = Vec::with_capacity(names.len());
            {
                let mut lookup = lookup.write();
                for name in names {
                    let id = resolve_or_load(&mut lookup, name, self.load_flags, &mut loads)
                        .ok_or_else(|| {
                            QueryError::no_prop(format!(
                                "Property `{}` not loaded nor in schema",
                                name
                            ))
                        })?;
                    keys.push(id);
                }
            }
            if !loads.is_empty() {
                chain.push(Box::new(Loader::new(loads)));
            }
            chain.push(Box::new(Sorter::new(
                SortBy::Keys {
                    keys,
                    asc_map: arrange.sort_asc_map,
                },
                cap,
            )));
            has_sorter = true;
        } else if self.is_search() && (!self.flags.optimize || self.opts.scorer.is_some()) {
            chain.push(Box::new(Sorter::by_score(cap)));
            has_sorter = true;
        }

        if arrange.offset > 0 || (arrange.limit > 0 && !has_sorter) {
            chain.push(Box::new(Pager::new(arrange.offset, arrange.limit)));
        } else if self.is_search() && self.flags.optimize && !has_sorter {
            chain.push(Box::new(Pager::new(0, cap as u64)));
        }
        Ok(())
    }

    fn push_apply(&self, idx: usize, map: &MapFilterStep, chain: &mut Chain) -> Result<()> {
        let lookup = self.plan.lookup_before(idx);
        let mut expr = expr::parse(&map.expr)?;
        let alias = map.alias.as_deref().unwrap_or(&map.expr);
        let dst = {
            let mut lookup = lookup.write();
            expr.collect_keys(&mut lookup)?;
            let flags = if map.no_override {
                KeyFlags::NONE
            } else {
                KeyFlags::OVERRIDE
            };
            lookup
                .get_key_write(alias, flags)
                .ok_or_else(|| QueryError::dup_field(alias))?
        };
        chain.push(Box::new(Projector::new(expr, dst)));
        Ok(())
    }

    fn push_filter(&self, idx: usize, map: &MapFilterStep, chain: &mut Chain) -> Result<()> {
        let lookup = self.plan.lookup_before(idx);
        let mut expr = expr::parse(&map.expr)?;
        expr.collect_keys(&mut lookup.write())?;
        chain.push(Box::new(FilterStage::new(expr)));
        Ok(())
    }

    fn push_load(&self, idx: usize, load: &LoadStep, chain: &mut Chain) -> Result<()> {
        let lookup = self.plan.lookup_before(idx);
        if !self.plan.is_root_lookup(&lookup) {
            return Err(QueryError::inval(
                "LOAD cannot be applied after projectors or reducers",
            ));
        }

        let mut keys = Vec::new();
        {
            let mut lk = lookup.write();
            let mut ac = ArgsCursor::new(&load.args);
            while let Ok(raw) = ac.get_str() {
                let path = raw.strip_prefix('@').unwrap_or(raw);
                let mut name = path;
                if ac.advance_if_match("AS") {
                    name = ac.get_str().map_err(|e| {
                        QueryError::parse_args(format!("Bad arguments for LOAD: {}", e))
                    })?;
                    if name.eq_ignore_ascii_case("AS") {
                        return Err(QueryError::parse_args("Alias for LOAD cannot be `AS`"));
                    }
                }
                let flags = self.load_flags | KeyFlags::EXPLICIT_RETURN;
                if let Some(id) = lk.get_key_load(name, path, flags) {
                    keys.push((id, path.to_string()));
                }
            }
            // JSON load-all only yields the root document, not its fields
            if load.load_all && !self.is_json {
                lk.set_option(options::ALL_LOADED);
            }
        }

        if !keys.is_empty() {
            chain.push(Box::new(Loader::new(keys)));
        }
        if load.load_all {
            chain.push(Box::new(Loader::load_all(Arc::clone(&lookup))));
        }
        Ok(())
    }

    /// Search replies: document fields and highlighting
    fn push_output(&self, chain: &mut Chain) -> Result<()> {
        let lookup = self.plan.last_lookup();
        let mut lk = lookup.write();

        if self.flags.explicit_return {
            let mut keys = Vec::new();
            let flags = self.load_flags | KeyFlags::EXPLICIT_RETURN;
            for field in &self.opts.returned {
                if let Some(id) = lk.get_key_load(&field.name, &field.path, flags) {
                    keys.push((id, field.path.clone()));
                }
            }
            if !keys.is_empty() {
                chain.push(Box::new(Loader::new(keys)));
            }
        } else {
            if !self.is_json {
                lk.set_option(options::ALL_LOADED);
            }
            chain.push(Box::new(Loader::load_all(Arc::clone(&lookup))));
        }

        let highlight = &self.opts.highlight;
        if highlight.is_empty() {
            return Ok(());
        }
        let mut names: Vec<String> = Vec::new();
        for name in highlight.named_fields() {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        if names.is_empty() {
            if let Some(schema) = lk.schema() {
                names = schema.text_fields().map(|f| f.name.clone()).collect();
            }
        }

        let mut fields = Vec::with_capacity(names.len());
        for name in &names {
            let id = lk
                .get_key_read(name)
                .ok_or_else(|| QueryError::no_prop(format!("No such property `{}`", name)))?;
            if !lk.key(id).flags.is_schema_backed() {
                return Err(QueryError::inval(format!(
                    "Property `{}` is not in schema",
                    name
                )));
            }
            let settings = highlight.settings_for(name);
            if !settings.is_noop() {
                fields.push((id, settings));
            }
        }
        let terms = self
            .ast
            .as_ref()
            .map(|ast| ast.terms.clone())
            .unwrap_or_default();
        chain.push(Box::new(Highlighter::new(terms, fields)));
        Ok(())
    }
}
