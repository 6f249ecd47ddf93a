//! Request compilation: argument parsing, binding to an index, execution.
//!
//! A [`Request`] moves through three phases. [`Request::compile`] turns the
//! argument vector into a [`Plan`] and a set of options, [`Request::apply_context`]
//! binds it to an index (parsing the query text and evaluating legacy
//! filters), and [`Request::build_pipeline`] compiles the plan into a chain of
//! result processors. Execution then pulls rows from the chain, either all at
//! once or a chunk per cursor read.

use super::args::{ArgError, ArgsCursor};
use super::plan::{GroupStep, LoadStep, MapFilterStep, Plan, ReducerSpec, Step};
use crate::error::{QueryError, QueryErrorCode, Result};
use crate::index::iterator::IteratorOptions;
use crate::index::types::{ALL_FIELDS, IndexKind, Language};
use crate::index::IndexHandle;
use crate::output::{ExecutionResult, OutputRow};
use crate::pipeline::highlight::{self, FieldList};
use crate::pipeline::lookup::KeyFlags;
use crate::pipeline::processor::{Chain, Pull};
use crate::pipeline::row::Row;
use crate::pipeline::sorter::MAX_SORT_KEYS;
use crate::query::filters::{self, FilterBinding, LegacyGeoFilter, LegacyNumericFilter};
use crate::query::parser::{ParseOptions, QueryAst, parse_query};
use crate::query::scorer::get_scoring_function;
use crate::utils::EngineConfig;
use roaring::RoaringBitmap;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::debug;

/// Highest supported query dialect
pub const MAX_DIALECT: u64 = 4;

const MAX_TANH_FACTOR: u64 = 10_000;

/// Which command the request came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Simple search: implicit scoring, sorting and document loading
    Search,
    /// Aggregation: only the verbs given produce stages
    Aggregate,
}

impl RequestKind {
    fn command(&self) -> &'static str {
        match self {
            RequestKind::Search => "FT.SEARCH",
            RequestKind::Aggregate => "FT.AGGREGATE",
        }
    }
}

/// How document values are rendered in replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueFormat {
    #[default]
    String,
    /// JSON documents are returned as structured values
    Expand,
}

#[derive(Debug, Clone, Default)]
pub struct RequestFlags {
    pub with_scores: bool,
    /// Expose the score as the `__score` field
    pub add_scores: bool,
    /// Reply without document fields (NOCONTENT, RETURN 0, LIMIT 0 0)
    pub no_content: bool,
    /// Count only (LIMIT 0 0)
    pub no_rows: bool,
    /// Skip exact counting and bound the scan by the requested page
    pub optimize: bool,
    optimize_given: bool,
    pub verbatim: bool,
    pub no_stopwords: bool,
    /// RETURN named the fields to send
    pub explicit_return: bool,
}

/// `RETURN path [AS name]` entry
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnedField {
    pub name: String,
    pub path: String,
}

/// WITHCURSOR settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CursorOptions {
    /// Rows per read
    pub chunk_size: usize,
    pub max_idle_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub language: Option<String>,
    pub scorer: Option<String>,
    pub in_fields: Vec<String>,
    pub in_keys: Vec<String>,
    pub returned: Vec<ReturnedField>,
    pub highlight: FieldList,
    pub numeric_filters: Vec<LegacyNumericFilter>,
    pub geo_filters: Vec<LegacyGeoFilter>,
    has_empty_filter: bool,
    pub params: FxHashMap<String, String>,
    pub required_fields: Vec<String>,
    pub index_prefixes: Option<Vec<String>>,
    pub dialect: u32,
    pub timeout_ms: u64,
    pub tanh_factor: u64,
    pub format: ValueFormat,
}

/// One search or aggregate request
pub struct Request {
    pub(crate) kind: RequestKind,
    pub(crate) config: EngineConfig,
    pub(crate) query: String,
    pub(crate) plan: Plan,
    pub(crate) opts: SearchOptions,
    pub(crate) flags: RequestFlags,
    pub(crate) cursor: Option<CursorOptions>,
    /// The caller can render structured values (needed by FORMAT EXPAND)
    pub(crate) structured_reply: bool,
    pub(crate) ast: Option<QueryAst>,
    pub(crate) iter_opts: IteratorOptions,
    pub(crate) is_json: bool,
    /// Extra flags for every load key (`FORCE_LOAD` on old-dialect JSON)
    pub(crate) load_flags: u32,
    pub(crate) index: Option<IndexHandle>,
    pub(crate) chain: Option<Chain>,
}

fn bad_args(clause: &str, e: impl std::fmt::Display) -> QueryError {
    QueryError::parse_args(format!("Bad arguments for {}: {}", clause, e))
}

fn var_args_strings(ac: &mut ArgsCursor<'_>, clause: &str) -> Result<Vec<String>> {
    let mut sub = ac.get_var_args().map_err(|e| bad_args(clause, e))?;
    Ok(sub.take_rest())
}

fn strip_at(s: &str) -> &str {
    s.strip_prefix('@').unwrap_or(s)
}

impl Request {
    pub fn new(kind: RequestKind, config: &EngineConfig) -> Self {
        let opts = SearchOptions {
            dialect: config.default_dialect,
            timeout_ms: config.query_timeout_ms,
            tanh_factor: config.bm25std_tanh_factor,
            ..SearchOptions::default()
        };
        Self {
            kind,
            config: config.clone(),
            query: String::new(),
            plan: Plan::new(),
            opts,
            flags: RequestFlags::default(),
            cursor: None,
            structured_reply: false,
            ast: None,
            iter_opts: IteratorOptions::default(),
            is_json: false,
            load_flags: KeyFlags::NONE,
            index: None,
            chain: None,
        }
    }

    /// Compile, bind and build in one go
    pub fn prepare(
        kind: RequestKind,
        args: &[String],
        index: IndexHandle,
        config: &EngineConfig,
    ) -> Result<Self> {
        let mut req = Self::new(kind, config);
        req.compile(args)?;
        req.apply_context(index)?;
        req.build_pipeline()?;
        Ok(req)
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn is_search(&self) -> bool {
        self.kind == RequestKind::Search
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn options(&self) -> &SearchOptions {
        &self.opts
    }

    pub fn flags(&self) -> &RequestFlags {
        &self.flags
    }

    pub fn cursor_options(&self) -> Option<CursorOptions> {
        self.cursor
    }

    pub fn is_cursor(&self) -> bool {
        self.cursor.is_some()
    }

    pub fn chain(&self) -> Option<&Chain> {
        self.chain.as_ref()
    }

    /// Declare that replies can carry structured values
    pub fn set_structured_reply(&mut self, structured: bool) {
        self.structured_reply = structured;
    }

    pub fn value_format(&self) -> ValueFormat {
        self.opts.format
    }

    /// Parse the argument vector: the query text followed by options and verbs
    pub fn compile(&mut self, args: &[String]) -> Result<()> {
        let mut ac = ArgsCursor::new(args);
        self.query = ac
            .get_string()
            .map_err(|_| QueryError::parse_args("No query string provided"))?;

        while let Some(arg) = ac.peek() {
            if self.handle_common_args(&mut ac)? || self.handle_query_args(&mut ac)? {
                continue;
            }
            if ac.advance_if_match("GROUPBY") {
                self.parse_groupby(&mut ac)?;
            } else if ac.advance_if_match("APPLY") {
                self.parse_apply_or_filter(&mut ac, true)?;
            } else if ac.advance_if_match("FILTER") {
                self.parse_apply_or_filter(&mut ac, false)?;
            } else if ac.advance_if_match("LOAD") {
                self.parse_load(&mut ac)?;
            } else {
                return Err(QueryError::unknown_arg(arg, ac.position(), "<main>"));
            }
        }

        self.finish_compile()
    }

    fn finish_compile(&mut self) -> Result<()> {
        if self.opts.dialect >= 2 && self.opts.has_empty_filter {
            return Err(QueryError::parse_args(
                "Numeric/Geo filter value/s cannot be empty",
            ));
        }
        if !self.flags.optimize_given && self.opts.dialect >= 4 {
            self.flags.optimize = true;
        }
        if self.is_search() && self.flags.add_scores {
            return Err(QueryError::parse_args("ADDSCORES is not supported on FT.SEARCH"));
        }
        debug!(
            kind = ?self.kind,
            steps = self.plan.len(),
            dialect = self.opts.dialect,
            "request compiled"
        );
        Ok(())
    }

    fn ensure_simple_mode(&self, option: &str) -> Result<()> {
        if self.kind == RequestKind::Aggregate {
            return Err(QueryError::parse_args(format!(
                "{} is not supported on {}",
                option,
                RequestKind::Aggregate.command()
            )));
        }
        Ok(())
    }

    fn ensure_extended_mode(&self, option: &str) -> Result<()> {
        if self.is_search() {
            return Err(QueryError::parse_args(format!(
                "option `{}` is mutually exclusive with simple (i.e. search) options",
                option
            )));
        }
        Ok(())
    }

    /// Options shared by both commands. Returns whether `ac` was advanced.
    fn handle_common_args(&mut self, ac: &mut ArgsCursor<'_>) -> Result<bool> {
        if ac.advance_if_match("LIMIT") {
            self.parse_limit(ac)?;
        } else if ac.advance_if_match("SORTBY") {
            self.parse_sortby(ac)?;
        } else if ac.advance_if_match("TIMEOUT") {
            self.opts.timeout_ms = ac.get_u64().map_err(|e| match e {
                ArgError::NoArg => QueryError::parse_args("Need argument for TIMEOUT"),
                _ => QueryError::parse_args("TIMEOUT requires a non negative integer"),
            })?;
        } else if ac.advance_if_match("WITHCURSOR") {
            self.parse_cursor_settings(ac)?;
        } else if ac.advance_if_match("PARAMS") {
            self.parse_params(ac)?;
        } else if ac.advance_if_match("_REQUIRED_FIELDS") {
            self.opts.required_fields = var_args_strings(ac, "_REQUIRED_FIELDS")?;
        } else if ac.advance_if_match("_INDEX_PREFIXES") {
            self.opts.index_prefixes = Some(var_args_strings(ac, "_INDEX_PREFIXES")?);
        } else if ac.advance_if_match("BM25STD_TANH_FACTOR") {
            self.opts.tanh_factor = ac.get_u64_in(1, MAX_TANH_FACTOR).map_err(|e| match e {
                ArgError::NoArg => {
                    QueryError::parse_args("Need an argument for BM25STD_TANH_FACTOR")
                }
                _ => QueryError::parse_args(format!(
                    "BM25STD_TANH_FACTOR must be between 1 and {} inclusive",
                    MAX_TANH_FACTOR
                )),
            })?;
        } else if ac.advance_if_match("DIALECT") {
            let dialect = ac.get_u64_in(1, MAX_DIALECT).map_err(|e| match e {
                ArgError::NoArg => QueryError::parse_args("Need an argument for DIALECT"),
                _ => QueryError::parse_args(format!(
                    "DIALECT requires a non negative integer >=1 and <= {}",
                    MAX_DIALECT
                )),
            })?;
            self.opts.dialect = dialect as u32;
        } else if ac.advance_if_match("FORMAT") {
            let format = ac
                .get_str()
                .map_err(|_| QueryError::parse_args("Need an argument for FORMAT"))?;
            self.opts.format = if format.eq_ignore_ascii_case("STRING") {
                ValueFormat::String
            } else if format.eq_ignore_ascii_case("EXPAND") {
                ValueFormat::Expand
            } else {
                return Err(QueryError::parse_args(format!("FORMAT {} is not supported", format)));
            };
        } else {
            return Ok(false);
        }
        Ok(true)
    }

    fn parse_limit(&mut self, ac: &mut ArgsCursor<'_>) -> Result<()> {
        let max_search = self.config.max_search_results;
        let max_results = if self.is_search() {
            max_search
        } else {
            self.config.max_aggregate_results
        };

        let arrange = self.plan.get_or_create_arrange();
        arrange.is_limited = true;
        if ac.remaining() < 2 {
            return Err(QueryError::parse_args("LIMIT requires two arguments"));
        }
        let (offset, limit) = match (ac.get_u64(), ac.get_u64()) {
            (Ok(offset), Ok(limit)) => (offset, limit),
            _ => return Err(QueryError::parse_args("LIMIT needs two numeric arguments")),
        };
        arrange.offset = offset;
        arrange.limit = limit;

        if limit == 0 && offset != 0 {
            return Err(QueryError::limit(
                "The `offset` of the LIMIT must be 0 when `num` is 0",
            ));
        }
        if limit == 0 {
            self.flags.no_rows = true;
            self.flags.no_content = true;
        } else if limit > max_results {
            return Err(QueryError::limit(format!(
                "LIMIT exceeds maximum of {}",
                max_results
            )));
        } else if offset > max_search {
            return Err(QueryError::limit(format!(
                "OFFSET exceeds maximum of {}",
                max_search
            )));
        }
        Ok(())
    }

    fn parse_sortby(&mut self, ac: &mut ArgsCursor<'_>) -> Result<()> {
        let is_search = self.is_search();
        let arrange = self.plan.get_or_create_arrange();
        if arrange.sort_keys.is_some() {
            let msg = if is_search {
                "Multiple SORTBY steps are not allowed"
            } else {
                "Multiple SORTBY steps are not allowed. Sort multiple fields in a single step"
            };
            return Err(QueryError::parse_args(msg));
        }

        let mut keys: Vec<String> = Vec::new();
        let mut asc_map = u64::MAX;
        if is_search {
            // Search form: one field and an optional direction
            let field = ac
                .get_str()
                .map_err(|_| QueryError::parse_args("Bad SORTBY arguments"))?;
            keys.push(strip_at(field).to_string());
            if ac.advance_if_match("DESC") {
                asc_map &= !1;
            } else {
                ac.advance_if_match("ASC");
            }
        } else {
            let mut sub = ac.get_var_args().map_err(|e| bad_args("SORTBY", e))?;
            while let Ok(token) = sub.get_str() {
                if let Some(name) = token.strip_prefix('@') {
                    if keys.len() >= MAX_SORT_KEYS {
                        return Err(QueryError::limit(format!(
                            "Cannot sort by more than {} fields",
                            MAX_SORT_KEYS
                        )));
                    }
                    keys.push(name.to_string());
                    continue;
                }
                let ascending = if token.eq_ignore_ascii_case("ASC") {
                    true
                } else if token.eq_ignore_ascii_case("DESC") {
                    false
                } else {
                    return Err(QueryError::parse_args("MISSING ASC or DESC after sort field"));
                };
                let Some(last) = keys.len().checked_sub(1) else {
                    return Err(bad_args("SORTBY", format!("`{}` must follow a sort field", token)));
                };
                if ascending {
                    asc_map |= 1 << last;
                } else {
                    asc_map &= !(1 << last);
                }
            }
        }

        if ac.advance_if_match("MAX") {
            if is_search {
                return Err(QueryError::parse_args("SORTBY MAX is not supported by FT.SEARCH"));
            }
            arrange.limit = ac.get_u64().map_err(|e| bad_args("MAX", e))?;
        }
        arrange.sort_keys = Some(keys);
        arrange.sort_asc_map = asc_map;
        Ok(())
    }

    fn parse_cursor_settings(&mut self, ac: &mut ArgsCursor<'_>) -> Result<()> {
        let mut cursor = CursorOptions {
            chunk_size: self.config.cursor_read_size,
            max_idle_ms: self.config.cursor_max_idle_ms,
        };
        loop {
            if ac.advance_if_match("MAXIDLE") {
                let idle = ac
                    .get_u64_in(1, u64::MAX)
                    .map_err(|e| bad_args("MAXIDLE", e))?;
                cursor.max_idle_ms = idle.min(self.config.cursor_max_idle_ms);
            } else if ac.advance_if_match("COUNT") {
                let count = ac
                    .get_u64_in(1, u64::MAX)
                    .map_err(|e| bad_args("COUNT", e))?;
                cursor.chunk_size = usize::try_from(count).unwrap_or(usize::MAX);
            } else {
                break;
            }
        }
        self.cursor = Some(cursor);
        Ok(())
    }

    fn parse_params(&mut self, ac: &mut ArgsCursor<'_>) -> Result<()> {
        let mut sub = ac.get_var_args().map_err(|e| bad_args("PARAMS", e))?;
        if sub.remaining() == 0 || sub.remaining() % 2 != 0 {
            return Err(QueryError::parse_args(
                "Parameters must be specified in PARAM VALUE pairs",
            ));
        }
        while let (Ok(name), Ok(value)) = (sub.get_string(), sub.get_string()) {
            if self.opts.params.contains_key(&name) {
                return Err(QueryError::parse_args(format!("Duplicate parameter `{}`", name)));
            }
            self.opts.params.insert(name, value);
        }
        Ok(())
    }

    /// Search options. Returns whether `ac` was advanced.
    fn handle_query_args(&mut self, ac: &mut ArgsCursor<'_>) -> Result<bool> {
        if ac.advance_if_match("INFIELDS") {
            self.opts.in_fields = var_args_strings(ac, "INFIELDS")?
                .iter()
                .map(|f| strip_at(f).to_string())
                .collect();
        } else if ac.advance_if_match("INKEYS") {
            self.opts.in_keys = var_args_strings(ac, "INKEYS")?;
        } else if ac.advance_if_match("LANGUAGE") {
            self.opts.language = Some(ac.get_string().map_err(|e| bad_args("LANGUAGE", e))?);
        } else if ac.advance_if_match("SCORER") {
            self.opts.scorer = Some(ac.get_string().map_err(|e| bad_args("SCORER", e))?);
        } else if ac.advance_if_match("RETURN") {
            self.ensure_simple_mode("RETURN")?;
            self.parse_return(ac)?;
        } else if ac.advance_if_match("VERBATIM") {
            self.flags.verbatim = true;
        } else if ac.advance_if_match("WITHSCORES") {
            self.flags.with_scores = true;
        } else if ac.advance_if_match("ADDSCORES") {
            self.flags.add_scores = true;
        } else if ac.advance_if_match("NOCONTENT") {
            self.flags.no_content = true;
        } else if ac.advance_if_match("NOSTOPWORDS") {
            self.flags.no_stopwords = true;
        } else if ac.advance_if_match("WITHCOUNT") {
            self.flags.optimize = false;
            self.flags.optimize_given = true;
        } else if ac.advance_if_match("WITHOUTCOUNT") {
            self.flags.optimize = true;
            self.flags.optimize_given = true;
        } else if ac.advance_if_match("HIGHLIGHT") {
            self.ensure_simple_mode("HIGHLIGHT")?;
            highlight::parse_highlight(ac, &mut self.opts.highlight)?;
        } else if ac.advance_if_match("SUMMARIZE") {
            self.ensure_simple_mode("SUMMARIZE")?;
            highlight::parse_summarize(ac, &mut self.opts.highlight)?;
        } else if self.is_search() && ac.advance_if_match("FILTER") {
            let filter = filters::parse_numeric_filter(ac, &mut self.opts.has_empty_filter)?;
            self.opts.numeric_filters.push(filter);
        } else if self.is_search() && ac.advance_if_match("GEOFILTER") {
            let filter = filters::parse_geo_filter(ac, &mut self.opts.has_empty_filter)?;
            self.opts.geo_filters.push(filter);
        } else {
            return Ok(false);
        }
        Ok(true)
    }

    fn parse_return(&mut self, ac: &mut ArgsCursor<'_>) -> Result<()> {
        let mut sub = ac.get_var_args().map_err(|e| bad_args("RETURN", e))?;
        if sub.is_at_end() {
            self.flags.no_content = true;
            return Ok(());
        }
        self.flags.explicit_return = true;
        while let Ok(path) = sub.get_str() {
            let mut name = path;
            if sub.advance_if_match("AS") {
                name = sub.get_str().map_err(|_| {
                    QueryError::parse_args("RETURN path AS name - must be accompanied with NAME")
                })?;
                if name.eq_ignore_ascii_case("AS") {
                    return Err(QueryError::parse_args("Alias for RETURN cannot be `AS`"));
                }
            }
            self.opts.returned.push(ReturnedField {
                name: strip_at(name).to_string(),
                path: strip_at(path).to_string(),
            });
        }
        Ok(())
    }

    fn parse_groupby(&mut self, ac: &mut ArgsCursor<'_>) -> Result<()> {
        self.ensure_extended_mode("GROUPBY")?;
        let mut props = ac.get_var_args().map_err(|e| bad_args("GROUPBY", e))?;
        let mut properties = Vec::with_capacity(props.remaining());
        while let Ok(prop) = props.get_str() {
            let Some(name) = prop.strip_prefix('@') else {
                return Err(bad_args(
                    "GROUPBY",
                    format!("Unknown property `{}`. Did you mean `@{}`?", prop, prop),
                ));
            };
            properties.push(name.to_string());
        }

        let mut group = GroupStep::new(properties);
        while ac.advance_if_match("REDUCE") {
            let name = ac.get_str().map_err(|e| bad_args("REDUCE", e))?;
            let args = var_args_strings(ac, name)?;
            let alias = if ac.advance_if_match("AS") {
                Some(ac.get_string().map_err(|e| bad_args("AS", e))?)
            } else {
                None
            };
            group.reducers.push(ReducerSpec::new(name, args, alias));
        }
        self.plan.push(Step::Group(group));
        Ok(())
    }

    fn parse_apply_or_filter(&mut self, ac: &mut ArgsCursor<'_>, is_apply: bool) -> Result<()> {
        let clause = if is_apply { "APPLY" } else { "FILTER" };
        let expr = ac.get_str().map_err(|e| bad_args(clause, e))?;
        if !is_apply {
            self.plan.push(Step::Filter(MapFilterStep::filter(expr)));
            return Ok(());
        }
        let alias = if ac.advance_if_match("AS") {
            ac.get_str()
                .map_err(|_| QueryError::parse_args("AS needs argument"))?
        } else {
            expr
        };
        self.plan.push(Step::Apply(MapFilterStep::apply(expr, alias)));
        Ok(())
    }

    fn parse_load(&mut self, ac: &mut ArgsCursor<'_>) -> Result<()> {
        if self.plan.has_projection() {
            return Err(QueryError::inval(
                "LOAD cannot be applied after projectors or reducers",
            ));
        }
        let step = match ac.get_var_args() {
            Ok(mut sub) => LoadStep {
                args: sub.take_rest(),
                load_all: false,
            },
            Err(_) if ac.peek() == Some("*") => {
                ac.advance();
                LoadStep {
                    args: Vec::new(),
                    load_all: true,
                }
            }
            Err(_) => {
                return Err(bad_args("LOAD", "Expected number of fields or `*`"));
            }
        };
        self.plan.push(Step::Load(step));
        Ok(())
    }

    /// Bind the compiled request to `index`: validate options against the
    /// schema, parse the query text and evaluate legacy filters.
    pub fn apply_context(&mut self, index: IndexHandle) -> Result<()> {
        {
            let idx = index.read();
            let spec = idx.spec();

            if let Some(prefixes) = &self.opts.index_prefixes {
                if prefixes != &spec.prefixes {
                    return Err(QueryError::new(
                        QueryErrorCode::Mismatch,
                        format!("Index mismatch: prefixes of `{}` differ from the request", spec.name),
                    ));
                }
            }
            self.is_json = spec.kind == IndexKind::Json;

            if !self.opts.highlight.is_empty() {
                if self.is_json {
                    return Err(QueryError::inval(
                        "HIGHLIGHT/SUMMARIZE is not supported with JSON indexes",
                    ));
                }
                if !spec.store_offsets {
                    return Err(QueryError::inval(
                        "Cannot use HIGHLIGHT/SUMMARIZE because NOOFSETS was specified at index level",
                    ));
                }
            }

            let field_mask = if self.opts.in_fields.is_empty() {
                ALL_FIELDS
            } else {
                self.opts
                    .in_fields
                    .iter()
                    .fold(0, |mask, f| mask | idx.field_bit_for_name(f))
            };

            let language = match &self.opts.language {
                Some(name) => {
                    Language::from_name(name).ok_or_else(|| QueryError::inval("No such language"))?
                }
                None => spec.language,
            };

            if let Some(name) = &self.opts.scorer {
                if get_scoring_function(name).is_none() {
                    return Err(QueryError::inval(format!("No such scorer {}", name)));
                }
            }

            if self.opts.format == ValueFormat::Expand {
                if !self.structured_reply {
                    return Err(QueryError::inval("EXPAND format is only supported with RESP3"));
                }
                if !self.is_json {
                    return Err(QueryError::inval("EXPAND format is only supported with JSON"));
                }
            }

            let parse_opts = ParseOptions {
                stopwords: (!self.flags.no_stopwords).then(|| Arc::clone(&spec.stopwords)),
                params: self.opts.params.clone(),
                dialect: self.opts.dialect,
            };
            let ast = parse_query(&self.query, &parse_opts)?;

            let mut filter = match filters::bind_filters(
                &idx,
                &self.opts.numeric_filters,
                &self.opts.geo_filters,
                self.opts.dialect,
            )? {
                FilterBinding::Docs(docs) => Some(docs),
                FilterBinding::Unfiltered => None,
                FilterBinding::Empty => Some(RoaringBitmap::new()),
            };
            if !self.opts.in_keys.is_empty() {
                let docs = idx.docs_for_keys(self.opts.in_keys.as_slice());
                filter = Some(match filter {
                    Some(f) => f & docs,
                    None => docs,
                });
            }

            self.iter_opts = IteratorOptions {
                field_mask,
                expand: !self.flags.verbatim && language.has_stemmer(),
                filter,
            };
            if self.is_json && self.opts.dialect < 3 {
                self.load_flags = KeyFlags::FORCE_LOAD;
            }
            self.ast = Some(ast);
        }
        self.index = Some(index);
        Ok(())
    }

    pub(crate) fn bound_index(&self) -> Result<IndexHandle> {
        self.index
            .clone()
            .ok_or_else(|| QueryError::inval("Request is not bound to an index"))
    }

    fn chain_mut(&mut self) -> Result<&mut Chain> {
        self.chain
            .as_mut()
            .ok_or_else(|| QueryError::inval("Request pipeline has not been built"))
    }

    /// Run the request. Cursor requests return their first chunk.
    pub fn execute(&mut self) -> Result<ExecutionResult> {
        let max_rows = self.cursor.map(|c| c.chunk_size);
        self.read_chunk(max_rows)
    }

    /// Pull up to `max_rows` rows under one read lock of the index
    pub(crate) fn read_chunk(&mut self, max_rows: Option<usize>) -> Result<ExecutionResult> {
        let handle = self.bound_index()?;
        let index = handle.read();
        let chain = self.chain_mut()?;
        chain.state_mut().arm();

        let mut rows = Vec::new();
        let mut exhausted = false;
        while max_rows.is_none_or(|max| rows.len() < max) {
            match chain.pull(&index)? {
                Pull::Row(row) => rows.push(row),
                Pull::Eof => {
                    exhausted = true;
                    break;
                }
                Pull::TimedOut => break,
            }
        }
        let state = chain.state();
        let total_results = state.total_results;
        let timed_out = state.timed_out;
        drop(index);

        Ok(ExecutionResult {
            total_results,
            rows: self.output_rows(&rows),
            timed_out,
            // One-shot executions never resume
            exhausted: exhausted || self.cursor.is_none(),
            cursor_id: None,
        })
    }

    /// Pull a single row
    pub fn next_row(&mut self) -> Result<Option<OutputRow>> {
        let handle = self.bound_index()?;
        let index = handle.read();
        let pulled = self.chain_mut()?.pull(&index)?;
        drop(index);
        match pulled {
            Pull::Row(row) => Ok(self.output_rows(std::slice::from_ref(&row)).pop()),
            Pull::Eof | Pull::TimedOut => Ok(None),
        }
    }

    /// Names of the fields rows are rendered with
    pub fn output_keys(&self) -> Vec<String> {
        let lookup = self.plan.last_lookup();
        let lookup = lookup.read();
        if self.flags.no_content {
            return Vec::new();
        }
        if self.flags.explicit_return {
            return self.opts.returned.iter().map(|f| f.name.clone()).collect();
        }
        lookup
            .visible_keys()
            .into_iter()
            .map(|id| lookup.key(id).name.clone())
            .collect()
    }

    fn output_rows(&self, rows: &[Row]) -> Vec<OutputRow> {
        let lookup = self.plan.last_lookup();
        let lookup = lookup.read();
        let keys: Vec<(String, usize)> = if self.flags.no_content {
            Vec::new()
        } else if self.flags.explicit_return {
            self.opts
                .returned
                .iter()
                .filter_map(|f| lookup.find(&f.name).map(|id| (f.name.clone(), id)))
                .collect()
        } else {
            lookup
                .visible_keys()
                .into_iter()
                .map(|id| (lookup.key(id).name.clone(), id))
                .collect()
        };

        rows.iter()
            .map(|row| OutputRow {
                key: if self.is_search() {
                    row.doc.as_ref().map(|d| d.key.clone())
                } else {
                    None
                },
                score: self.flags.with_scores.then_some(row.score),
                fields: keys
                    .iter()
                    .filter_map(|(name, id)| row.get(*id).map(|v| (name.clone(), v.clone())))
                    .collect(),
            })
            .collect()
    }
}
