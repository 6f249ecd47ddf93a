//! Pull-based result processors and the chain that drives them.
//!
//! Stages live in a flat `Vec`; stage *i* pulls from stage *i - 1* through an
//! [`Upstream`] view over the stages before it. The chain owns the per-query
//! state (counters, timeout, error sink) and lends it to stages together with
//! the read-locked index for the duration of one pull.

use super::lookup::{KeyId, LookupRef};
use super::row::Row;
use super::value::Value;
use crate::error::{QueryError, Result};
use crate::index::iterator::DocIterator;
use crate::index::memory::MemoryIndex;
use crate::query::expr::Expr;
use crate::query::scorer::{ScoringArgs, ScoringFn};
use crate::utils::TimeoutPolicy;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Rows scanned between two timeout checks
const TIMEOUT_CHECK_INTERVAL: u32 = 100;

/// Result of one pull
#[derive(Debug)]
pub enum Pull {
    Row(Row),
    Eof,
    /// The time budget ran out; rows pulled so far are valid
    TimedOut,
}

/// Stage type, for introspection and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorKind {
    Index,
    Scorer,
    Normalizer,
    Counter,
    Sorter,
    Pager,
    Loader,
    Projector,
    Filter,
    Grouper,
    Highlighter,
}

/// Per-query iteration state shared by every stage
#[derive(Debug)]
pub struct QueryState {
    /// Documents produced by the index scan
    pub total_results: u64,
    pub timed_out: bool,
    timeout: Option<Duration>,
    policy: TimeoutPolicy,
    deadline: Option<Instant>,
    error: Option<QueryError>,
}

impl QueryState {
    /// `timeout_ms == 0` disables the time budget
    pub fn new(timeout_ms: u64, policy: TimeoutPolicy) -> Self {
        Self {
            total_results: 0,
            timed_out: false,
            timeout: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)),
            policy,
            deadline: None,
            error: None,
        }
    }

    /// Start the clock for one execution (or one cursor read)
    pub fn arm(&mut self) {
        self.deadline = self.timeout.map(|t| Instant::now() + t);
        self.timed_out = false;
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    #[cfg(test)]
    pub(crate) fn expire_now(&mut self) {
        self.deadline = Some(Instant::now());
    }

    /// Apply the timeout policy
    pub fn timeout_reached(&mut self) -> Result<Pull> {
        self.timed_out = true;
        match self.policy {
            TimeoutPolicy::Return => {
                debug!("query time budget exhausted, returning partial results");
                Ok(Pull::TimedOut)
            }
            TimeoutPolicy::Fail => Err(QueryError::timeout()),
        }
    }

    pub fn error(&self) -> Option<&QueryError> {
        self.error.as_ref()
    }
}

/// What a stage sees while pulling
pub struct ExecCtx<'a> {
    pub index: &'a MemoryIndex,
    pub state: &'a mut QueryState,
}

/// The stages upstream of the one currently running
pub struct Upstream<'a> {
    stages: &'a mut [Box<dyn ResultProcessor>],
}

impl Upstream<'_> {
    /// Pull the next row from the nearest upstream stage
    pub fn pull(&mut self, ctx: &mut ExecCtx<'_>) -> Result<Pull> {
        match self.stages.split_last_mut() {
            Some((last, rest)) => last.next(&mut Upstream { stages: rest }, ctx),
            None => Ok(Pull::Eof),
        }
    }
}

/// A pipeline stage
pub trait ResultProcessor: Send {
    fn kind(&self) -> ProcessorKind;

    fn next(&mut self, up: &mut Upstream<'_>, ctx: &mut ExecCtx<'_>) -> Result<Pull>;
}

/// Ordered chain of stages, pulled from the tail
pub struct Chain {
    stages: Vec<Box<dyn ResultProcessor>>,
    state: QueryState,
}

impl Chain {
    pub fn new(state: QueryState) -> Self {
        Self {
            stages: Vec::new(),
            state,
        }
    }

    /// Append a stage at the tail
    pub fn push(&mut self, stage: Box<dyn ResultProcessor>) {
        trace!(kind = ?stage.kind(), position = self.stages.len(), "appending processor");
        self.stages.push(stage);
    }

    pub fn kinds(&self) -> Vec<ProcessorKind> {
        self.stages.iter().map(|s| s.kind()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn state(&self) -> &QueryState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut QueryState {
        &mut self.state
    }

    /// Pull one row from the tail.
    ///
    /// A failure is recorded in the error sink and returned once; afterwards
    /// the chain only reports end-of-stream.
    pub fn pull(&mut self, index: &MemoryIndex) -> Result<Pull> {
        if self.state.error.is_some() {
            return Ok(Pull::Eof);
        }
        let mut ctx = ExecCtx {
            index,
            state: &mut self.state,
        };
        let mut up = Upstream {
            stages: &mut self.stages,
        };
        match up.pull(&mut ctx) {
            Err(err) => {
                warn!(error = %err, "pipeline aborted");
                self.state.error = Some(err.clone());
                Err(err)
            }
            ok => ok,
        }
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        // Release tail to root
        while let Some(stage) = self.stages.pop() {
            drop(stage);
        }
    }
}

/// Root stage: walks the index results
pub struct IndexIteratorStage {
    iter: Box<dyn DocIterator>,
    scanned: u32,
}

impl IndexIteratorStage {
    pub fn new(iter: Box<dyn DocIterator>) -> Self {
        Self { iter, scanned: 0 }
    }
}

impl ResultProcessor for IndexIteratorStage {
    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Index
    }

    fn next(&mut self, _up: &mut Upstream<'_>, ctx: &mut ExecCtx<'_>) -> Result<Pull> {
        loop {
            if self.scanned % TIMEOUT_CHECK_INTERVAL == 0 && ctx.state.is_expired() {
                return ctx.state.timeout_reached();
            }
            self.scanned = self.scanned.wrapping_add(1);

            let Some(result) = self.iter.next_result() else {
                return Ok(Pull::Eof);
            };
            // Documents deleted while a cursor was paused are skipped
            let Some(doc) = ctx.index.document(result.doc_id) else {
                continue;
            };
            ctx.state.total_results += 1;
            return Ok(Pull::Row(Row::from_doc(result.doc_id, doc.key.clone(), result)));
        }
    }
}

/// Computes the row score
pub struct ScorerStage {
    scorer: ScoringFn,
    args: ScoringArgs,
    score_key: Option<KeyId>,
}

impl ScorerStage {
    pub fn new(scorer: ScoringFn, args: ScoringArgs, score_key: Option<KeyId>) -> Self {
        Self {
            scorer,
            args,
            score_key,
        }
    }
}

impl ResultProcessor for ScorerStage {
    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Scorer
    }

    fn next(&mut self, up: &mut Upstream<'_>, ctx: &mut ExecCtx<'_>) -> Result<Pull> {
        let mut row = match up.pull(ctx)? {
            Pull::Row(row) => row,
            other => return Ok(other),
        };
        if let Some(result) = &row.index_result {
            row.score = (self.scorer)(&self.args, result);
        }
        if let Some(key) = self.score_key {
            row.set(key, Value::Number(row.score));
        }
        Ok(Pull::Row(row))
    }
}

/// Buffers all rows and divides each score by the maximum
pub struct MaxScoreNormalizer {
    buffer: VecDeque<Row>,
    filled: bool,
    score_key: Option<KeyId>,
}

impl MaxScoreNormalizer {
    pub fn new(score_key: Option<KeyId>) -> Self {
        Self {
            buffer: VecDeque::new(),
            filled: false,
            score_key,
        }
    }
}

impl ResultProcessor for MaxScoreNormalizer {
    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Normalizer
    }

    fn next(&mut self, up: &mut Upstream<'_>, ctx: &mut ExecCtx<'_>) -> Result<Pull> {
        if !self.filled {
            let mut max = 0.0f64;
            loop {
                match up.pull(ctx)? {
                    Pull::Row(row) => {
                        max = max.max(row.score);
                        self.buffer.push_back(row);
                    }
                    Pull::Eof | Pull::TimedOut => break,
                }
            }
            self.filled = true;
            for row in self.buffer.iter_mut() {
                if max > 0.0 {
                    row.score /= max;
                }
                if let Some(key) = self.score_key {
                    row.set(key, Value::Number(row.score));
                }
            }
        }
        Ok(self.buffer.pop_front().map(Pull::Row).unwrap_or(Pull::Eof))
    }
}

/// Drains upstream and records the row count as the total
#[derive(Default)]
pub struct Counter {
    done: bool,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResultProcessor for Counter {
    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Counter
    }

    fn next(&mut self, up: &mut Upstream<'_>, ctx: &mut ExecCtx<'_>) -> Result<Pull> {
        if self.done {
            return Ok(Pull::Eof);
        }
        // The index stage already counted every match
        while let Pull::Row(_) = up.pull(ctx)? {}
        self.done = true;
        Ok(Pull::Eof)
    }
}

/// Skips `offset` rows then passes at most `limit`
pub struct Pager {
    offset: u64,
    limit: u64,
    seen: u64,
}

impl Pager {
    pub fn new(offset: u64, limit: u64) -> Self {
        Self {
            offset,
            limit,
            seen: 0,
        }
    }
}

impl ResultProcessor for Pager {
    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Pager
    }

    fn next(&mut self, up: &mut Upstream<'_>, ctx: &mut ExecCtx<'_>) -> Result<Pull> {
        while self.seen < self.offset {
            match up.pull(ctx)? {
                Pull::Row(_) => self.seen += 1,
                other => return Ok(other),
            }
        }
        if self.seen >= self.offset.saturating_add(self.limit) {
            return Ok(Pull::Eof);
        }
        match up.pull(ctx)? {
            Pull::Row(row) => {
                self.seen += 1;
                Ok(Pull::Row(row))
            }
            other => Ok(other),
        }
    }
}

/// Fetches document fields into the row
pub struct Loader {
    /// `(key, storage path)` pairs fixed at build time
    keys: Vec<(KeyId, String)>,
    /// Registry that receives dynamic keys on a load-all
    load_all: Option<LookupRef>,
    dynamic: FxHashMap<String, KeyId>,
}

impl Loader {
    pub fn new(keys: Vec<(KeyId, String)>) -> Self {
        Self {
            keys,
            load_all: None,
            dynamic: FxHashMap::default(),
        }
    }

    pub fn load_all(lookup: LookupRef) -> Self {
        Self {
            keys: Vec::new(),
            load_all: Some(lookup),
            dynamic: FxHashMap::default(),
        }
    }

    fn dynamic_key(&mut self, name: &str) -> Option<KeyId> {
        if let Some(id) = self.dynamic.get(name) {
            return Some(*id);
        }
        let lookup = self.load_all.as_ref()?;
        let id = lookup.write().get_or_create_dynamic(name);
        self.dynamic.insert(name.to_string(), id);
        Some(id)
    }
}

impl ResultProcessor for Loader {
    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Loader
    }

    fn next(&mut self, up: &mut Upstream<'_>, ctx: &mut ExecCtx<'_>) -> Result<Pull> {
        loop {
            let mut row = match up.pull(ctx)? {
                Pull::Row(row) => row,
                other => return Ok(other),
            };
            let Some(doc_id) = row.doc_id() else {
                return Ok(Pull::Row(row));
            };
            if ctx.index.document(doc_id).is_none() {
                trace!(doc_id, "skipping deleted document");
                continue;
            }

            for (key, path) in &self.keys {
                if let Some(value) = ctx.index.document_field(doc_id, path) {
                    row.set(*key, value);
                }
            }
            if self.load_all.is_some() {
                for (name, value) in ctx.index.document_fields(doc_id) {
                    if let Some(key) = self.dynamic_key(&name) {
                        row.set(key, value);
                    }
                }
            }
            return Ok(Pull::Row(row));
        }
    }
}

/// APPLY: writes an expression result under an alias
pub struct Projector {
    expr: Expr,
    dst: KeyId,
}

impl Projector {
    pub fn new(expr: Expr, dst: KeyId) -> Self {
        Self { expr, dst }
    }
}

impl ResultProcessor for Projector {
    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Projector
    }

    fn next(&mut self, up: &mut Upstream<'_>, ctx: &mut ExecCtx<'_>) -> Result<Pull> {
        let mut row = match up.pull(ctx)? {
            Pull::Row(row) => row,
            other => return Ok(other),
        };
        let value = self.expr.evaluate(&row)?;
        row.set(self.dst, value);
        Ok(Pull::Row(row))
    }
}

/// FILTER: drops rows whose expression is falsy
pub struct FilterStage {
    expr: Expr,
}

impl FilterStage {
    pub fn new(expr: Expr) -> Self {
        Self { expr }
    }
}

impl ResultProcessor for FilterStage {
    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Filter
    }

    fn next(&mut self, up: &mut Upstream<'_>, ctx: &mut ExecCtx<'_>) -> Result<Pull> {
        loop {
            let row = match up.pull(ctx)? {
                Pull::Row(row) => row,
                other => return Ok(other),
            };
            if self.expr.evaluate(&row)?.is_truthy() {
                return Ok(Pull::Row(row));
            }
        }
    }
}
