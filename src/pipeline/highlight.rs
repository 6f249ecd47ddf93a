//! HIGHLIGHT and SUMMARIZE for search results.

use super::lookup::KeyId;
use super::processor::{ExecCtx, ProcessorKind, Pull, ResultProcessor, Upstream};
use super::value::Value;
use crate::aggregate::args::ArgsCursor;
use crate::error::{QueryError, Result};
use crate::index::types::stem;
use crate::utils::tokenizer::{Token, tokenize};

const DEFAULT_OPEN_TAG: &str = "<b>";
const DEFAULT_CLOSE_TAG: &str = "</b>";
const DEFAULT_FRAGS: usize = 3;
const DEFAULT_FRAG_LEN: usize = 20;
const DEFAULT_SEPARATOR: &str = "... ";

#[derive(Debug, Clone, PartialEq)]
pub struct HighlightTags {
    pub open: String,
    pub close: String,
}

impl Default for HighlightTags {
    fn default() -> Self {
        Self {
            open: DEFAULT_OPEN_TAG.to_string(),
            close: DEFAULT_CLOSE_TAG.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummarizeSettings {
    /// Maximum number of fragments
    pub frags: usize,
    /// Tokens per fragment
    pub len: usize,
    pub separator: String,
}

impl Default for SummarizeSettings {
    fn default() -> Self {
        Self {
            frags: DEFAULT_FRAGS,
            len: DEFAULT_FRAG_LEN,
            separator: DEFAULT_SEPARATOR.to_string(),
        }
    }
}

/// Highlighting requested for a search, per field
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldList {
    /// Fields named by HIGHLIGHT FIELDS (empty: every returned text field)
    pub highlight_fields: Vec<String>,
    pub highlight: Option<HighlightTags>,
    /// Fields named by SUMMARIZE FIELDS (empty: every returned text field)
    pub summarize_fields: Vec<String>,
    pub summarize: Option<SummarizeSettings>,
}

impl FieldList {
    pub fn is_empty(&self) -> bool {
        self.highlight.is_none() && self.summarize.is_none()
    }

    /// Every field named explicitly by either clause
    pub fn named_fields(&self) -> impl Iterator<Item = &str> {
        self.highlight_fields
            .iter()
            .chain(self.summarize_fields.iter())
            .map(|s| s.as_str())
    }

    /// Settings that apply to `field`
    pub fn settings_for(&self, field: &str) -> FieldHighlight {
        let applies = |fields: &[String]| fields.is_empty() || fields.iter().any(|f| f == field);
        FieldHighlight {
            tags: self
                .highlight
                .as_ref()
                .filter(|_| applies(&self.highlight_fields))
                .cloned(),
            summarize: self
                .summarize
                .as_ref()
                .filter(|_| applies(&self.summarize_fields))
                .cloned(),
        }
    }
}

/// What happens to one field's text
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldHighlight {
    pub tags: Option<HighlightTags>,
    pub summarize: Option<SummarizeSettings>,
}

impl FieldHighlight {
    pub fn is_noop(&self) -> bool {
        self.tags.is_none() && self.summarize.is_none()
    }
}

fn bad(clause: &str, e: impl std::fmt::Display) -> QueryError {
    QueryError::parse_args(format!("Bad arguments for {}: {}", clause, e))
}

fn parse_fields(ac: &mut ArgsCursor<'_>, clause: &str) -> Result<Vec<String>> {
    let mut fields = ac.get_var_args().map_err(|e| bad(clause, e))?;
    let mut out = Vec::new();
    while let Ok(f) = fields.get_str() {
        out.push(f.strip_prefix('@').unwrap_or(f).to_string());
    }
    Ok(out)
}

/// Parse the arguments following `HIGHLIGHT`
pub fn parse_highlight(ac: &mut ArgsCursor<'_>, list: &mut FieldList) -> Result<()> {
    let mut tags = HighlightTags::default();
    loop {
        if ac.advance_if_match("FIELDS") {
            list.highlight_fields.extend(parse_fields(ac, "HIGHLIGHT")?);
        } else if ac.advance_if_match("TAGS") {
            tags.open = ac.get_string().map_err(|e| bad("HIGHLIGHT", e))?;
            tags.close = ac.get_string().map_err(|e| bad("HIGHLIGHT", e))?;
        } else {
            break;
        }
    }
    list.highlight = Some(tags);
    Ok(())
}

/// Parse the arguments following `SUMMARIZE`
pub fn parse_summarize(ac: &mut ArgsCursor<'_>, list: &mut FieldList) -> Result<()> {
    let mut settings = SummarizeSettings::default();
    loop {
        if ac.advance_if_match("FIELDS") {
            list.summarize_fields.extend(parse_fields(ac, "SUMMARIZE")?);
        } else if ac.advance_if_match("FRAGS") {
            settings.frags = ac.get_u64().map_err(|e| bad("SUMMARIZE", e))? as usize;
        } else if ac.advance_if_match("LEN") {
            settings.len = ac.get_u64().map_err(|e| bad("SUMMARIZE", e))? as usize;
        } else if ac.advance_if_match("SEPARATOR") {
            settings.separator = ac.get_string().map_err(|e| bad("SUMMARIZE", e))?;
        } else {
            break;
        }
    }
    list.summarize = Some(settings);
    Ok(())
}

fn is_match(token: &Token, terms: &[String]) -> bool {
    terms
        .iter()
        .any(|t| token.term == *t || stem(&token.term) == stem(t))
}

/// Wrap every matching token of `text` in the tags
pub fn highlight_text(text: &str, terms: &[String], tags: &HighlightTags) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let mut last = 0;
    for token in tokenize(text).iter().filter(|t| is_match(t, terms)) {
        out.push_str(&text[last..token.start]);
        out.push_str(&tags.open);
        out.push_str(&text[token.start..token.end]);
        out.push_str(&tags.close);
        last = token.end;
    }
    out.push_str(&text[last..]);
    out
}

/// Cut `text` into at most `frags` windows of `len` tokens around matches
pub fn summarize_text(text: &str, terms: &[String], settings: &SummarizeSettings) -> Vec<String> {
    let tokens = tokenize(text);
    if tokens.is_empty() || settings.len == 0 {
        return Vec::new();
    }
    let half = settings.len / 2;
    let mut windows: Vec<(usize, usize)> = Vec::new();
    for (i, _) in tokens.iter().enumerate().filter(|(_, t)| is_match(t, terms)) {
        if windows.len() >= settings.frags {
            break;
        }
        let start = i.saturating_sub(half);
        let end = (start + settings.len).min(tokens.len()) - 1;
        match windows.last_mut() {
            // Overlapping windows merge
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => windows.push((start, end)),
        }
    }
    if windows.is_empty() {
        windows.push((0, settings.len.min(tokens.len()) - 1));
    }
    windows
        .into_iter()
        .map(|(s, e)| text[tokens[s].start..tokens[e].end].to_string())
        .collect()
}

/// Apply one field's settings to its text
pub fn render(text: &str, terms: &[String], field: &FieldHighlight) -> String {
    let highlight = |s: &str| match &field.tags {
        Some(tags) => highlight_text(s, terms, tags),
        None => s.to_string(),
    };
    match &field.summarize {
        Some(settings) => {
            let frags: Vec<String> = summarize_text(text, terms, settings)
                .iter()
                .map(|f| highlight(f.as_str()))
                .collect();
            let mut out = frags.join(&settings.separator);
            if !out.is_empty() {
                out.push_str(&settings.separator);
            }
            out
        }
        None => highlight(text),
    }
}

/// Rewrites string values of the configured keys
pub struct Highlighter {
    terms: Vec<String>,
    fields: Vec<(KeyId, FieldHighlight)>,
}

impl Highlighter {
    pub fn new(terms: Vec<String>, fields: Vec<(KeyId, FieldHighlight)>) -> Self {
        let terms = terms.into_iter().map(|t| t.to_lowercase()).collect();
        Self { terms, fields }
    }
}

impl ResultProcessor for Highlighter {
    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Highlighter
    }

    fn next(&mut self, up: &mut Upstream<'_>, ctx: &mut ExecCtx<'_>) -> Result<Pull> {
        let mut row = match up.pull(ctx)? {
            Pull::Row(row) => row,
            other => return Ok(other),
        };
        for (key, settings) in &self.fields {
            let rendered = match row.get(*key) {
                Some(Value::String(text)) => render(text, &self.terms, settings),
                _ => continue,
            };
            row.set(*key, Value::String(rendered));
        }
        Ok(Pull::Row(row))
    }
}
