use crate::error::{QueryError, Result};
use crate::index::types::StopWordList;
use crate::utils::tokenizer;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Parsed query representation
#[derive(Debug, Clone)]
pub struct QueryAst {
    pub root: QueryNode,
    /// Positive text terms, in query order, for scoring and highlighting
    pub terms: Vec<String>,
}

/// Query AST node
#[derive(Debug, Clone, PartialEq)]
pub enum QueryNode {
    /// Single word
    Term(String),
    /// Word prefix (`foo*`)
    Prefix(String),
    /// Adjacent words (quoted)
    Phrase(Vec<String>),
    /// Restrict the inner text node to the named fields (`@title:...`)
    Fields { fields: Vec<String>, node: Box<QueryNode> },
    /// Numeric range on one field (`@price:[10 (20]`)
    NumericRange(NumericRange),
    /// Any of the listed tags (`@tags:{a | b}`)
    Tag { field: String, values: Vec<String> },
    /// Every document (`*`)
    Wildcard,
    /// Boolean AND (all must match)
    And(Vec<QueryNode>),
    /// Boolean OR (any can match)
    Or(Vec<QueryNode>),
    /// Boolean NOT (exclude matches)
    Not(Box<QueryNode>),
    /// Matches nothing (stopword-only input)
    Empty,
}

/// Bounds of a numeric range
#[derive(Debug, Clone, PartialEq)]
pub struct NumericRange {
    pub field: String,
    pub min: f64,
    pub max: f64,
    pub min_inclusive: bool,
    pub max_inclusive: bool,
}

impl NumericRange {
    pub fn contains(&self, v: f64) -> bool {
        let above = if self.min_inclusive { v >= self.min } else { v > self.min };
        let below = if self.max_inclusive { v <= self.max } else { v < self.max };
        above && below
    }
}

/// Parser settings derived from the request
#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    /// `None` keeps stopwords (NOSTOPWORDS)
    pub stopwords: Option<Arc<StopWordList>>,
    pub params: FxHashMap<String, String>,
    pub dialect: u32,
}

/// Parse query text into an AST
pub fn parse_query(input: &str, opts: &ParseOptions) -> Result<QueryAst> {
    let mut parser = QueryParser::new(input, opts);
    parser.parse()
}

/// Query parser
struct QueryParser<'a> {
    input: &'a str,
    pos: usize,
    opts: &'a ParseOptions,
    terms: Vec<String>,
    negated: usize,
}

impl<'a> QueryParser<'a> {
    fn new(input: &'a str, opts: &'a ParseOptions) -> Self {
        Self {
            input,
            pos: 0,
            opts,
            terms: Vec::new(),
            negated: 0,
        }
    }

    fn parse(&mut self) -> Result<QueryAst> {
        let root = self.parse_or()?;
        self.skip_whitespace();
        if !self.is_eof() {
            return Err(self.syntax_error());
        }
        Ok(QueryAst {
            root,
            terms: std::mem::take(&mut self.terms),
        })
    }

    fn parse_or(&mut self) -> Result<QueryNode> {
        let mut nodes = vec![self.parse_and()?];

        self.skip_whitespace();
        while self.consume_char('|') {
            nodes.push(self.parse_and()?);
            self.skip_whitespace();
        }

        nodes.retain(|n| *n != QueryNode::Empty);
        Ok(match nodes.len() {
            0 => QueryNode::Empty,
            1 => nodes.remove(0),
            _ => QueryNode::Or(nodes),
        })
    }

    fn parse_and(&mut self) -> Result<QueryNode> {
        let mut nodes = Vec::new();

        loop {
            self.skip_whitespace();

            if self.is_eof() || self.peek_char() == Some(')') || self.peek_char() == Some('|') {
                break;
            }

            let node = self.parse_unary()?;
            if node != QueryNode::Empty {
                nodes.push(node);
            }
        }

        Ok(match nodes.len() {
            0 => QueryNode::Empty,
            1 => nodes.remove(0),
            _ => QueryNode::And(nodes),
        })
    }

    fn parse_unary(&mut self) -> Result<QueryNode> {
        self.skip_whitespace();

        if self.consume_char('-') {
            self.negated += 1;
            let inner = self.parse_primary();
            self.negated -= 1;
            return Ok(match inner? {
                QueryNode::Empty => QueryNode::Empty,
                node => QueryNode::Not(Box::new(node)),
            });
        }

        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<QueryNode> {
        self.skip_whitespace();

        if self.consume_char('(') {
            let node = self.parse_or()?;
            self.expect_char(')')?;
            return Ok(node);
        }

        match self.peek_char() {
            Some('"') => self.parse_phrase(),
            Some('@') => self.parse_field(),
            Some('*') => {
                self.advance();
                Ok(QueryNode::Wildcard)
            }
            Some('$') if self.opts.dialect >= 2 => {
                self.advance();
                let value = self.read_param()?;
                Ok(self.word_node(&value.to_lowercase(), false))
            }
            _ => self.parse_term(),
        }
    }

    fn parse_phrase(&mut self) -> Result<QueryNode> {
        let open = self.pos;
        self.consume_char('"');
        let start = self.pos;

        while !self.is_eof() && self.peek_char() != Some('"') {
            self.advance();
        }
        if self.is_eof() {
            return Err(QueryError::syntax(format!(
                "Syntax error at offset {}: unterminated quote",
                open
            )));
        }

        let words: Vec<String> = tokenizer::terms(&self.input[start..self.pos])
            .into_iter()
            .filter(|w| !self.is_stopword(w))
            .collect();
        self.consume_char('"');

        self.record_terms(&words);
        Ok(match words.len() {
            0 => QueryNode::Empty,
            1 => QueryNode::Term(words.into_iter().next().unwrap_or_default()),
            _ => QueryNode::Phrase(words),
        })
    }

    fn parse_term(&mut self) -> Result<QueryNode> {
        let word = self.read_word();

        if word.is_empty() {
            // Punctuation between words separates terms
            match self.peek_char() {
                Some(ch) if ch == '(' || ch == ')' || ch == '|' => {
                    return Err(self.syntax_error());
                }
                Some(_) => self.advance(),
                None => {}
            }
            return Ok(QueryNode::Empty);
        }

        let prefix = self.consume_char('*');
        Ok(self.word_node(&word.to_lowercase(), prefix))
    }

    fn word_node(&mut self, word: &str, prefix: bool) -> QueryNode {
        if prefix {
            return QueryNode::Prefix(word.to_string());
        }
        let words = tokenizer::terms(word);
        let words: Vec<String> = words.into_iter().filter(|w| !self.is_stopword(w)).collect();
        self.record_terms(&words);
        match words.len() {
            0 => QueryNode::Empty,
            1 => QueryNode::Term(words.into_iter().next().unwrap_or_default()),
            _ => QueryNode::Phrase(words),
        }
    }

    fn parse_field(&mut self) -> Result<QueryNode> {
        self.consume_char('@');
        let mut fields = vec![self.read_field_name()];
        while self.consume_char('|') {
            self.consume_char('@');
            fields.push(self.read_field_name());
        }
        if fields.iter().any(|f| f.is_empty()) || !self.consume_char(':') {
            return Err(self.syntax_error());
        }

        match self.peek_char() {
            Some('[') => {
                let field = fields.swap_remove(0);
                self.parse_numeric_range(field)
            }
            Some('{') => {
                let field = fields.swap_remove(0);
                self.parse_tags(field)
            }
            _ => {
                let node = self.parse_primary()?;
                Ok(match node {
                    QueryNode::Empty => QueryNode::Empty,
                    node => QueryNode::Fields {
                        fields,
                        node: Box::new(node),
                    },
                })
            }
        }
    }

    fn parse_numeric_range(&mut self, field: String) -> Result<QueryNode> {
        self.consume_char('[');
        self.skip_whitespace();
        let (min, min_inclusive) = self.read_range_bound()?;
        self.skip_whitespace();
        self.consume_char(',');
        self.skip_whitespace();
        let (max, max_inclusive) = self.read_range_bound()?;
        self.skip_whitespace();
        self.expect_char(']')?;

        Ok(QueryNode::NumericRange(NumericRange {
            field,
            min,
            max,
            min_inclusive,
            max_inclusive,
        }))
    }

    fn read_range_bound(&mut self) -> Result<(f64, bool)> {
        let exclusive = self.consume_char('(');
        let start = self.pos;
        while let Some(ch) = self.peek_char() {
            if ch.is_whitespace() || ch == ']' || ch == ',' {
                break;
            }
            self.advance();
        }
        let mut token = self.input[start..self.pos].to_string();
        if let Some(name) = token.strip_prefix('$') {
            if self.opts.dialect >= 2 {
                token = self.param_value(name)?;
            }
        }
        let value = parse_bound(&token).ok_or_else(|| {
            QueryError::syntax(format!("Expected numeric value, got `{}`", token))
        })?;
        Ok((value, !exclusive))
    }

    fn parse_tags(&mut self, field: String) -> Result<QueryNode> {
        self.consume_char('{');
        let start = self.pos;
        while !self.is_eof() && self.peek_char() != Some('}') {
            self.advance();
        }
        let body = self.input[start..self.pos].to_string();
        self.expect_char('}')?;

        let mut values = Vec::new();
        for raw in body.split('|') {
            let raw = raw.trim();
            let value = match raw.strip_prefix('$') {
                Some(name) if self.opts.dialect >= 2 => self.param_value(name)?,
                _ => raw.to_string(),
            };
            if !value.is_empty() {
                values.push(value.to_lowercase());
            }
        }
        if values.is_empty() {
            return Err(QueryError::syntax(format!("Empty tag list for field `{}`", field)));
        }
        Ok(QueryNode::Tag { field, values })
    }

    fn read_param(&mut self) -> Result<String> {
        let name = self.read_word();
        self.param_value(&name)
    }

    fn param_value(&self, name: &str) -> Result<String> {
        self.opts
            .params
            .get(name)
            .cloned()
            .ok_or_else(|| QueryError::syntax(format!("No such parameter `{}`", name)))
    }

    fn record_terms(&mut self, words: &[String]) {
        if self.negated == 0 {
            self.terms.extend(words.iter().cloned());
        }
    }

    fn is_stopword(&self, word: &str) -> bool {
        self.opts
            .stopwords
            .as_ref()
            .is_some_and(|sw| sw.contains(word))
    }

    fn read_word(&mut self) -> String {
        let start = self.pos;
        while let Some(ch) = self.peek_char() {
            if ch.is_alphanumeric() || ch == '_' {
                self.advance();
            } else {
                break;
            }
        }
        self.input[start..self.pos].to_string()
    }

    fn read_field_name(&mut self) -> String {
        let start = self.pos;
        while let Some(ch) = self.peek_char() {
            if ch.is_alphanumeric() || ch == '_' || ch == '.' || ch == '$' {
                self.advance();
            } else {
                break;
            }
        }
        self.input[start..self.pos].to_string()
    }

    fn syntax_error(&self) -> QueryError {
        let near: String = self.remaining().chars().take(16).collect();
        QueryError::syntax(format!("Syntax error at offset {} near `{}`", self.pos, near))
    }

    fn expect_char(&mut self, expected: char) -> Result<()> {
        self.skip_whitespace();
        if self.consume_char(expected) {
            Ok(())
        } else {
            Err(self.syntax_error())
        }
    }

    fn skip_whitespace(&mut self) {
        while !self.is_eof() && self.peek_char().map(|c| c.is_whitespace()).unwrap_or(false) {
            self.advance();
        }
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn consume_char(&mut self, expected: char) -> bool {
        if self.peek_char() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn advance(&mut self) {
        if let Some(ch) = self.peek_char() {
            self.pos += ch.len_utf8();
        }
    }

    fn remaining(&self) -> &str {
        &self.input[self.pos..]
    }
}

/// Parse a range bound: a number, `inf`, `+inf` or `-inf`
fn parse_bound(token: &str) -> Option<f64> {
    match token.to_lowercase().as_str() {
        "inf" | "+inf" => Some(f64::INFINITY),
        "-inf" => Some(f64::NEG_INFINITY),
        t => t.parse::<f64>().ok().filter(|v| !v.is_nan()),
    }
}
