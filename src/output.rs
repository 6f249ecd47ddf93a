//! Output formatting for search and aggregate replies

use crate::pipeline::value::Value;
use serde::Serialize;
use std::io::{self, Write};
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

/// One reply row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputRow {
    /// Document key (search replies only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    pub fields: Vec<(String, Value)>,
}

impl OutputRow {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

/// Rows of one execution or cursor read
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionResult {
    pub total_results: u64,
    pub rows: Vec<OutputRow>,
    /// The time budget ran out; `rows` are partial
    pub timed_out: bool,
    /// No more rows can be read
    #[serde(skip)]
    pub exhausted: bool,
    /// Set while a cursor has rows left
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor_id: Option<u64>,
}

/// Render a field value; with `expand`, serialized JSON documents become
/// structured values
fn field_json(value: &Value, expand: bool) -> serde_json::Value {
    if expand {
        if let Value::String(s) = value {
            if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(s) {
                if parsed.is_object() || parsed.is_array() {
                    return parsed;
                }
            }
        }
    }
    value.to_json()
}

/// JSON form of a result
pub fn to_json(result: &ExecutionResult, expand: bool) -> serde_json::Value {
    let rows: Vec<serde_json::Value> = result
        .rows
        .iter()
        .map(|row| {
            let mut fields = serde_json::Map::new();
            for (name, value) in &row.fields {
                fields.insert(name.clone(), field_json(value, expand));
            }
            let mut obj = serde_json::Map::new();
            if let Some(key) = &row.key {
                obj.insert("id".into(), key.clone().into());
            }
            if let Some(score) = row.score {
                obj.insert("score".into(), score.into());
            }
            obj.insert("extra_attributes".into(), fields.into());
            obj.into()
        })
        .collect();

    let mut out = serde_json::Map::new();
    out.insert("total_results".into(), result.total_results.into());
    out.insert("results".into(), rows.into());
    if result.timed_out {
        out.insert("warning".into(), "Timeout limit was reached".into());
    }
    if let Some(id) = result.cursor_id {
        out.insert("cursor".into(), id.into());
    }
    out.into()
}

/// Print a result as JSON
pub fn print_json(result: &ExecutionResult, expand: bool) -> io::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    serde_json::to_writer_pretty(&mut out, &to_json(result, expand))?;
    writeln!(out)
}

/// Print rows in a readable, colored layout
pub fn print_rows(result: &ExecutionResult, color: bool) -> io::Result<()> {
    let choice = if color {
        ColorChoice::Auto
    } else {
        ColorChoice::Never
    };
    let mut stdout = StandardStream::stdout(choice);

    stdout.set_color(ColorSpec::new().set_bold(true))?;
    writeln!(stdout, "{} result(s)", result.total_results)?;
    stdout.reset()?;

    for (i, row) in result.rows.iter().enumerate() {
        if i > 0 {
            writeln!(stdout)?;
        }
        print_row(&mut stdout, row)?;
    }

    if result.timed_out {
        stdout.set_color(ColorSpec::new().set_fg(Some(Color::Yellow)))?;
        writeln!(stdout, "warning: Timeout limit was reached")?;
        stdout.reset()?;
    }
    if let Some(id) = result.cursor_id {
        stdout.set_color(ColorSpec::new().set_fg(Some(Color::Cyan)))?;
        writeln!(stdout, "cursor: {}", id)?;
        stdout.reset()?;
    }
    Ok(())
}

fn print_row(stdout: &mut StandardStream, row: &OutputRow) -> io::Result<()> {
    if let Some(key) = &row.key {
        stdout.set_color(ColorSpec::new().set_fg(Some(Color::Magenta)).set_bold(true))?;
        write!(stdout, "{}", key)?;
        stdout.reset()?;
        if let Some(score) = row.score {
            write!(stdout, " ")?;
            stdout.set_color(ColorSpec::new().set_fg(Some(Color::Green)))?;
            write!(stdout, "({})", score)?;
            stdout.reset()?;
        }
        writeln!(stdout)?;
    }

    for (name, value) in &row.fields {
        write!(stdout, "  ")?;
        stdout.set_color(ColorSpec::new().set_fg(Some(Color::Cyan)))?;
        write!(stdout, "{}", name)?;
        stdout.reset()?;
        writeln!(stdout, ": {}", value)?;
    }
    Ok(())
}
