//! Serialization boundary for tabular results. NULL cells render as `NULL`.
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::db::{Cell, TabularResult};
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Csv,
    Tsv,
    Json,
}

impl FromStr for OutputFormat {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "table" => Ok(OutputFormat::Table),
            "csv" => Ok(OutputFormat::Csv),
            "tsv" => Ok(OutputFormat::Tsv),
            "json" => Ok(OutputFormat::Json),
            other => Err(EngineError::Configuration(format!(
                "unknown output format '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutputFormat::Table => "table",
            OutputFormat::Csv => "csv",
            OutputFormat::Tsv => "tsv",
            OutputFormat::Json => "json",
        };
        f.write_str(name)
    }
}

pub fn render(result: &TabularResult, format: OutputFormat) -> String {
    match format {
        OutputFormat::Table => to_table(result),
        OutputFormat::Csv => to_csv(result),
        OutputFormat::Tsv => to_tsv(result),
        OutputFormat::Json => to_json(result),
    }
}

pub fn to_csv(result: &TabularResult) -> String {
    let mut output = String::new();

    let headers: Vec<String> = result.headers().iter().map(|h| csv_escape(h)).collect();
    output.push_str(&headers.join(","));
    output.push('\n');

    for row in result.rows() {
        let cells: Vec<String> = row.iter().map(|cell| csv_escape(cell.display())).collect();
        output.push_str(&cells.join(","));
        output.push('\n');
    }

    output
}

pub fn to_tsv(result: &TabularResult) -> String {
    let mut output = String::new();

    output.push_str(&result.headers().join("\t"));
    output.push('\n');

    for row in result.rows() {
        let cells: Vec<String> = row
            .iter()
            .map(|cell| cell.display().replace(['\t', '\n'], " "))
            .collect();
        output.push_str(&cells.join("\t"));
        output.push('\n');
    }

    output
}

/// Array of row objects keyed by header. Cells are strings, NULL included.
/// A repeated header gets a `_2`, `_3`, ... suffix so no column is lost.
pub fn to_json(result: &TabularResult) -> String {
    let keys = json_keys(result.headers());
    let rows_json: Vec<serde_json::Value> = result
        .rows()
        .iter()
        .map(|row| {
            let obj: serde_json::Map<String, serde_json::Value> = keys
                .iter()
                .cloned()
                .zip(row.iter().map(cell_to_json))
                .collect();
            serde_json::Value::Object(obj)
        })
        .collect();

    serde_json::to_string_pretty(&rows_json).unwrap_or_else(|_| "[]".to_string())
}

fn json_keys(headers: &[String]) -> Vec<String> {
    let mut used: HashSet<String> = HashSet::new();
    headers
        .iter()
        .map(|header| {
            let mut key = header.clone();
            let mut n = 1;
            while used.contains(&key) {
                n += 1;
                key = format!("{}_{}", header, n);
            }
            used.insert(key.clone());
            key
        })
        .collect()
}

fn cell_to_json(cell: &Cell) -> serde_json::Value {
    serde_json::Value::String(cell.display().to_string())
}

/// Fixed-width text table for terminals.
pub fn to_table(result: &TabularResult) -> String {
    if result.column_count() == 0 {
        return match result.rows_affected() {
            Some(n) => format!("{} row(s) affected\n", n),
            None => "OK\n".to_string(),
        };
    }

    let mut widths: Vec<usize> = result.headers().iter().map(|h| h.chars().count()).collect();
    for row in result.rows() {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.display().chars().count());
        }
    }

    let line = |cells: Vec<&str>| -> String {
        let padded: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!("{:<width$}", c, width = *w))
            .collect();
        format!("| {} |\n", padded.join(" | "))
    };
    let separator = format!(
        "+{}+\n",
        widths
            .iter()
            .map(|w| "-".repeat(w + 2))
            .collect::<Vec<_>>()
            .join("+")
    );

    let mut output = separator.clone();
    output.push_str(&line(result.headers().iter().map(String::as_str).collect()));
    output.push_str(&separator);
    for row in result.rows() {
        output.push_str(&line(row.iter().map(Cell::display).collect()));
    }
    output.push_str(&separator);
    output.push_str(&format!("({} row{})\n", result.row_count(), if result.row_count() == 1 { "" } else { "s" }));
    output
}

fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
