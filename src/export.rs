//! Writing extraction results to disk.
//!
//! Host-only results are one endpoint per line, sorted. Custom-field
//! results are CSV with a header row.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::models::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Lines,
    Csv,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Lines => "txt",
            OutputFormat::Csv => "csv",
        }
    }
}

/// `<prefix>_<query>_<timestamp>.<ext>` with the query reduced to a safe slug.
pub fn output_path(dir: &Path, prefix: &str, query: &str, format: OutputFormat) -> PathBuf {
    let mut slug: String = query
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    while slug.contains("__") {
        slug = slug.replace("__", "_");
    }
    let slug: String = slug.trim_matches('_').chars().take(40).collect();
    let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let name = if slug.is_empty() {
        format!("{}_{}.{}", prefix, stamp, format.extension())
    } else {
        format!("{}_{}_{}.{}", prefix, slug, stamp, format.extension())
    };
    dir.join(name)
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn csv_line(values: &[String]) -> String {
    values
        .iter()
        .map(|v| csv_field(v))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn render_csv(fields: &[String], rows: &[Row]) -> String {
    let mut out = csv_line(fields);
    out.push('\n');
    for row in rows {
        out.push_str(&csv_line(row));
        out.push('\n');
    }
    out
}

pub fn render_lines(rows: &[Row]) -> String {
    let mut lines: Vec<&str> = rows
        .iter()
        .filter_map(|r| r.first().map(String::as_str))
        .collect();
    lines.sort_unstable();
    lines.dedup();
    lines.join("\n")
}

/// Write `rows` to `path`, creating the parent directory.
pub fn write_result(path: &Path, format: OutputFormat, fields: &[String], rows: &[Row]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let body = match format {
        OutputFormat::Lines => render_lines(rows),
        OutputFormat::Csv => render_csv(fields, rows),
    };
    std::fs::write(path, body).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Endpoint lines of an earlier host-only result file.
pub fn read_endpoints(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read result file: {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && l.contains(':'))
        .map(str::to_string)
        .collect())
}
