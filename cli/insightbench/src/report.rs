//! Renders stored CSV tables as styled HTML documents.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tera::{Context as TeraContext, Tera};

/// Columns that identify a row rather than measure something.
pub const IDENTITY_COLUMNS: &[&str] = &[
    "FunctionName",
    "Configuration",
    "Phase",
    "Runtime",
    "MemorySize",
    "Timeout",
];

const MAX_COLOR: &str = "#90ee90";
const MIN_COLOR: &str = "#ffcccb";

const TABLE_TEMPLATE: &str = r#"<html><head><style>
table {border-collapse: collapse; margin: 20px;}
body {font-family: Arial, sans-serif;}
th {background-color: #4682b4; color: white; font-weight: bold; text-align: center; padding: 4px 8px;}
td {background-color: #f0f8ff; border: 1px solid #4682b4; text-align: center; padding: 4px 8px;}
</style></head><body>
<h3>Results for {{ title }}</h3>
<table>
<thead><tr>{% for header in headers %}<th>{{ header }}</th>{% endfor %}</tr></thead>
<tbody>
{% for row in rows %}<tr>{% for cell in row %}<td{% if cell.color %} style="background-color: {{ cell.color }}"{% endif %}>{{ cell.value }}</td>{% endfor %}</tr>
{% endfor %}</tbody>
</table>
</body></html>
"#;

#[derive(Debug, Serialize, PartialEq)]
struct RenderCell {
    value: String,
    color: Option<&'static str>,
}

/// Per-column (min, max) over numeric cells, `None` for identity or non-numeric columns.
fn column_extremes(headers: &[String], rows: &[Vec<String>]) -> Vec<Option<(f64, f64)>> {
    headers
        .iter()
        .enumerate()
        .map(|(idx, header)| {
            if IDENTITY_COLUMNS.contains(&header.as_str()) {
                return None;
            }
            let values: Vec<f64> = rows
                .iter()
                .filter_map(|row| row.get(idx))
                .filter_map(|cell| cell.trim().parse::<f64>().ok())
                .filter(|v| v.is_finite())
                .collect();
            if values.is_empty() {
                return None;
            }
            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            Some((min, max))
        })
        .collect()
}

fn highlight(headers: &[String], rows: &[Vec<String>]) -> Vec<Vec<RenderCell>> {
    let extremes = column_extremes(headers, rows);
    rows.iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .map(|(idx, value)| {
                    let parsed = value.trim().parse::<f64>().ok();
                    // Max wins when a column holds a single distinct value.
                    let color = match (extremes.get(idx).copied().flatten(), parsed) {
                        (Some((_, max)), Some(v)) if v == max => Some(MAX_COLOR),
                        (Some((min, _)), Some(v)) if v == min => Some(MIN_COLOR),
                        _ => None,
                    };
                    RenderCell {
                        value: value.clone(),
                        color,
                    }
                })
                .collect()
        })
        .collect()
}

/// Renders one CSV file into an HTML string.
pub fn render_csv(csv_path: &Path) -> Result<String> {
    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("Failed to open {}", csv_path.display()))?;
    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.with_context(|| format!("Malformed row in {}", csv_path.display()))?;
        rows.push(record.iter().map(str::to_string).collect::<Vec<_>>());
    }

    let mut tera = Tera::default();
    tera.add_raw_template("table.html", TABLE_TEMPLATE)?;
    let mut ctx = TeraContext::new();
    let title = csv_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    ctx.insert("title", &title);
    ctx.insert("headers", &headers);
    ctx.insert("rows", &highlight(&headers, &rows));

    tera.render("table.html", &ctx)
        .with_context(|| format!("Failed to render {}", csv_path.display()))
}

/// Converts every CSV in `dir` into `dir/html_files/<stem>.html`.
///
/// A file that fails to render is logged and skipped.
pub fn render_directory(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut csv_files: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "csv"))
        .collect();
    csv_files.sort();

    let output_dir = dir.join("html_files");
    fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;

    let mut written = Vec::new();
    for csv_file in csv_files {
        let html = match render_csv(&csv_file) {
            Ok(html) => html,
            Err(e) => {
                tracing::error!(file = %csv_file.display(), error = %e, "Failed to render report");
                continue;
            }
        };
        let stem = csv_file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "report".to_string());
        let html_path = output_dir.join(format!("{}.html", stem));
        fs::write(&html_path, html)
            .with_context(|| format!("Failed to write {}", html_path.display()))?;
        tracing::info!(from = %csv_file.display(), to = %html_path.display(), "Converted");
        written.push(html_path);
    }
    Ok(written)
}
