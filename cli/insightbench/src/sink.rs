//! Append-only CSV result store.
//!
//! The first write to a path creates the file and its header; later writes append data
//! rows aligned to the header already on disk. A row carrying columns the header lacks
//! widens the header, and earlier rows get empty cells for them.

use crate::types::ResultRow;
use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::path::Path;

/// Column names in first-seen order across `rows`.
pub fn columns_for(rows: &[ResultRow]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        for key in row.fields.keys() {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.clone());
            }
        }
    }
    columns
}

fn existing_header(path: &Path) -> Result<Vec<String>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(reader
        .headers()
        .with_context(|| format!("Failed to read header of {}", path.display()))?
        .iter()
        .map(str::to_string)
        .collect())
}

/// Rewrites `path` under the header `columns`, which must extend `current`.
fn widen_header(path: &Path, current: &[String], columns: &[String]) -> Result<()> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let tmp = path.with_extension("csv.tmp");
    let mut writer = csv::Writer::from_path(&tmp)
        .with_context(|| format!("Failed to create {}", tmp.display()))?;
    writer.write_record(columns)?;
    for record in reader.records() {
        let record = record.with_context(|| format!("Failed to read {}", path.display()))?;
        let widened: Vec<&str> = columns
            .iter()
            .map(|c| {
                current
                    .iter()
                    .position(|existing| existing == c)
                    .and_then(|i| record.get(i))
                    .unwrap_or("")
            })
            .collect();
        writer.write_record(&widened)?;
    }
    writer.flush()?;
    drop(writer);
    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Appends `rows` to the CSV file at `path`, writing a header first if the file is new.
///
/// Returns the number of data rows written.
pub fn append_rows(path: &Path, rows: &[ResultRow]) -> Result<usize> {
    if rows.is_empty() {
        tracing::debug!(path = %path.display(), "Nothing to append");
        return Ok(0);
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    let file_exists = path.is_file();
    let columns = if file_exists {
        let current = existing_header(path)?;
        let added: Vec<String> = columns_for(rows)
            .into_iter()
            .filter(|c| !current.contains(c))
            .collect();
        if added.is_empty() {
            current
        } else {
            tracing::info!(path = %path.display(), ?added, "Widening header");
            let widened: Vec<String> = current.iter().chain(added.iter()).cloned().collect();
            widen_header(path, &current, &widened)?;
            widened
        }
    } else {
        columns_for(rows)
    };

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {} for appending", path.display()))?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);

    if !file_exists {
        writer.write_record(&columns)?;
    }
    for row in rows {
        let record: Vec<String> = columns
            .iter()
            .map(|c| row.fields.get(c).map(|v| v.to_string()).unwrap_or_default())
            .collect();
        writer.write_record(&record)?;
    }
    writer.flush()?;

    tracing::info!(path = %path.display(), rows = rows.len(), "Data appended");
    Ok(rows.len())
}

/// Removes every `*.csv` file directly inside `dir`.
pub fn clean_csv_dir(dir: &Path) -> Result<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "csv") {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
            removed += 1;
        }
    }
    tracing::debug!(dir = %dir.display(), removed, "Cleaned result directory");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldValue;
    use tempfile::tempdir;

    fn row(function: &str, avg: f64) -> ResultRow {
        ResultRow::new()
            .with("FunctionName", function)
            .with("avgBilledDuration", avg)
            .with("totalInvocations", FieldValue::Number(10.0))
    }

    #[test]
    fn test_append_creates_header_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results").join("warmStart.csv");

        assert_eq!(append_rows(&path, &[row("a", 1.5)]).unwrap(), 1);
        assert_eq!(append_rows(&path, &[row("b", 2.0)]).unwrap(), 1);

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(
            lines,
            vec![
                "FunctionName,avgBilledDuration,totalInvocations",
                "a,1.5,10",
                "b,2,10",
            ]
        );
    }

    #[test]
    fn test_append_aligns_to_existing_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("coldStart.csv");
        append_rows(&path, &[row("a", 1.0)]).unwrap();

        let reordered = ResultRow::new()
            .with("totalInvocations", 3.0)
            .with("FunctionName", "b");
        append_rows(&path, &[reordered]).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().nth(2), Some("b,,3"));
        assert_eq!(content.lines().count(), 3);
    }

    #[test]
    fn test_backend_columns_after_client_only_row() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results.csv");
        let client_only = ResultRow::new()
            .with("ConcurrentUsers", 2usize)
            .with("P99", 12.0);
        append_rows(&path, &[client_only]).unwrap();

        let verified = ResultRow::new()
            .with("ConcurrentUsers", 2usize)
            .with("P99", 11.0)
            .with("totalInvocations", 2.0)
            .with("p99BilledDuration", 7.0);
        append_rows(&path, &[verified]).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(
            lines,
            vec![
                "ConcurrentUsers,P99,totalInvocations,p99BilledDuration",
                "2,12,,",
                "2,11,2,7",
            ]
        );
        assert!(!path.with_extension("csv.tmp").exists());
    }

    #[test]
    fn test_columns_union_in_first_seen_order() {
        let rows = vec![
            ResultRow::new().with("FunctionName", "a").with("x", 1.0),
            ResultRow::new().with("FunctionName", "b").with("y", 2.0),
        ];
        assert_eq!(columns_for(&rows), vec!["FunctionName", "x", "y"]);
    }

    #[test]
    fn test_append_nothing_creates_no_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        assert_eq!(append_rows(&path, &[]).unwrap(), 0);
        assert!(!path.exists());
    }

    #[test]
    fn test_append_to_unwritable_path_errors() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "not a directory").unwrap();
        let path = blocker.join("out.csv");
        assert!(append_rows(&path, &[row("a", 1.0)]).is_err());
    }

    #[test]
    fn test_clean_csv_dir_only_removes_csv() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.csv"), "x").unwrap();
        fs::write(dir.path().join("b.csv"), "x").unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();

        assert_eq!(clean_csv_dir(dir.path()).unwrap(), 2);
        assert!(dir.path().join("notes.txt").exists());
        assert_eq!(clean_csv_dir(&dir.path().join("missing")).unwrap(), 0);
    }
}
