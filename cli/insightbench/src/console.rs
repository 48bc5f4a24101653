use crate::stats::SampleStats;
use crate::types::{CostMetric, FieldMap, PhaseOutcome, PhaseWindow};
use anyhow::{anyhow, Result};
use chrono::FixedOffset;
use colored::*;
use comfy_table::{
    presets::*, Attribute, Cell, CellAlignment, ColumnConstraint, ContentArrangement, Table,
    TableComponent, Width,
};

const TABLE_WIDTH: u16 = 100;
const DESCRIPTION_WIDTH: u16 = 22;
const WINDOW_FORMAT: &str = "%Y-%m-%d %H:%M:%S %:z";

/// Parses `Z`, `UTC`, `+05:30`, `-0800` or `+5` into a fixed offset.
pub fn parse_tz_offset(raw: &str) -> Result<FixedOffset> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("z") || trimmed.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(|| anyhow!("Invalid offset"));
    }
    let (sign, rest) = match trimmed.chars().next() {
        Some('+') => (1, &trimmed[1..]),
        Some('-') => (-1, &trimmed[1..]),
        _ => return Err(anyhow!("Offset '{}' must start with + or -", raw)),
    };
    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h, m),
        None if rest.len() == 4 && rest.is_ascii() => rest.split_at(2),
        None => (rest, "0"),
    };
    let hours: i32 = hours
        .parse()
        .map_err(|_| anyhow!("Invalid hours in offset '{}'", raw))?;
    let minutes: i32 = minutes
        .parse()
        .map_err(|_| anyhow!("Invalid minutes in offset '{}'", raw))?;
    if hours > 23 || minutes > 59 {
        return Err(anyhow!("Offset '{}' is out of range", raw));
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| anyhow!("Offset '{}' is out of range", raw))
}

/// Start and end of the window rendered in `offset`.
pub fn format_window(window: &PhaseWindow, offset: &FixedOffset) -> (String, String) {
    (
        window
            .start
            .with_timezone(offset)
            .format(WINDOW_FORMAT)
            .to_string(),
        window
            .end
            .with_timezone(offset)
            .format(WINDOW_FORMAT)
            .to_string(),
    )
}

pub fn print_window(title: &str, window: &PhaseWindow, offset: &FixedOffset) {
    let (start, end) = format_window(window, offset);
    println!("{}", title.bright_blue().bold());
    println!("  {} {}", "Start:".bright_black(), start);
    println!("  {} {}", "End:  ".bright_black(), end);
}

fn styled_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(NOTHING)
        .set_style(TableComponent::MiddleHeaderIntersections, '┴')
        .set_style(TableComponent::BottomBorder, '─')
        .set_style(TableComponent::BottomBorderIntersections, '─')
        .set_style(TableComponent::HeaderLines, '─')
        .set_content_arrangement(ContentArrangement::DynamicFullWidth)
        .set_width(TABLE_WIDTH)
        .set_header(
            headers
                .iter()
                .map(|h| Cell::new(h).add_attribute(Attribute::Bold))
                .collect::<Vec<_>>(),
        )
        .set_constraints(vec![ColumnConstraint::LowerBoundary(Width::Fixed(
            DESCRIPTION_WIDTH,
        ))]);
    table
}

fn ms_cell(value: f64) -> Cell {
    let text = if value.is_nan() {
        "N/A ms".to_string()
    } else {
        format!("{:.2} ms", value)
    };
    Cell::new(text).set_alignment(CellAlignment::Right)
}

/// Builds the client-side statistics table for one phase.
pub fn phase_table(metric: CostMetric, stats: &SampleStats) -> Table {
    let label = match metric {
        CostMetric::Latency => "Response Time",
        CostMetric::Billed => "Billed Duration",
    };
    let mut table = styled_table(&["Metric", "Samples", "Mean", "Median", "P95", "P99"]);
    table.add_row(vec![
        Cell::new(label),
        Cell::new(stats.count).set_alignment(CellAlignment::Right),
        ms_cell(stats.mean),
        ms_cell(stats.median),
        ms_cell(stats.p95),
        ms_cell(stats.p99),
    ]);
    table
}

pub fn print_phase_results(
    title: &str,
    metric: CostMetric,
    outcome: &PhaseOutcome,
    stats: Option<&SampleStats>,
) {
    println!(
        "{}",
        format!(
            "{} | {} batches | {} attempted | {} samples",
            title,
            outcome.batches,
            outcome.attempted,
            outcome.samples.len()
        )
        .bright_blue()
        .bold()
    );
    println!("{}", "─".repeat(TABLE_WIDTH as usize).bright_black());
    match stats {
        Some(stats) => println!("{}", phase_table(metric, stats)),
        None => println!("{}", "No successful invocations".yellow()),
    }
    println!();
}

/// Key/value table of the statistics reported by the log backend.
pub fn backend_table(fields: &FieldMap) -> Table {
    let mut table = styled_table(&["Field", "Value"]);
    for (key, value) in fields {
        table.add_row(vec![
            Cell::new(key),
            Cell::new(value.to_string()).set_alignment(CellAlignment::Right),
        ]);
    }
    table
}

pub fn print_backend_results(title: &str, fields: Option<&FieldMap>) {
    println!("{}", title.bright_blue().bold());
    println!("{}", "─".repeat(TABLE_WIDTH as usize).bright_black());
    match fields {
        Some(fields) => println!("{}", backend_table(fields)),
        None => println!("{}", "No log statistics available".yellow()),
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldValue;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_parse_tz_offset_forms() {
        assert_eq!(
            parse_tz_offset("+05:30").unwrap().local_minus_utc(),
            5 * 3600 + 30 * 60
        );
        assert_eq!(parse_tz_offset("-0800").unwrap().local_minus_utc(), -8 * 3600);
        assert_eq!(parse_tz_offset("+2").unwrap().local_minus_utc(), 2 * 3600);
        assert_eq!(parse_tz_offset("UTC").unwrap().local_minus_utc(), 0);
        assert!(parse_tz_offset("05:30").is_err());
        assert!(parse_tz_offset("+25:00").is_err());
        assert!(parse_tz_offset("+ab").is_err());
    }

    #[test]
    fn test_parse_tz_offset_multibyte_input() {
        assert!(parse_tz_offset("+a€").is_err());
        assert!(parse_tz_offset("-€€").is_err());
        assert!(parse_tz_offset("+é05").is_err());
    }

    #[test]
    fn test_format_window_in_offset() {
        let window = PhaseWindow {
            start: Utc.with_ymd_and_hms(2024, 3, 1, 22, 45, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 3, 1, 23, 0, 5).unwrap(),
        };
        let ist = parse_tz_offset("+05:30").unwrap();
        let (start, end) = format_window(&window, &ist);
        assert_eq!(start, "2024-03-02 04:15:00 +05:30");
        assert_eq!(end, "2024-03-02 04:30:05 +05:30");
    }

    #[test]
    fn test_tables_contain_values() {
        let stats = SampleStats {
            count: 3,
            mean: 12.5,
            median: 11.0,
            p50: 11.0,
            p95: 20.25,
            p99: f64::NAN,
        };
        let rendered = phase_table(CostMetric::Billed, &stats).to_string();
        assert!(rendered.contains("Billed Duration"));
        assert!(rendered
            .lines()
            .any(|line| line.split_whitespace().nth(2) == Some("3")));
        assert!(rendered.contains("12.50 ms"));
        assert!(rendered.contains("N/A ms"));

        let mut fields = FieldMap::new();
        fields.insert("coldStartCount".to_string(), FieldValue::Number(42.0));
        let rendered = backend_table(&fields).to_string();
        assert!(rendered.contains("coldStartCount"));
        assert!(rendered.contains("42"));
    }
}
