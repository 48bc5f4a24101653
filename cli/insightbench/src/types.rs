use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::fmt;

/// Status code returned by a synchronous (`RequestResponse`) invocation that succeeded.
pub const SUCCESS_STATUS: i32 = 200;

/// Which per-invocation cost the client records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum CostMetric {
    /// Client-observed round trip in milliseconds
    #[default]
    Latency,
    /// Platform-reported billed duration, parsed from the invocation log tail
    Billed,
}

/// Outcome of one remote call.
///
/// Both fields are absent when the call failed before a response was received.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct InvocationResult {
    pub status_code: Option<i32>,
    pub cost_ms: Option<f64>,
}

impl InvocationResult {
    pub fn new(status_code: i32, cost_ms: Option<f64>) -> Self {
        Self {
            status_code: Some(status_code),
            cost_ms,
        }
    }

    pub fn failed() -> Self {
        Self::default()
    }

    /// The cost sample this result contributes, if any.
    pub fn sample(&self) -> Option<f64> {
        match (self.status_code, self.cost_ms) {
            (Some(SUCCESS_STATUS), Some(cost)) => Some(cost),
            _ => None,
        }
    }
}

/// Valid cost samples collected during one phase, in completion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleSet(Vec<f64>);

impl SampleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the result's sample; returns whether anything was added.
    pub fn record(&mut self, result: &InvocationResult) -> bool {
        match result.sample() {
            Some(cost) => {
                self.0.push(cost);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }
}

impl From<Vec<f64>> for SampleSet {
    fn from(values: Vec<f64>) -> Self {
        Self(values)
    }
}

/// Wall-clock bounds of a measurement phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Phase of the cold/warm matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseKind {
    ColdStart,
    WarmStart,
}

impl PhaseKind {
    /// Prefix used for per-phase result files.
    pub fn file_prefix(&self) -> &'static str {
        match self {
            PhaseKind::ColdStart => "coldStart",
            PhaseKind::WarmStart => "warmStart",
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PhaseKind::ColdStart => "cold-start",
            PhaseKind::WarmStart => "warm-start",
        };
        f.write_str(label)
    }
}

/// Everything one driver run produced.
#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    pub samples: SampleSet,
    pub attempted: usize,
    pub batches: usize,
    pub window: PhaseWindow,
}

/// A statistic value returned by the log backend.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

impl FieldValue {
    /// Numeric-looking strings become numbers, everything else stays text.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().parse::<f64>() {
            Ok(n) if n.is_finite() => FieldValue::Number(n),
            _ => FieldValue::Text(raw.to_string()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => {
                write!(f, "{}", *n as i64)
            }
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<usize> for FieldValue {
    fn from(value: usize) -> Self {
        FieldValue::Number(value as f64)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

/// Field-keyed record in the order the backend returned the fields.
pub type FieldMap = IndexMap<String, FieldValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Scheduled,
    Running,
    Complete,
    Failed,
    Cancelled,
    Timeout,
    Unknown,
}

impl QueryStatus {
    pub fn from_backend(status: &str) -> Self {
        match status {
            "Scheduled" => QueryStatus::Scheduled,
            "Running" => QueryStatus::Running,
            "Complete" => QueryStatus::Complete,
            "Failed" => QueryStatus::Failed,
            "Cancelled" => QueryStatus::Cancelled,
            "Timeout" => QueryStatus::Timeout,
            _ => QueryStatus::Unknown,
        }
    }
}

/// One `get_query_results` answer: the job status plus raw field/value rows.
#[derive(Debug, Clone)]
pub struct QueryJob {
    pub status: QueryStatus,
    pub rows: Vec<Vec<(String, String)>>,
}

/// A flattened record destined for the result store.
///
/// Identity columns come first, then statistics in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultRow {
    pub fields: FieldMap,
}

impl ResultRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn extend(mut self, fields: &FieldMap) -> Self {
        for (k, v) in fields {
            self.fields.insert(k.clone(), v.clone());
        }
        self
    }
}
