//! Authoritative statistics from CloudWatch Logs Insights.
//!
//! A query is submitted for the phase window, then polled on a fixed interval until the
//! backend reports a terminal status or the poll budget runs out. None of the failure
//! paths raise: they all end in a [`QueryOutcome`] without rows, which callers treat as
//! "no authoritative statistics available".

use crate::types::{FieldMap, FieldValue, PhaseKind, PhaseWindow, QueryJob, QueryStatus};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use aws_sdk_cloudwatchlogs::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_cloudwatchlogs::Client as CwlClient;
use chrono::Duration as ChronoDuration;
use std::time::Duration;

/// Upper bound on log records a query scans.
pub const QUERY_ROW_LIMIT: usize = 10_000;

/// Log-analytics backend.
#[async_trait]
pub trait LogsApi: Send + Sync {
    async fn start_query(
        &self,
        log_group: &str,
        start_ms: i64,
        end_ms: i64,
        query: &str,
    ) -> Result<String>;

    async fn get_query_results(&self, query_id: &str) -> Result<QueryJob>;
}

/// [`LogsApi`] backed by the AWS SDK.
#[derive(Clone)]
pub struct AwsLogs {
    client: CwlClient,
}

impl AwsLogs {
    pub fn new(client: CwlClient) -> Self {
        Self { client }
    }
}

fn describe_sdk_error<E, R>(err: SdkError<E, R>) -> String
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    match err {
        SdkError::ServiceError(context) => format!(
            "Service error: {} ({})",
            context.err().message().unwrap_or_default(),
            context.err().code().unwrap_or_default()
        ),
        other_err => format!("SDK error: {}", other_err),
    }
}

#[async_trait]
impl LogsApi for AwsLogs {
    async fn start_query(
        &self,
        log_group: &str,
        start_ms: i64,
        end_ms: i64,
        query: &str,
    ) -> Result<String> {
        // StartQuery takes epoch seconds; round outward so the window is never narrowed.
        let start_secs = start_ms.div_euclid(1000);
        let end_secs = (end_ms + 999).div_euclid(1000);
        let output = self
            .client
            .start_query()
            .log_group_name(log_group)
            .start_time(start_secs)
            .end_time(end_secs)
            .query_string(query)
            .limit(QUERY_ROW_LIMIT as i32)
            .send()
            .await
            .map_err(|err| anyhow!("Failed to start query: {}", describe_sdk_error(err)))?;
        output
            .query_id()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("StartQuery returned no query id"))
    }

    async fn get_query_results(&self, query_id: &str) -> Result<QueryJob> {
        let output = self
            .client
            .get_query_results()
            .query_id(query_id)
            .send()
            .await
            .map_err(|err| {
                anyhow!(
                    "Failed to get query results: {}",
                    describe_sdk_error(err)
                )
            })?;
        let status = output
            .status()
            .map(|s| QueryStatus::from_backend(s.as_str()))
            .unwrap_or(QueryStatus::Unknown);
        let rows = output
            .results()
            .iter()
            .map(|row| {
                row.iter()
                    .filter_map(|cell| {
                        Some((cell.field()?.to_string(), cell.value()?.to_string()))
                    })
                    .collect()
            })
            .collect();
        Ok(QueryJob { status, rows })
    }
}

/// Aggregation over the REPORT lines of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryTemplate {
    /// Only invocations that carried an init phase.
    ColdStart,
    /// Every invocation in the window.
    AllInvocations,
}

impl QueryTemplate {
    pub fn for_phase(kind: PhaseKind) -> Self {
        match kind {
            PhaseKind::ColdStart => QueryTemplate::ColdStart,
            PhaseKind::WarmStart => QueryTemplate::AllInvocations,
        }
    }

    /// Result fields the `stats` clause produces, in output order.
    pub fn field_names(&self) -> &'static [&'static str] {
        const BILLED: [&str; 7] = [
            "totalInvocations",
            "avgBilledDuration",
            "minBilledDuration",
            "maxBilledDuration",
            "p50BilledDuration",
            "p95BilledDuration",
            "p99BilledDuration",
        ];
        const COLD: [&str; 11] = [
            "coldStartCount",
            "p50Init",
            "p90Init",
            "p99Init",
            BILLED[0],
            BILLED[1],
            BILLED[2],
            BILLED[3],
            BILLED[4],
            BILLED[5],
            BILLED[6],
        ];
        match self {
            QueryTemplate::ColdStart => &COLD,
            QueryTemplate::AllInvocations => &BILLED,
        }
    }

    pub fn query_string(&self) -> String {
        let billed_stats = "count(@billedDuration) as totalInvocations,\n    \
             avg(@billedDuration) as avgBilledDuration,\n    \
             min(@billedDuration) as minBilledDuration,\n    \
             max(@billedDuration) as maxBilledDuration,\n    \
             pct(@billedDuration, 50) as p50BilledDuration,\n    \
             pct(@billedDuration, 95) as p95BilledDuration,\n    \
             pct(@billedDuration, 99) as p99BilledDuration";
        match self {
            QueryTemplate::ColdStart => format!(
                "fields @timestamp, @requestId, @initDuration, @billedDuration, @duration, @memorySize\n\
                 | filter @type = \"REPORT\"\n\
                 | filter ispresent(@initDuration)\n\
                 | sort @timestamp asc\n\
                 | limit {limit}\n\
                 | stats\n    \
                 count(@initDuration) as coldStartCount,\n    \
                 pct(@initDuration, 50) as p50Init,\n    \
                 pct(@initDuration, 90) as p90Init,\n    \
                 pct(@initDuration, 99) as p99Init,\n    \
                 {billed_stats}",
                limit = QUERY_ROW_LIMIT,
            ),
            QueryTemplate::AllInvocations => format!(
                "fields @timestamp, @requestId, @billedDuration, @duration, @memorySize\n\
                 | filter @type = \"REPORT\"\n\
                 | sort @timestamp asc\n\
                 | limit {limit}\n\
                 | stats\n    \
                 {billed_stats}",
                limit = QUERY_ROW_LIMIT,
            ),
        }
    }
}

/// Default log group a function writes to.
pub fn log_group_for(function_name: &str) -> String {
    // Accept full ARNs as function identifiers.
    let name = function_name
        .strip_prefix("arn:")
        .and_then(|_| function_name.split(':').nth(6))
        .unwrap_or(function_name);
    format!("/aws/lambda/{}", name)
}

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    /// Number of result fetches before giving up.
    pub max_polls: u32,
    /// Widening applied to both ends of the phase window.
    pub skew: Duration,
}

impl PollConfig {
    /// Single-phase verification: every 5 seconds, 60 polls.
    pub fn single_phase() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_polls: 60,
            skew: Duration::from_secs(1),
        }
    }

    /// Multi-phase orchestrator: every second.
    pub fn multi_phase() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_polls: 600,
            skew: Duration::from_secs(1),
        }
    }
}

/// Terminal state of one query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Complete(Vec<FieldMap>),
    /// Completed but matched nothing.
    Empty,
    Failed,
    Cancelled,
    TimedOut,
    /// Submission or a poll hit a transport error.
    Error(String),
}

impl QueryOutcome {
    /// Parsed rows; empty for every non-success outcome.
    pub fn rows(&self) -> &[FieldMap] {
        match self {
            QueryOutcome::Complete(rows) => rows,
            _ => &[],
        }
    }

    /// First row, which is the whole answer for a `stats` query.
    pub fn first_row(&self) -> Option<&FieldMap> {
        self.rows().first()
    }
}

/// Converts the window to the millisecond bounds sent to the backend.
pub fn window_bounds_ms(window: &PhaseWindow, skew: Duration) -> (i64, i64) {
    let skew = ChronoDuration::from_std(skew).unwrap_or_else(|_| ChronoDuration::zero());
    (
        (window.start - skew).timestamp_millis(),
        (window.end + skew).timestamp_millis(),
    )
}

pub async fn submit(
    logs: &dyn LogsApi,
    log_group: &str,
    window: &PhaseWindow,
    template: QueryTemplate,
    config: &PollConfig,
) -> Result<String> {
    let (start_ms, end_ms) = window_bounds_ms(window, config.skew);
    let query_id = logs
        .start_query(log_group, start_ms, end_ms, &template.query_string())
        .await?;
    tracing::info!(%query_id, %log_group, start_ms, end_ms, "Query started");
    Ok(query_id)
}

fn parse_row(row: &[(String, String)]) -> FieldMap {
    row.iter()
        .map(|(field, value)| (field.clone(), FieldValue::parse(value)))
        .collect()
}

/// Polls `query_id` until it is terminal or `config.max_polls` fetches have been made.
///
/// The first fetch happens immediately; the interval is slept only between fetches.
pub async fn poll(logs: &dyn LogsApi, query_id: &str, config: &PollConfig) -> QueryOutcome {
    for attempt in 1..=config.max_polls {
        let job = match logs.get_query_results(query_id).await {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(%query_id, error = %e, "Error retrieving query results");
                return QueryOutcome::Error(e.to_string());
            }
        };

        match job.status {
            QueryStatus::Complete if job.rows.is_empty() => {
                tracing::warn!(%query_id, "Query complete with no results");
                return QueryOutcome::Empty;
            }
            QueryStatus::Complete => {
                tracing::info!(%query_id, rows = job.rows.len(), "Query complete");
                return QueryOutcome::Complete(job.rows.iter().map(|r| parse_row(r)).collect());
            }
            QueryStatus::Failed | QueryStatus::Timeout => {
                tracing::error!(%query_id, status = ?job.status, "Query failed");
                return QueryOutcome::Failed;
            }
            QueryStatus::Cancelled => {
                tracing::error!(%query_id, "Query cancelled");
                return QueryOutcome::Cancelled;
            }
            QueryStatus::Scheduled | QueryStatus::Running | QueryStatus::Unknown => {
                tracing::trace!(%query_id, attempt, status = ?job.status, "Query not finished");
            }
        }

        if attempt < config.max_polls {
            tokio::time::sleep(config.interval).await;
        }
    }

    tracing::error!(%query_id, polls = config.max_polls, "Query timed out waiting for results");
    QueryOutcome::TimedOut
}

/// Submits the phase query for `log_group` and waits for its outcome.
pub async fn query_phase(
    logs: &dyn LogsApi,
    log_group: &str,
    window: &PhaseWindow,
    template: QueryTemplate,
    config: &PollConfig,
) -> QueryOutcome {
    match submit(logs, log_group, window, template, config).await {
        Ok(query_id) => poll(logs, &query_id, config).await,
        Err(e) => {
            tracing::error!(%log_group, error = %e, "Failed to submit query");
            QueryOutcome::Error(e.to_string())
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{job, ScriptedLogs};
    use super::*;
    use chrono::{TimeZone, Utc};
    use tokio::time::Instant;

    fn config() -> PollConfig {
        PollConfig {
            interval: Duration::from_secs(5),
            max_polls: 60,
            skew: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_completes_after_three_retries() {
        let logs = ScriptedLogs::new(vec![
            Ok(job(QueryStatus::Running, vec![])),
            Ok(job(QueryStatus::Running, vec![])),
            Ok(job(QueryStatus::Running, vec![])),
            Ok(job(
                QueryStatus::Complete,
                vec![vec![("totalInvocations", "50"), ("avgBilledDuration", "12.5")]],
            )),
        ]);
        let started = Instant::now();

        let outcome = poll(&logs, "q-1", &config()).await;

        assert_eq!(logs.polls(), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(15));
        let row = outcome.first_row().expect("row");
        assert_eq!(row.get("totalInvocations"), Some(&FieldValue::Number(50.0)));
        assert_eq!(row.get("avgBilledDuration"), Some(&FieldValue::Number(12.5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out_after_budget() {
        let logs = ScriptedLogs::new(vec![Ok(job(QueryStatus::Running, vec![]))]);
        let started = Instant::now();

        let outcome = poll(&logs, "q-1", &config()).await;

        assert_eq!(outcome, QueryOutcome::TimedOut);
        assert_eq!(logs.polls(), 60);
        assert_eq!(started.elapsed(), Duration::from_secs(5 * 59));
        assert!(outcome.rows().is_empty());
    }

    #[tokio::test]
    async fn test_poll_complete_without_rows_is_empty() {
        let logs = ScriptedLogs::new(vec![Ok(job(QueryStatus::Complete, vec![]))]);
        let outcome = poll(&logs, "q-1", &config()).await;
        assert_eq!(outcome, QueryOutcome::Empty);
        assert!(outcome.first_row().is_none());
    }

    #[tokio::test]
    async fn test_poll_failed_and_cancelled_are_terminal() {
        let logs = ScriptedLogs::new(vec![Ok(job(QueryStatus::Failed, vec![]))]);
        assert_eq!(poll(&logs, "q-1", &config()).await, QueryOutcome::Failed);
        assert_eq!(logs.polls(), 1);

        let logs = ScriptedLogs::new(vec![Ok(job(QueryStatus::Cancelled, vec![]))]);
        assert_eq!(poll(&logs, "q-1", &config()).await, QueryOutcome::Cancelled);

        let logs = ScriptedLogs::new(vec![Ok(job(QueryStatus::Timeout, vec![]))]);
        assert_eq!(poll(&logs, "q-1", &config()).await, QueryOutcome::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_transport_error_stops_immediately() {
        let logs = ScriptedLogs::new(vec![
            Ok(job(QueryStatus::Running, vec![])),
            Err(anyhow!("connection reset")),
            Ok(job(QueryStatus::Complete, vec![vec![("x", "1")]])),
        ]);
        let outcome = poll(&logs, "q-1", &config()).await;
        assert!(matches!(outcome, QueryOutcome::Error(_)));
        assert_eq!(logs.polls(), 2);
    }

    #[tokio::test]
    async fn test_poll_keeps_text_values() {
        let logs = ScriptedLogs::new(vec![Ok(job(
            QueryStatus::Complete,
            vec![vec![("coldStartCount", "3"), ("note", "n/a")]],
        ))]);
        let outcome = poll(&logs, "q-1", &config()).await;
        let row = outcome.first_row().unwrap();
        assert_eq!(row.get("note"), Some(&FieldValue::Text("n/a".to_string())));
        assert_eq!(
            row.keys().collect::<Vec<_>>(),
            vec!["coldStartCount", "note"]
        );
    }

    #[tokio::test]
    async fn test_query_phase_submits_widened_window() {
        let logs = ScriptedLogs::new(vec![Ok(job(
            QueryStatus::Complete,
            vec![vec![("totalInvocations", "1")]],
        ))]);
        let window = PhaseWindow {
            start: Utc.timestamp_millis_opt(1_700_000_000_500).unwrap(),
            end: Utc.timestamp_millis_opt(1_700_000_060_250).unwrap(),
        };

        let outcome = query_phase(
            &logs,
            "/aws/lambda/fn",
            &window,
            QueryTemplate::ColdStart,
            &config(),
        )
        .await;

        assert!(matches!(outcome, QueryOutcome::Complete(_)));
        let submitted = logs.submitted.lock().unwrap();
        let (group, start_ms, end_ms, query) = &submitted[0];
        assert_eq!(group, "/aws/lambda/fn");
        assert_eq!(*start_ms, 1_699_999_999_500);
        assert_eq!(*end_ms, 1_700_000_061_250);
        assert!(query.contains("ispresent(@initDuration)"));
    }

    #[tokio::test]
    async fn test_query_phase_submit_failure() {
        let mut logs = ScriptedLogs::new(vec![]);
        logs.fail_submit = true;
        let window = PhaseWindow {
            start: Utc::now(),
            end: Utc::now(),
        };
        let outcome = query_phase(
            &logs,
            "/aws/lambda/fn",
            &window,
            QueryTemplate::AllInvocations,
            &config(),
        )
        .await;
        assert!(matches!(outcome, QueryOutcome::Error(_)));
        assert_eq!(logs.polls(), 0);
    }

    #[test]
    fn test_query_templates() {
        let cold = QueryTemplate::for_phase(PhaseKind::ColdStart).query_string();
        assert!(cold.contains("filter @type = \"REPORT\""));
        assert!(cold.contains("as coldStartCount"));
        assert!(cold.contains("limit 10000"));
        assert!(cold.contains("as p99BilledDuration"));

        let warm = QueryTemplate::for_phase(PhaseKind::WarmStart).query_string();
        assert!(!warm.contains("initDuration"));
        assert!(warm.contains("sort @timestamp asc"));
        assert!(warm.contains("as totalInvocations"));
    }

    #[test]
    fn test_field_names_match_stats_clause() {
        for template in [QueryTemplate::ColdStart, QueryTemplate::AllInvocations] {
            let query = template.query_string();
            let stats = &query[query.find("| stats").unwrap()..];
            let aliases: Vec<&str> = stats
                .split(" as ")
                .skip(1)
                .map(|rest| rest.split(',').next().unwrap().trim())
                .collect();
            assert_eq!(aliases, template.field_names());
        }
        assert_eq!(QueryTemplate::ColdStart.field_names()[0], "coldStartCount");
        assert_eq!(QueryTemplate::AllInvocations.field_names().len(), 7);
    }

    #[test]
    fn test_log_group_for() {
        assert_eq!(log_group_for("my-fn"), "/aws/lambda/my-fn");
        assert_eq!(
            log_group_for("arn:aws:lambda:us-east-1:123456789012:function:my-fn"),
            "/aws/lambda/my-fn"
        );
    }
}
