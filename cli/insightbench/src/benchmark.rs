//! Phase orchestration: the single-phase `run` command and the cold/warm matrix.
//!
//! Every matrix target gets its own worker task. Workers return their results by value
//! and share nothing except the console lock and the progress display.

use crate::catalog;
use crate::config::{self, Target};
use crate::console;
use crate::driver::{self, PhasePlan, Reinit};
use crate::insights::{self, LogsApi, PollConfig, QueryOutcome, QueryTemplate};
use crate::lambda::{self, LambdaApi, UpdatePolicy};
use crate::report;
use crate::sink;
use crate::stats::{self, SampleStats};
use crate::types::{CostMetric, FieldMap, FieldValue, PhaseKind, PhaseOutcome, ResultRow};
use anyhow::{anyhow, Context, Result};
use chrono::FixedOffset;
use colored::*;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use reqwest::Client as ReqwestClient;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Settings of the single-phase `run` command.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub function_name: String,
    pub concurrency: usize,
    pub duration: Duration,
    pub metric: CostMetric,
    pub payload: Arc<[u8]>,
    pub output: Option<PathBuf>,
    pub verify: Option<VerifyConfig>,
    pub tz_offset: FixedOffset,
}

/// Log-query cross-check performed after a single phase.
#[derive(Debug, Clone)]
pub struct VerifyConfig {
    pub settle: Duration,
    pub poll: PollConfig,
    pub log_group: String,
}

#[derive(Debug)]
pub struct RunReport {
    pub outcome: PhaseOutcome,
    pub stats: Option<SampleStats>,
    pub backend: Option<QueryOutcome>,
}

/// Settings shared by every worker of a matrix run.
#[derive(Debug, Clone)]
pub struct MatrixPlan {
    pub concurrency: usize,
    pub duration: Duration,
    pub settle: Duration,
    pub batch_pause: Duration,
    pub metric: CostMetric,
    pub payload: Arc<[u8]>,
    pub poll: PollConfig,
    pub csv_dir: PathBuf,
    pub cold_start: bool,
    pub warm_start: bool,
    pub churn_key: String,
    pub update_policy: UpdatePolicy,
    pub catalog_url: Option<String>,
    pub tz_offset: FixedOffset,
}

impl MatrixPlan {
    pub fn phases(&self) -> Vec<PhaseKind> {
        let mut phases = Vec::new();
        if self.cold_start {
            phases.push(PhaseKind::ColdStart);
        }
        if self.warm_start {
            phases.push(PhaseKind::WarmStart);
        }
        phases
    }
}

#[derive(Debug)]
pub struct PhaseReport {
    pub kind: PhaseKind,
    pub attempted: usize,
    pub samples: usize,
    pub stats: Option<SampleStats>,
    pub backend: QueryOutcome,
    /// File the row went to, `None` if the write failed.
    pub csv_path: Option<PathBuf>,
}

#[derive(Debug)]
pub struct ConfigurationReport {
    pub configuration: String,
    pub phases: Vec<PhaseReport>,
}

#[derive(Debug)]
pub struct FunctionReport {
    pub function_name: String,
    pub configurations: Vec<ConfigurationReport>,
}

#[derive(Debug, Default)]
pub struct MatrixSummary {
    pub reports: Vec<FunctionReport>,
    pub failures: Vec<(String, String)>,
}

type ConsoleLock = Arc<Mutex<()>>;

/// Prints under the console lock, with any live progress bars hidden meanwhile.
fn with_console<F: FnOnce()>(lock: &ConsoleLock, progress: Option<&MultiProgress>, print: F) {
    let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    match progress {
        Some(multi) => multi.suspend(print),
        None => print(),
    }
}

fn compute_stats(function_name: &str, phase: &str, outcome: &PhaseOutcome) -> Option<SampleStats> {
    match stats::compute(outcome.samples.as_slice()) {
        Ok(stats) => Some(stats),
        Err(e) => {
            tracing::warn!(function = %function_name, %phase, error = %e, "No client statistics");
            None
        }
    }
}

fn settle_bar(progress: Option<&MultiProgress>, label: &str, duration: Duration) -> ProgressBar {
    let bar = ProgressBar::new(duration.as_secs());
    let bar = match progress {
        Some(multi) => multi.add(bar),
        None => bar,
    };
    if let Ok(style) =
        ProgressStyle::default_bar().template("{spinner:.green} {msg} [{bar:30.cyan/blue}] {pos}/{len}s")
    {
        bar.set_style(style.progress_chars("#>-"));
    }
    bar.set_message(label.to_string());
    bar
}

/// Waits out the log ingestion delay, ticking `bar` once per second.
async fn settle(duration: Duration, bar: ProgressBar) {
    let whole = duration.as_secs();
    for _ in 0..whole {
        tokio::time::sleep(Duration::from_secs(1)).await;
        bar.inc(1);
    }
    let rest = duration - Duration::from_secs(whole);
    if !rest.is_zero() {
        tokio::time::sleep(rest).await;
    }
    bar.finish_and_clear();
}

fn stat_value(stats: Option<&SampleStats>, pick: fn(&SampleStats) -> f64) -> FieldValue {
    match stats {
        Some(stats) => FieldValue::Number(pick(stats)),
        None => FieldValue::Text(String::new()),
    }
}

/// Appends every field `template` produces, empty where the query returned nothing.
///
/// Fields outside the template follow in backend order.
fn with_backend(row: ResultRow, template: QueryTemplate, backend: Option<&FieldMap>) -> ResultRow {
    let row = template.field_names().iter().fold(row, |row, name| {
        let value = backend
            .and_then(|fields| fields.get(*name))
            .cloned()
            .unwrap_or_else(|| FieldValue::Text(String::new()));
        row.with(*name, value)
    });
    match backend {
        Some(fields) => row.extend(fields),
        None => row,
    }
}

/// Row layout of the single-phase result file.
///
/// `template` is the query run for verification, if any.
pub fn single_phase_row(
    concurrency: usize,
    outcome: &PhaseOutcome,
    stats: Option<&SampleStats>,
    template: Option<QueryTemplate>,
    backend: Option<&FieldMap>,
) -> ResultRow {
    let row = ResultRow::new()
        .with("ConcurrentUsers", concurrency)
        .with("Attempted", outcome.attempted)
        .with("Samples", outcome.samples.len())
        .with("AvgResponseTime", stat_value(stats, |s| s.mean))
        .with("Median", stat_value(stats, |s| s.median))
        .with("P50", stat_value(stats, |s| s.p50))
        .with("P95", stat_value(stats, |s| s.p95))
        .with("P99", stat_value(stats, |s| s.p99));
    match template {
        Some(template) => with_backend(row, template, backend),
        None => row,
    }
}

/// Row layout of the per-configuration matrix files.
pub fn matrix_row(
    function_name: &str,
    configuration: &str,
    kind: PhaseKind,
    outcome: &PhaseOutcome,
    stats: Option<&SampleStats>,
    backend: Option<&FieldMap>,
) -> ResultRow {
    let row = ResultRow::new()
        .with("FunctionName", function_name)
        .with("Configuration", configuration)
        .with("Phase", kind.to_string())
        .with("Attempted", outcome.attempted)
        .with("Samples", outcome.samples.len())
        .with("ClientMean", stat_value(stats, |s| s.mean))
        .with("ClientMedian", stat_value(stats, |s| s.median))
        .with("ClientP50", stat_value(stats, |s| s.p50))
        .with("ClientP95", stat_value(stats, |s| s.p95))
        .with("ClientP99", stat_value(stats, |s| s.p99));
    with_backend(row, QueryTemplate::for_phase(kind), backend)
}

fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

/// `<prefix>_<function>_<suffix>.csv` inside `dir`.
pub fn matrix_csv_path(dir: &Path, kind: PhaseKind, function_name: &str, configuration: &str) -> PathBuf {
    dir.join(format!(
        "{}_{}_{}.csv",
        kind.file_prefix(),
        file_safe(function_name),
        file_safe(config::config_suffix(configuration))
    ))
}

/// Runs one steady phase, optionally checks it against the function's logs, and stores
/// one row.
pub async fn run_single(
    lambda: Arc<dyn LambdaApi>,
    logs: Arc<dyn LogsApi>,
    config: &RunConfig,
) -> Result<RunReport> {
    let plan = PhasePlan::new(config.concurrency, config.duration, config.metric);
    println!(
        "{} {} with {} concurrent invocations for {}s",
        "Running".bold(),
        config.function_name.bright_white().bold(),
        config.concurrency,
        config.duration.as_secs()
    );

    let outcome = driver::run_phase(
        lambda,
        &config.function_name,
        Arc::clone(&config.payload),
        &plan,
    )
    .await?;
    let stats = compute_stats(&config.function_name, "steady", &outcome);

    console::print_window("Invocation window", &outcome.window, &config.tz_offset);
    console::print_phase_results(
        &config.function_name,
        config.metric,
        &outcome,
        stats.as_ref(),
    );

    let backend = match &config.verify {
        Some(verify) => {
            let bar = settle_bar(None, "Waiting for logs", verify.settle);
            settle(verify.settle, bar).await;
            let result = insights::query_phase(
                logs.as_ref(),
                &verify.log_group,
                &outcome.window,
                QueryTemplate::AllInvocations,
                &verify.poll,
            )
            .await;
            console::print_backend_results("Log Insights statistics", result.first_row());
            Some(result)
        }
        None => None,
    };

    if let Some(path) = &config.output {
        let row = single_phase_row(
            config.concurrency,
            &outcome,
            stats.as_ref(),
            config.verify.as_ref().map(|_| QueryTemplate::AllInvocations),
            backend.as_ref().and_then(|b| b.first_row()),
        );
        if let Err(e) = sink::append_rows(path, &[row]) {
            tracing::error!(path = %path.display(), error = %format!("{:#}", e), "Failed to save results");
        }
    }

    Ok(RunReport {
        outcome,
        stats,
        backend,
    })
}

#[allow(clippy::too_many_arguments)]
async fn run_matrix_phase(
    lambda: Arc<dyn LambdaApi>,
    logs: &dyn LogsApi,
    function_name: &str,
    configuration: &str,
    kind: PhaseKind,
    plan: &MatrixPlan,
    progress: Option<&MultiProgress>,
    console_lock: &ConsoleLock,
) -> Result<PhaseReport> {
    let mut phase_plan = PhasePlan::new(plan.concurrency, plan.duration, plan.metric);
    phase_plan.batch_pause = plan.batch_pause;
    if kind == PhaseKind::ColdStart {
        phase_plan.reinit = Some(Reinit {
            key: plan.churn_key.clone(),
            policy: plan.update_policy.clone(),
        });
    }

    tracing::info!(function = %function_name, %configuration, phase = %kind, "Starting phase");
    let outcome = driver::run_phase(lambda, function_name, Arc::clone(&plan.payload), &phase_plan).await?;
    let stats = compute_stats(function_name, &kind.to_string(), &outcome);

    let title = format!("{} | {} | {}", function_name, configuration, kind);
    with_console(console_lock, progress, || {
        console::print_window(&title, &outcome.window, &plan.tz_offset);
        console::print_phase_results(&title, plan.metric, &outcome, stats.as_ref());
    });

    let bar = settle_bar(progress, &format!("{} settling", title), plan.settle);
    settle(plan.settle, bar).await;

    let backend = insights::query_phase(
        logs,
        &insights::log_group_for(function_name),
        &outcome.window,
        QueryTemplate::for_phase(kind),
        &plan.poll,
    )
    .await;
    with_console(console_lock, progress, || {
        console::print_backend_results(&format!("{} | log statistics", title), backend.first_row());
    });

    let row = matrix_row(
        function_name,
        configuration,
        kind,
        &outcome,
        stats.as_ref(),
        backend.first_row(),
    );
    let path = matrix_csv_path(&plan.csv_dir, kind, function_name, configuration);
    let csv_path = match sink::append_rows(&path, &[row]) {
        Ok(_) => Some(path),
        Err(e) => {
            tracing::error!(path = %path.display(), error = %format!("{:#}", e), "Failed to save results");
            None
        }
    };

    Ok(PhaseReport {
        kind,
        attempted: outcome.attempted,
        samples: outcome.samples.len(),
        stats,
        backend,
        csv_path,
    })
}

/// Runs every configuration and enabled phase of one function, strictly in order.
///
/// A failed configuration change aborts the remaining work for this function only.
pub async fn run_target(
    lambda: Arc<dyn LambdaApi>,
    logs: Arc<dyn LogsApi>,
    catalog_client: Option<ReqwestClient>,
    target: Target,
    plan: &MatrixPlan,
    progress: Option<&MultiProgress>,
    console_lock: &ConsoleLock,
) -> Result<FunctionReport> {
    let function_name = target.function_name;
    let mut configurations = target.configurations;

    if let (Some(client), Some(url)) = (catalog_client.as_ref(), plan.catalog_url.as_deref()) {
        let settings = lambda
            .get_settings(&function_name)
            .await
            .with_context(|| format!("Failed to read configuration of '{}'", function_name))?;
        match settings.runtime.as_deref() {
            Some(runtime) => {
                if let Some(layer) = catalog::find_layer(client, url, runtime).await {
                    configurations.push(layer);
                }
            }
            None => tracing::warn!(function = %function_name, "No runtime reported, skipping catalog lookup"),
        }
    }
    if configurations.is_empty() {
        configurations.push(config::NO_LAYER.to_string());
    }

    let mut report = FunctionReport {
        function_name: function_name.clone(),
        configurations: Vec::new(),
    };
    for configuration in configurations {
        lambda::apply_layers(
            lambda.as_ref(),
            &function_name,
            &config::layers_for(&configuration),
            &plan.update_policy,
        )
        .await
        .with_context(|| format!("Failed to apply configuration '{}'", configuration))?;

        let mut phases = Vec::new();
        for kind in plan.phases() {
            phases.push(
                run_matrix_phase(
                    Arc::clone(&lambda),
                    logs.as_ref(),
                    &function_name,
                    &configuration,
                    kind,
                    plan,
                    progress,
                    console_lock,
                )
                .await?,
            );
        }
        report.configurations.push(ConfigurationReport {
            configuration,
            phases,
        });
    }
    Ok(report)
}

/// Runs all targets concurrently, one worker each, and prints a summary.
///
/// Worker failures are collected rather than returned.
pub async fn run_matrix(
    lambda: Arc<dyn LambdaApi>,
    logs: Arc<dyn LogsApi>,
    targets: Vec<Target>,
    plan: MatrixPlan,
    clean: bool,
    html: bool,
) -> Result<MatrixSummary> {
    if plan.phases().is_empty() {
        return Err(anyhow!("At least one of cold start or warm start must be enabled"));
    }
    if clean {
        let removed = sink::clean_csv_dir(&plan.csv_dir)?;
        tracing::info!(dir = %plan.csv_dir.display(), removed, "Removed previous results");
    }
    let catalog_client = match plan.catalog_url {
        Some(_) => Some(catalog::build_client()?),
        None => None,
    };

    let total = targets.len();
    println!(
        "Benchmarking {} function(s): cold start {}, warm start {}",
        total,
        if plan.cold_start { "enabled".green() } else { "disabled".yellow() },
        if plan.warm_start { "enabled".green() } else { "disabled".yellow() },
    );

    let plan = Arc::new(plan);
    let progress = MultiProgress::new();
    let console_lock: ConsoleLock = Arc::new(Mutex::new(()));
    let mut workers = Vec::new();
    for target in targets {
        let lambda = Arc::clone(&lambda);
        let logs = Arc::clone(&logs);
        let catalog_client = catalog_client.clone();
        let plan = Arc::clone(&plan);
        let progress = progress.clone();
        let console_lock = Arc::clone(&console_lock);
        workers.push(tokio::spawn(async move {
            let function_name = target.function_name.clone();
            let result = run_target(
                lambda,
                logs,
                catalog_client,
                target,
                &plan,
                Some(&progress),
                &console_lock,
            )
            .await;
            (function_name, result)
        }));
    }

    let mut summary = MatrixSummary::default();
    for joined in futures::future::join_all(workers).await {
        match joined {
            Ok((function_name, Ok(report))) => {
                tracing::debug!(function = %function_name, "Worker finished");
                summary.reports.push(report);
            }
            Ok((function_name, Err(e))) => {
                tracing::error!(function = %function_name, error = %format!("{:#}", e), "Worker failed");
                summary.failures.push((function_name, format!("{:#}", e)));
            }
            Err(e) => {
                tracing::error!(error = %e, "Worker task aborted");
                summary.failures.push(("<task>".to_string(), e.to_string()));
            }
        }
    }

    print_summary(&summary, total);

    if html {
        let written = report::render_directory(&plan.csv_dir)?;
        println!("Rendered {} HTML report(s) in {}", written.len(), plan.csv_dir.join("html_files").display());
    }
    Ok(summary)
}

fn print_summary(summary: &MatrixSummary, total: usize) {
    println!("\n--- Benchmark Summary ---");
    for report in &summary.reports {
        let phases: usize = report.configurations.iter().map(|c| c.phases.len()).sum();
        let unsaved = report
            .configurations
            .iter()
            .flat_map(|c| c.phases.iter())
            .filter(|p| p.csv_path.is_none())
            .count();
        if unsaved == 0 {
            println!("  ✅ {}: {} phase(s) recorded", report.function_name, phases);
        } else {
            println!(
                "  ⚠️  {}: {} phase(s) run, {} not saved",
                report.function_name, phases, unsaved
            );
        }
    }
    for (function_name, error) in &summary.failures {
        eprintln!("  ❌ {}: Failed - {}", function_name, error);
    }
    println!("-------------------------");
    println!(
        "Total: {}, Successes: {}, Failures: {}",
        total,
        summary.reports.len(),
        summary.failures.len()
    );
}
