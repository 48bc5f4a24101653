//! Fixed-window concurrency driver.
//!
//! Launches `concurrency` invocations at once, waits for the whole batch, and repeats
//! while the phase's wall-clock budget has not run out. The budget is checked only
//! between batches, so the last batch may finish after the deadline.

use crate::lambda::{self, LambdaApi, UpdatePolicy};
use crate::types::{CostMetric, PhaseOutcome, PhaseWindow, SampleSet};
use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Forces a fresh execution environment before every batch.
#[derive(Debug, Clone)]
pub struct Reinit {
    /// Environment variable rewritten with the batch counter.
    pub key: String,
    pub policy: UpdatePolicy,
}

#[derive(Debug, Clone)]
pub struct PhasePlan {
    pub concurrency: usize,
    pub duration: Duration,
    pub metric: CostMetric,
    /// Idle time between one batch's barrier and the next launch.
    pub batch_pause: Duration,
    pub reinit: Option<Reinit>,
}

impl PhasePlan {
    pub fn new(concurrency: usize, duration: Duration, metric: CostMetric) -> Self {
        Self {
            concurrency,
            duration,
            metric,
            batch_pause: Duration::ZERO,
            reinit: None,
        }
    }
}

/// Runs one measurement phase against `function_name`.
///
/// Only a failed reinitialization aborts the phase; per-call failures just contribute no
/// sample.
pub async fn run_phase(
    api: Arc<dyn LambdaApi>,
    function_name: &str,
    payload: Arc<[u8]>,
    plan: &PhasePlan,
) -> Result<PhaseOutcome> {
    let concurrency = plan.concurrency.max(1);
    let mut samples = SampleSet::new();
    let mut attempted = 0usize;
    let mut batches = 0usize;

    tracing::debug!(
        function = %function_name,
        concurrency,
        duration_secs = plan.duration.as_secs_f64(),
        reinit = plan.reinit.is_some(),
        "Starting phase"
    );

    let start = Utc::now();
    let started = Instant::now();
    while started.elapsed() < plan.duration {
        if let Some(reinit) = &plan.reinit {
            lambda::force_cold_start(
                api.as_ref(),
                function_name,
                &reinit.key,
                batches,
                &reinit.policy,
            )
            .await
            .with_context(|| format!("Failed to reinitialize '{}'", function_name))?;
        }

        let handles: Vec<_> = (0..concurrency)
            .map(|_| {
                let api = Arc::clone(&api);
                let function_name = function_name.to_string();
                let payload = Arc::clone(&payload);
                let metric = plan.metric;
                tokio::spawn(async move {
                    lambda::invoke_function(api.as_ref(), &function_name, &payload, metric).await
                })
            })
            .collect();

        let mut valid = 0usize;
        for joined in futures::future::join_all(handles).await {
            match joined {
                Ok(result) => {
                    if samples.record(&result) {
                        valid += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(function = %function_name, error = %e, "Invocation task aborted");
                }
            }
        }
        attempted += concurrency;
        batches += 1;
        tracing::trace!(function = %function_name, batch = batches, valid, "Batch complete");

        if !plan.batch_pause.is_zero() && started.elapsed() < plan.duration {
            tokio::time::sleep(plan.batch_pause).await;
        }
    }
    let end = Utc::now();

    tracing::debug!(
        function = %function_name,
        batches,
        attempted,
        samples = samples.len(),
        "Phase complete"
    );

    Ok(PhaseOutcome {
        samples,
        attempted,
        batches,
        window: PhaseWindow { start, end },
    })
}
