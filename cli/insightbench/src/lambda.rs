use crate::types::{CostMetric, InvocationResult};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use aws_sdk_lambda::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_lambda::primitives::Blob;
use aws_sdk_lambda::types::{Environment, InvocationType, LogType};
use aws_sdk_lambda::Client as LambdaClient;
use base64::Engine;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::time::Instant;

/// Raw answer of a synchronous invocation.
#[derive(Debug, Clone, Default)]
pub struct InvokeResponse {
    pub status_code: i32,
    pub function_error: Option<String>,
    /// Base64-encoded tail of the execution log, present when requested.
    pub log_result: Option<String>,
}

/// The parts of a function's configuration the harness reads or rewrites.
#[derive(Debug, Clone, Default)]
pub struct FunctionSettings {
    pub runtime: Option<String>,
    pub environment: HashMap<String, String>,
    pub layers: Vec<String>,
    pub last_update_status: Option<String>,
}

/// Remote calls against the function platform.
#[async_trait]
pub trait LambdaApi: Send + Sync {
    async fn invoke(
        &self,
        function_name: &str,
        payload: &[u8],
        tail_logs: bool,
    ) -> Result<InvokeResponse>;

    async fn get_settings(&self, function_name: &str) -> Result<FunctionSettings>;

    /// Replaces the function's environment with `variables`.
    async fn put_environment(
        &self,
        function_name: &str,
        variables: HashMap<String, String>,
    ) -> Result<()>;

    /// Replaces the function's layer list with `layers`.
    async fn put_layers(&self, function_name: &str, layers: Vec<String>) -> Result<()>;
}

/// [`LambdaApi`] backed by the AWS SDK.
#[derive(Clone)]
pub struct AwsLambda {
    client: LambdaClient,
}

impl AwsLambda {
    pub fn new(client: LambdaClient) -> Self {
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
impl LambdaApi for AwsLambda {
    async fn invoke(
        &self,
        function_name: &str,
        payload: &[u8],
        tail_logs: bool,
    ) -> Result<InvokeResponse> {
        let mut req = self
            .client
            .invoke()
            .function_name(function_name)
            .invocation_type(InvocationType::RequestResponse)
            .payload(Blob::new(payload));
        if tail_logs {
            req = req.log_type(LogType::Tail);
        }
        let output = req
            .send()
            .await
            .map_err(|err| anyhow!("Failed to invoke function: {}", describe_sdk_error(err)))?;
        Ok(InvokeResponse {
            status_code: output.status_code(),
            function_error: output.function_error().map(str::to_string),
            log_result: output.log_result().map(str::to_string),
        })
    }

    async fn get_settings(&self, function_name: &str) -> Result<FunctionSettings> {
        let config = self
            .client
            .get_function_configuration()
            .function_name(function_name)
            .send()
            .await
            .map_err(|err| {
                anyhow!(
                    "Error getting configuration for '{}': {}",
                    function_name,
                    describe_sdk_error(err)
                )
            })?;
        Ok(FunctionSettings {
            runtime: config.runtime().map(|r| r.as_str().to_string()),
            environment: config
                .environment()
                .and_then(|e| e.variables())
                .map(|vars| vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default(),
            layers: config
                .layers()
                .iter()
                .filter_map(|layer| layer.arn().map(str::to_string))
                .collect(),
            last_update_status: config.last_update_status().map(|s| s.as_str().to_string()),
        })
    }

    async fn put_environment(
        &self,
        function_name: &str,
        variables: HashMap<String, String>,
    ) -> Result<()> {
        self.client
            .update_function_configuration()
            .function_name(function_name)
            .environment(Environment::builder().set_variables(Some(variables)).build())
            .send()
            .await
            .map_err(|err| {
                anyhow!(
                    "Failed to update function configuration: {}",
                    describe_sdk_error(err)
                )
            })?;
        Ok(())
    }

    async fn put_layers(&self, function_name: &str, layers: Vec<String>) -> Result<()> {
        self.client
            .update_function_configuration()
            .function_name(function_name)
            .set_layers(Some(layers))
            .send()
            .await
            .map_err(|err| {
                anyhow!(
                    "Failed to update function layers: {}",
                    describe_sdk_error(err)
                )
            })?;
        Ok(())
    }
}

/// Performs one synchronous invocation and reduces it to an [`InvocationResult`].
///
/// Never fails: transport and remote errors are logged and become a result with both
/// fields absent, so one bad call cannot abort a concurrent batch.
pub async fn invoke_function(
    api: &dyn LambdaApi,
    function_name: &str,
    payload: &[u8],
    metric: CostMetric,
) -> InvocationResult {
    let tail_logs = metric == CostMetric::Billed;
    let start = Instant::now();
    let response = match api.invoke(function_name, payload, tail_logs).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(function = %function_name, error = %e, "Invocation failed");
            return InvocationResult::failed();
        }
    };
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

    if let Some(func_error) = &response.function_error {
        tracing::warn!(
            function = %function_name,
            status = response.status_code,
            error_type = %func_error,
            "Function returned an error"
        );
        return InvocationResult {
            status_code: Some(response.status_code),
            cost_ms: None,
        };
    }

    let cost_ms = match metric {
        CostMetric::Latency => Some(elapsed_ms),
        CostMetric::Billed => {
            let billed = response
                .log_result
                .as_deref()
                .and_then(decode_log_tail)
                .and_then(|logs| extract_billed_duration(&logs));
            if billed.is_none() {
                tracing::debug!(function = %function_name, "No billed duration in log tail");
            }
            billed
        }
    };
    tracing::trace!(function = %function_name, status = response.status_code, ?cost_ms, "Invocation complete");

    InvocationResult::new(response.status_code, cost_ms)
}

fn decode_log_tail(encoded: &str) -> Option<String> {
    match base64::engine::general_purpose::STANDARD.decode(encoded) {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) => {
            tracing::debug!(error = %e, "Log tail is not valid base64");
            None
        }
    }
}

fn billed_duration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"Billed Duration: (\d+(?:\.\d+)?) ms|"billedDurationMs"\s*:\s*(\d+(?:\.\d+)?)"#)
            .unwrap()
    })
}

/// Pulls the billed duration out of a REPORT line, in either the text or the JSON log format.
///
/// The last occurrence wins, since the tail may hold more than one report.
pub fn extract_billed_duration(logs: &str) -> Option<f64> {
    billed_duration_regex()
        .captures_iter(logs)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .filter_map(|m| m.as_str().parse::<f64>().ok())
        .last()
}

/// Polls the function until a pending configuration update has settled.
pub async fn wait_for_update(
    api: &dyn LambdaApi,
    function_name: &str,
    interval: Duration,
    max_attempts: u32,
) -> Result<()> {
    for attempt in 1..=max_attempts {
        let settings = api.get_settings(function_name).await?;
        match settings.last_update_status.as_deref() {
            Some("InProgress") => {
                tracing::trace!(function = %function_name, attempt, "Configuration update in progress");
            }
            Some("Failed") => bail!("Configuration update failed for '{}'", function_name),
            _ => return Ok(()),
        }
        if attempt < max_attempts {
            tokio::time::sleep(interval).await;
        }
    }
    bail!(
        "Configuration update for '{}' did not settle after {} checks",
        function_name,
        max_attempts
    )
}

/// Settings for the read-modify-write calls that change a function's configuration.
#[derive(Debug, Clone)]
pub struct UpdatePolicy {
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_polls: 60,
        }
    }
}

/// Sets one environment variable, keeping the others, so the next call lands on a fresh
/// execution environment.
///
/// Read-modify-write; concurrent updates of the same function are not supported.
pub async fn force_cold_start(
    api: &dyn LambdaApi,
    function_name: &str,
    key: &str,
    counter: usize,
    policy: &UpdatePolicy,
) -> Result<()> {
    let mut environment = api.get_settings(function_name).await?.environment;
    environment.insert(key.to_string(), counter.to_string());
    api.put_environment(function_name, environment).await?;
    tracing::debug!(function = %function_name, %key, counter, "Environment churned");
    wait_for_update(api, function_name, policy.poll_interval, policy.max_polls).await
}

/// Replaces the function's layers and waits for the update to settle.
pub async fn apply_layers(
    api: &dyn LambdaApi,
    function_name: &str,
    layers: &[String],
    policy: &UpdatePolicy,
) -> Result<()> {
    api.put_layers(function_name, layers.to_vec()).await?;
    tracing::info!(function = %function_name, ?layers, "Layers updated");
    wait_for_update(api, function_name, policy.poll_interval, policy.max_polls).await
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scriptable in-memory function platform.
    pub struct FakeLambda {
        pub latency: Duration,
        pub status_code: i32,
        pub fail_every: Option<usize>,
        pub log_tail: Option<String>,
        pub calls: AtomicUsize,
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
        pub settings: Mutex<FunctionSettings>,
        pub env_updates: AtomicUsize,
        pub fail_updates: bool,
    }

    impl FakeLambda {
        pub fn new(latency: Duration) -> Self {
            Self {
                latency,
                status_code: 200,
                fail_every: None,
                log_tail: None,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                settings: Mutex::new(FunctionSettings {
                    runtime: Some("python3.12".to_string()),
                    ..Default::default()
                }),
                env_updates: AtomicUsize::new(0),
                fail_updates: false,
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LambdaApi for FakeLambda {
        async fn invoke(
            &self,
            _function_name: &str,
            _payload: &[u8],
            _tail_logs: bool,
        ) -> Result<InvokeResponse> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.fail_every.is_some_and(|n| call % n == 0) {
                bail!("throttled");
            }
            Ok(InvokeResponse {
                status_code: self.status_code,
                function_error: None,
                log_result: self.log_tail.clone(),
            })
        }

        async fn get_settings(&self, _function_name: &str) -> Result<FunctionSettings> {
            Ok(self.settings.lock().unwrap().clone())
        }

        async fn put_environment(
            &self,
            _function_name: &str,
            variables: HashMap<String, String>,
        ) -> Result<()> {
            if self.fail_updates {
                bail!("AccessDenied");
            }
            self.env_updates.fetch_add(1, Ordering::SeqCst);
            self.settings.lock().unwrap().environment = variables;
            Ok(())
        }

        async fn put_layers(&self, _function_name: &str, layers: Vec<String>) -> Result<()> {
            if self.fail_updates {
                bail!("AccessDenied");
            }
            self.settings.lock().unwrap().layers = layers;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeLambda;
    use super::*;

    fn encode(text: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(text)
    }

    #[test]
    fn test_extract_billed_duration_text_report() {
        let logs = "START RequestId: abc Version: $LATEST\n\
                    END RequestId: abc\n\
                    REPORT RequestId: abc\tDuration: 12.34 ms\tBilled Duration: 13 ms\tMemory Size: 128 MB\tMax Memory Used: 40 MB";
        assert_eq!(extract_billed_duration(logs), Some(13.0));
    }

    #[test]
    fn test_extract_billed_duration_json_report() {
        let logs = r#"{"time":"2024-01-01T00:00:00.000Z","type":"platform.report","record":{"metrics":{"durationMs":1.5,"billedDurationMs":2,"memorySizeMB":128,"maxMemoryUsedMB":30}}}"#;
        assert_eq!(extract_billed_duration(logs), Some(2.0));
    }

    #[test]
    fn test_extract_billed_duration_absent() {
        assert_eq!(extract_billed_duration("END RequestId: abc"), None);
        assert_eq!(extract_billed_duration(""), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoke_function_latency_metric() {
        let fake = FakeLambda::new(Duration::from_millis(100));
        let result = invoke_function(&fake, "fn", b"{}", CostMetric::Latency).await;
        assert_eq!(result.status_code, Some(200));
        let cost = result.cost_ms.unwrap();
        assert!((cost - 100.0).abs() < 1.0, "unexpected latency {}", cost);
    }

    #[tokio::test]
    async fn test_invoke_function_billed_metric() {
        let mut fake = FakeLambda::new(Duration::ZERO);
        fake.log_tail = Some(encode("REPORT RequestId: x\tBilled Duration: 101 ms\t"));
        let result = invoke_function(&fake, "fn", b"{}", CostMetric::Billed).await;
        assert_eq!(result.sample(), Some(101.0));
    }

    #[tokio::test]
    async fn test_invoke_function_billed_metric_without_report() {
        let mut fake = FakeLambda::new(Duration::ZERO);
        fake.log_tail = Some(encode("just some output"));
        let result = invoke_function(&fake, "fn", b"{}", CostMetric::Billed).await;
        assert_eq!(result.status_code, Some(200));
        assert_eq!(result.cost_ms, None);
        assert_eq!(result.sample(), None);
    }

    #[tokio::test]
    async fn test_invoke_function_swallows_errors() {
        let mut fake = FakeLambda::new(Duration::ZERO);
        fake.fail_every = Some(1);
        let result = invoke_function(&fake, "fn", b"{}", CostMetric::Latency).await;
        assert_eq!(result, InvocationResult::failed());
    }

    #[tokio::test]
    async fn test_force_cold_start_merges_environment() {
        let fake = FakeLambda::new(Duration::ZERO);
        fake.settings
            .lock()
            .unwrap()
            .environment
            .insert("EXISTING".to_string(), "keep".to_string());

        force_cold_start(&fake, "fn", "CHURN", 7, &UpdatePolicy::default())
            .await
            .unwrap();

        let settings = fake.settings.lock().unwrap().clone();
        assert_eq!(settings.environment.get("EXISTING").unwrap(), "keep");
        assert_eq!(settings.environment.get("CHURN").unwrap(), "7");
    }

    #[tokio::test]
    async fn test_force_cold_start_propagates_update_failure() {
        let mut fake = FakeLambda::new(Duration::ZERO);
        fake.fail_updates = true;
        let result = force_cold_start(&fake, "fn", "CHURN", 1, &UpdatePolicy::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_update_gives_up() {
        let fake = FakeLambda::new(Duration::ZERO);
        fake.settings.lock().unwrap().last_update_status = Some("InProgress".to_string());
        let result = wait_for_update(&fake, "fn", Duration::from_secs(1), 3).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_apply_layers_replaces_list() {
        let fake = FakeLambda::new(Duration::ZERO);
        let layers = vec!["arn:aws:lambda:us-east-1:1:layer:Ext:3".to_string()];
        apply_layers(&fake, "fn", &layers, &UpdatePolicy::default())
            .await
            .unwrap();
        assert_eq!(fake.settings.lock().unwrap().layers, layers);
    }
}
