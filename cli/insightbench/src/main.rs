use insightbench::{
    aws_setup,
    benchmark::{run_matrix, run_single, MatrixPlan, RunConfig, VerifyConfig},
    config::{self, MatrixOverrides, Target},
    console::parse_tz_offset,
    insights::{self, PollConfig},
    lambda::UpdatePolicy,
    report,
    types::CostMetric,
};

use anyhow::{anyhow, bail, Context, Result};
use clap::{crate_authors, crate_description, CommandFactory, Parser, Subcommand};
use clap_complete::generate;
use clap_complete::Shell as ClapShell;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

const DEFAULT_CHURN_KEY: &str = "INSIGHTBENCH_COLD_START_COUNTER";

const USAGE_EXAMPLES: &str = "\
EXAMPLES:
    # Drive 10 concurrent invocations for 60 seconds and append the statistics to a CSV
    insightbench run my-function -c 10 -d 60 -o ./results/steady.csv

    # Same, then cross-check against CloudWatch Logs Insights once the logs have settled
    insightbench run my-function -c 10 -d 60 --verify --settle 120

    # Cold and warm phases for two functions, one of them under two layer versions
    insightbench matrix -f orders-api=arn:aws:lambda:us-east-1:123456789012:layer:Ext:7,none -f billing --html

    # Matrix from a TOML file, warm phase only
    insightbench matrix --config matrix.toml --disable-cold-start

    # Render every CSV in a directory as HTML
    insightbench report -d ./test-results";

#[derive(Parser)]
#[command(author = crate_authors!(", "), version, about = crate_description!(), long_about = None, after_help = USAGE_EXAMPLES)]
struct Args {
    /// Increase logging verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// AWS region to use
    #[arg(long, global = true, env = "AWS_REGION")]
    region: Option<String>,

    /// AWS profile to use
    #[arg(long, global = true, env = "AWS_PROFILE")]
    profile: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Measure one function under fixed concurrency for a fixed duration
    Run {
        /// Lambda function ARN or name
        function_name: String,

        /// Number of concurrent invocations per batch
        #[arg(short = 'c', long, default_value_t = 10)]
        concurrency: usize,

        /// Phase duration in seconds
        #[arg(short = 'd', long, default_value_t = 60)]
        duration: u64,

        /// CSV file to append the results to
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        /// What each sample measures
        #[arg(long, value_enum, default_value_t = CostMetric::Latency)]
        metric: CostMetric,

        /// JSON payload to send with each invocation
        #[arg(long, conflicts_with = "payload_file")]
        payload: Option<String>,

        /// JSON file containing the payload to send with each invocation
        #[arg(long = "payload-file", conflicts_with = "payload")]
        payload_file: Option<PathBuf>,

        /// Query CloudWatch Logs Insights for the phase window afterwards
        #[arg(long)]
        verify: bool,

        /// Seconds to wait for logs before querying
        #[arg(long, default_value_t = 60)]
        settle: u64,

        /// Seconds between query result polls
        #[arg(long = "poll-interval", default_value_t = 5)]
        poll_interval: u64,

        /// Maximum number of query result polls
        #[arg(long = "max-polls", default_value_t = 60)]
        max_polls: u32,

        /// Log group to query (defaults to /aws/lambda/<function>)
        #[arg(long = "log-group")]
        log_group: Option<String>,

        /// UTC offset used to print the phase window, e.g. +05:30
        #[arg(long = "tz-offset", default_value = "+00:00")]
        tz_offset: String,
    },

    /// Cold and warm phases for every function and layer configuration
    Matrix {
        /// TOML file with [defaults] and [functions.<name>] tables
        #[arg(long)]
        config: Option<PathBuf>,

        /// Target as NAME or NAME=LAYER_ARN[,LAYER_ARN...] (repeatable; "none" means no layers)
        #[arg(short = 'f', long = "function")]
        functions: Vec<Target>,

        /// Directory for the per-phase CSV files
        #[arg(long = "csv-path", default_value = "./test-results")]
        csv_path: PathBuf,

        /// Render the CSV files as HTML when done
        #[arg(long)]
        html: bool,

        #[arg(long = "disable-cold-start")]
        disable_cold_start: bool,

        #[arg(long = "disable-warm-start")]
        disable_warm_start: bool,

        /// Layer catalog endpoint used to add a runtime-compatible layer per function
        #[arg(long = "layer-catalog-url", env = "INSIGHTBENCH_LAYER_CATALOG_URL")]
        layer_catalog_url: Option<String>,

        /// Skip the layer catalog lookup even when a URL is configured
        #[arg(long = "disable-catalog-layer")]
        disable_catalog_layer: bool,

        /// Concurrent invocations per batch (overrides the file)
        #[arg(short = 'c', long)]
        concurrency: Option<usize>,

        /// Seconds per phase (overrides the file)
        #[arg(short = 'd', long)]
        duration: Option<u64>,

        /// Seconds to wait for logs after each phase (overrides the file)
        #[arg(long)]
        settle: Option<u64>,

        /// Seconds between query result polls
        #[arg(long = "poll-interval", default_value_t = 1)]
        poll_interval: u64,

        /// Maximum number of query result polls
        #[arg(long = "max-polls", default_value_t = 600)]
        max_polls: u32,

        /// Milliseconds to pause between batches
        #[arg(long = "batch-pause", default_value_t = 1000)]
        batch_pause_ms: u64,

        /// Remove existing CSV files in the csv directory first
        #[arg(long)]
        clean: bool,

        /// Environment variable rewritten to force cold starts
        #[arg(long = "churn-key", default_value = DEFAULT_CHURN_KEY)]
        churn_key: String,

        /// What each sample measures
        #[arg(long, value_enum, default_value_t = CostMetric::Latency)]
        metric: CostMetric,

        /// UTC offset used to print phase windows, e.g. +05:30
        #[arg(long = "tz-offset", default_value = "+00:00")]
        tz_offset: String,
    },

    /// Render CSV results as HTML tables
    Report {
        /// Directory containing CSV results
        #[arg(short = 'd', long = "dir", required = true)]
        input_dir: PathBuf,
    },

    /// Generate shell completion script
    #[command(name = "generate-completions", hide = true)]
    GenerateCompletions {
        /// Shell for which to generate completions
        #[arg(value_enum)]
        shell: ClapShell,
    },
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("\n❌ Error: {}", err);

        let mut chain = err.chain().skip(1).peekable();
        if chain.peek().is_some() {
            eprintln!("\nCaused by:");
            for (i, cause) in chain.enumerate() {
                eprintln!("  {}: {}", i, cause);
            }
        }
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let log_level = match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let filter = match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.is_empty() => EnvFilter::new(directives),
        _ => EnvFilter::builder()
            .with_default_directive(LevelFilter::WARN.into())
            .parse_lossy(format!("{}={}", env!("CARGO_CRATE_NAME"), log_level)),
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn read_payload(payload: Option<String>, payload_file: Option<PathBuf>) -> Result<Arc<[u8]>> {
    let payload = match payload_file {
        Some(file) => Some(
            fs::read_to_string(&file)
                .with_context(|| format!("Failed to read payload file: {}", file.display()))?,
        ),
        None => payload,
    };
    let body = payload.unwrap_or_else(|| "{}".to_string());
    serde_json::from_str::<serde_json::Value>(&body).context("Invalid JSON payload")?;
    Ok(Arc::from(body.into_bytes()))
}

async fn run() -> Result<()> {
    let args = Args::parse();

    let command = match args.command {
        Commands::GenerateCompletions { shell } => {
            let mut cmd = Args::command();
            let bin_name = cmd.get_name().to_string();
            generate(shell, &mut cmd, bin_name, &mut std::io::stdout());
            return Ok(());
        }
        command => command,
    };

    init_logging(args.verbose);

    match command {
        Commands::Run {
            function_name,
            concurrency,
            duration,
            output,
            metric,
            payload,
            payload_file,
            verify,
            settle,
            poll_interval,
            max_polls,
            log_group,
            tz_offset,
        } => {
            if concurrency == 0 {
                bail!("--concurrency must be at least 1");
            }
            if duration == 0 {
                bail!("--duration must be at least 1 second");
            }
            let tz_offset = parse_tz_offset(&tz_offset)?;
            let payload = read_payload(payload, payload_file)?;

            let sdk_config = aws_setup::load_config(args.region, args.profile).await;
            let (lambda, logs) = aws_setup::clients(&sdk_config);

            let verify = verify.then(|| VerifyConfig {
                settle: Duration::from_secs(settle),
                poll: PollConfig {
                    interval: Duration::from_secs(poll_interval),
                    max_polls,
                    ..PollConfig::single_phase()
                },
                log_group: log_group.unwrap_or_else(|| insights::log_group_for(&function_name)),
            });
            let config = RunConfig {
                function_name,
                concurrency,
                duration: Duration::from_secs(duration),
                metric,
                payload,
                output,
                verify,
                tz_offset,
            };
            run_single(Arc::new(lambda), Arc::new(logs), &config).await?;
        }

        Commands::Matrix {
            config: config_path,
            functions,
            csv_path,
            html,
            disable_cold_start,
            disable_warm_start,
            layer_catalog_url,
            disable_catalog_layer,
            concurrency,
            duration,
            settle,
            poll_interval,
            max_polls,
            batch_pause_ms,
            clean,
            churn_key,
            metric,
            tz_offset,
        } => {
            if disable_cold_start && disable_warm_start {
                bail!("Both cold start and warm start are disabled; at least one must be enabled");
            }
            let tz_offset = parse_tz_offset(&tz_offset)?;
            let file = config_path
                .as_deref()
                .map(config::load_matrix_file)
                .transpose()?;
            let matrix = config::resolve(
                file,
                MatrixOverrides {
                    concurrency,
                    duration_secs: duration,
                    settle_secs: settle,
                    targets: functions,
                },
            )?;
            tracing::debug!(?matrix, "Resolved matrix");

            let sdk_config = aws_setup::load_config(args.region, args.profile).await;
            let (lambda, logs) = aws_setup::clients(&sdk_config);

            let plan = MatrixPlan {
                concurrency: matrix.concurrency,
                duration: matrix.duration,
                settle: matrix.settle,
                batch_pause: Duration::from_millis(batch_pause_ms),
                metric,
                payload: Arc::from(&b"{}"[..]),
                poll: PollConfig {
                    interval: Duration::from_secs(poll_interval),
                    max_polls,
                    ..PollConfig::multi_phase()
                },
                csv_dir: csv_path,
                cold_start: !disable_cold_start,
                warm_start: !disable_warm_start,
                churn_key,
                update_policy: UpdatePolicy::default(),
                catalog_url: layer_catalog_url.filter(|_| !disable_catalog_layer),
                tz_offset,
            };
            let summary = run_matrix(
                Arc::new(lambda),
                Arc::new(logs),
                matrix.targets,
                plan,
                clean,
                html,
            )
            .await?;
            if !summary.failures.is_empty() {
                tracing::warn!(failures = summary.failures.len(), "Some targets did not complete");
            }
        }

        Commands::Report { input_dir } => {
            if !input_dir.is_dir() {
                return Err(anyhow!("{} is not a directory", input_dir.display()));
            }
            let written = report::render_directory(&input_dir)?;
            println!(
                "Rendered {} HTML report(s) in {}",
                written.len(),
                input_dir.join("html_files").display()
            );
        }

        Commands::GenerateCompletions { .. } => {}
    }

    Ok(())
}
