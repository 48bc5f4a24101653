//! Loading and merging of the benchmark matrix.
//!
//! A matrix maps each target function to the list of layer configurations it is tested
//! under. It can come from a TOML file, from repeated `--function` flags, or both; for a
//! function named in both places the command line wins. Numeric settings follow the
//! precedence CLI > `[defaults]` > built-ins.

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Configuration name meaning "no add-on layers attached".
pub const NO_LAYER: &str = "none";

pub const DEFAULT_CONCURRENCY: usize = 1;
pub const DEFAULT_DURATION_SECS: u64 = 100;
pub const DEFAULT_SETTLE_SECS: u64 = 300;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct MatrixFile {
    #[serde(default)]
    pub defaults: Option<MatrixDefaults>,

    #[serde(default)]
    pub functions: IndexMap<String, FunctionEntry>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct MatrixDefaults {
    pub concurrency: Option<usize>,
    /// Seconds per phase.
    pub duration: Option<u64>,
    /// Seconds to wait before querying logs.
    pub settle: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct FunctionEntry {
    #[serde(default)]
    pub layers: Vec<String>,
}

/// One function and the configurations to test it under, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub function_name: String,
    pub configurations: Vec<String>,
}

impl FromStr for Target {
    type Err = String;

    /// Parses `NAME` or `NAME=ARN[,ARN...]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, layers) = match s.split_once('=') {
            Some((name, layers)) => (name.trim(), layers),
            None => (s.trim(), ""),
        };
        if name.is_empty() {
            return Err(format!("missing function name in '{}'", s));
        }
        let configurations = layers
            .split(',')
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        Ok(Target {
            function_name: name.to_string(),
            configurations,
        })
    }
}

/// Layer list applied for a configuration.
pub fn layers_for(configuration: &str) -> Vec<String> {
    if configuration == NO_LAYER {
        Vec::new()
    } else {
        vec![configuration.to_string()]
    }
}

/// Short configuration label used in file names: the layer version, or `none`.
pub fn config_suffix(configuration: &str) -> &str {
    configuration.rsplit(':').next().unwrap_or(configuration)
}

pub fn load_matrix_file(path: &Path) -> Result<MatrixFile> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read matrix file {}", path.display()))?;
    let parsed: MatrixFile = toml::from_str(&content)
        .with_context(|| format!("Failed to parse matrix file {}", path.display()))?;
    tracing::debug!(path = %path.display(), functions = parsed.functions.len(), "Loaded matrix file");
    Ok(parsed)
}

/// Command-line values that may override the file.
#[derive(Debug, Default, Clone)]
pub struct MatrixOverrides {
    pub concurrency: Option<usize>,
    pub duration_secs: Option<u64>,
    pub settle_secs: Option<u64>,
    pub targets: Vec<Target>,
}

/// Fully merged matrix settings.
#[derive(Debug, Clone)]
pub struct ResolvedMatrix {
    pub concurrency: usize,
    pub duration: Duration,
    pub settle: Duration,
    pub targets: Vec<Target>,
}

pub fn resolve(file: Option<MatrixFile>, overrides: MatrixOverrides) -> Result<ResolvedMatrix> {
    let file = file.unwrap_or_default();
    let defaults = file.defaults.unwrap_or_default();

    let concurrency = overrides
        .concurrency
        .or(defaults.concurrency)
        .unwrap_or(DEFAULT_CONCURRENCY);
    let duration_secs = overrides
        .duration_secs
        .or(defaults.duration)
        .unwrap_or(DEFAULT_DURATION_SECS);
    let settle_secs = overrides
        .settle_secs
        .or(defaults.settle)
        .unwrap_or(DEFAULT_SETTLE_SECS);

    if concurrency == 0 {
        bail!("Concurrency must be at least 1");
    }
    if duration_secs == 0 {
        bail!("Duration must be at least 1 second");
    }

    let mut merged: IndexMap<String, Vec<String>> = file
        .functions
        .into_iter()
        .map(|(name, entry)| (name, entry.layers))
        .collect();
    for target in overrides.targets {
        merged.insert(target.function_name, target.configurations);
    }
    if merged.is_empty() {
        bail!("No target functions: pass --function or a matrix file with a [functions] table");
    }

    let targets = merged
        .into_iter()
        .map(|(function_name, configurations)| Target {
            function_name,
            configurations,
        })
        .collect();

    Ok(ResolvedMatrix {
        concurrency,
        duration: Duration::from_secs(duration_secs),
        settle: Duration::from_secs(settle_secs),
        targets,
    })
}
