//! Optional lookup of an add-on layer matching a function's runtime.
//!
//! The catalog is a plain HTTP endpoint returning the published layers of a vendor. A
//! failed lookup never stops a benchmark; the function is simply tested without the
//! extra configuration.

use anyhow::{Context, Result};
use reqwest::Client as ReqwestClient;
use serde::Deserialize;
use std::time::Duration;

const CATALOG_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct LayerCatalog {
    #[serde(default)]
    pub layers: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct CatalogEntry {
    #[serde(default)]
    pub latest_matching_version: Option<LayerVersion>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct LayerVersion {
    pub layer_version_arn: Option<String>,
    #[serde(default)]
    pub compatible_runtimes: Vec<String>,
}

impl LayerCatalog {
    /// ARN of the first layer whose latest version supports `runtime`.
    pub fn layer_for_runtime(&self, runtime: &str) -> Option<&str> {
        self.layers
            .iter()
            .filter_map(|entry| entry.latest_matching_version.as_ref())
            .find(|version| version.compatible_runtimes.iter().any(|r| r == runtime))
            .and_then(|version| version.layer_version_arn.as_deref())
    }
}

pub fn build_client() -> Result<ReqwestClient> {
    ReqwestClient::builder()
        .timeout(CATALOG_TIMEOUT)
        .build()
        .context("Failed to build HTTP client for the layer catalog")
}

pub async fn fetch_catalog(client: &ReqwestClient, url: &str) -> Result<LayerCatalog> {
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to reach layer catalog at {}", url))?
        .error_for_status()
        .with_context(|| format!("Layer catalog at {} returned an error", url))?;
    response
        .json::<LayerCatalog>()
        .await
        .with_context(|| format!("Layer catalog at {} returned an unexpected body", url))
}

/// Looks up the catalog layer for `runtime`, logging and swallowing every failure.
pub async fn find_layer(client: &ReqwestClient, url: &str, runtime: &str) -> Option<String> {
    let catalog = match fetch_catalog(client, url).await {
        Ok(catalog) => catalog,
        Err(e) => {
            tracing::warn!(%url, error = %format!("{:#}", e), "Layer catalog lookup failed");
            return None;
        }
    };
    match catalog.layer_for_runtime(runtime) {
        Some(arn) => {
            tracing::info!(%runtime, layer = %arn, "Found catalog layer");
            Some(arn.to_string())
        }
        None => {
            tracing::warn!(%runtime, "No compatible catalog layer");
            None
        }
    }
}
