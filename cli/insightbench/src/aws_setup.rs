//! AWS configuration loading and client construction.

use crate::insights::AwsLogs;
use crate::lambda::AwsLambda;
use aws_config::meta::region::RegionProviderChain;
use aws_config::SdkConfig;
use aws_sdk_cloudwatchlogs::Client as CwlClient;
use aws_sdk_lambda::Client as LambdaClient;

const FALLBACK_REGION: &str = "us-east-1";

/// Loads the shared SDK config: explicit region first, then the default chain.
pub async fn load_config(region: Option<String>, profile: Option<String>) -> SdkConfig {
    let region_provider = RegionProviderChain::first_try(region.map(aws_config::Region::new))
        .or_default_provider()
        .or_else(aws_config::Region::new(FALLBACK_REGION));

    let mut loader =
        aws_config::defaults(aws_config::BehaviorVersion::latest()).region(region_provider);
    if let Some(profile) = profile {
        loader = loader.profile_name(profile);
    }

    let config = loader.load().await;
    tracing::debug!(region = ?config.region(), "Loaded AWS config");
    config
}

pub fn clients(config: &SdkConfig) -> (AwsLambda, AwsLogs) {
    (
        AwsLambda::new(LambdaClient::new(config)),
        AwsLogs::new(CwlClient::new(config)),
    )
}
