//! Defines the global SQS client.

use anyhow::{anyhow, Result};
use aws_config::{from_env, SdkConfig};
use aws_sdk_sqs::config::Region;
use aws_sdk_sqs::Client;
use once_cell::sync::OnceCell;
use std::env;

/// Normalize an endpoint override, defaulting its scheme to https.
fn endpoint_url(endpoint: String) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint
    } else {
        format!("https://{}", endpoint)
    }
}

/// Load the AWS configuration from the environment, honoring an
/// `AWS_ENDPOINT_URL` override.
pub async fn aws_service_config() -> SdkConfig {
    if let Ok(endpoint) = env::var("AWS_ENDPOINT_URL") {
        from_env()
            .endpoint_url(endpoint_url(endpoint))
            .region(Region::new("us-east-1")) // should be OK since the endpoint was overridden
            .load()
            .await
    } else {
        from_env().load().await
    }
}

/// Global SQS client instance.
static CURRENT: OnceCell<Client> = OnceCell::new();

/// Initialize the global SQS client.
pub async fn init() -> Result<()> {
    let client = Client::new(&aws_service_config().await);
    CURRENT
        .set(client)
        .map_err(|_| anyhow!("client::CURRENT was already initialized"))
}

/// Get the current SQS client instance, or panic if it hasn't been
/// initialized.
pub fn current() -> &'static Client {
    CURRENT.get().expect("client is not initialized")
}
