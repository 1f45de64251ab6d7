use anyhow::{anyhow, Result};
use lambda_runtime::{run, service_fn};
use s3_event_handler::app;

/// Run an AWS Lambda function that listens to SQS events containing
/// S3 events, and hands each S3 event record to the record handler.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .without_time()
        .init();
    app::init()?;

    run(service_fn(|event| app::current().dispatcher.handle(event)))
        .await
        .map_err(|e| anyhow!("{:?}", e))
}
