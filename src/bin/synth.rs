use anyhow::{Context, Result};
use envy::from_env;
use s3_event_handler::conf::SynthSettings;
use s3_event_handler::synth;

/// Print the CloudFormation template declaring the S3 event handler
/// stack. Deploying it is left to CloudFormation itself.
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
    let settings: SynthSettings = from_env().context("Invalid synth settings")?;

    let stack = synth::stack(&settings)?;
    let template = serde_json::to_string_pretty(&stack.template())
        .with_context(|| format!("Failed to render stack {:?}", stack.name()))?;
    println!("{}", template);
    Ok(())
}
