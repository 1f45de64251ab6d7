//! Assembles the deployable stack from synth settings.

use crate::conf::SynthSettings;
use crate::construct::{Code, HandlerConfig, QueueConfig, S3EventHandlerConstruct, S3EventHandlerProps};
use crate::notify::{EventType, NotificationKeyFilter};
use crate::template::Stack;
use anyhow::{anyhow, Context, Result};
use std::num::NonZeroU32;
use tracing::info;

/// Build the construct described by the settings, subscribe it, and
/// declare it in a stack together with its outputs.
pub fn stack(settings: &SynthSettings) -> Result<Stack> {
    let max_receive_count = NonZeroU32::new(settings.max_receive_count)
        .ok_or_else(|| anyhow!("MAX_RECEIVE_COUNT must be at least 1"))?;
    let event: EventType = settings
        .subscribe_event
        .parse()
        .context("Invalid SUBSCRIBE_EVENT")?;

    let mut construct = S3EventHandlerConstruct::new(S3EventHandlerProps {
        id: settings.construct_id.clone(),
        handler: HandlerConfig::new(
            settings.handler_runtime.clone(),
            Code::S3 {
                bucket: settings.handler_code_bucket.clone(),
                key: settings.handler_code_key.clone(),
                object_version: None,
            },
            settings.handler_entry.clone(),
        ),
        queue: QueueConfig {
            max_receive_count,
            batch_size: settings.batch_size,
            report_batch_item_failures: settings.report_batch_item_failures,
            ..QueueConfig::default()
        },
    });

    let filters: Vec<NotificationKeyFilter> = settings
        .subscribe_prefixes
        .iter()
        .map(NotificationKeyFilter::prefix)
        .chain(settings.subscribe_suffixes.iter().map(NotificationKeyFilter::suffix))
        .collect();
    if !filters.is_empty() {
        construct.subscribe(event, &filters);
    }
    info!(
        "Declared construct {} with {} subscriptions",
        construct.id(),
        construct.subscriptions().len()
    );

    let mut stack = Stack::new(settings.stack_name.clone());
    stack.add(&construct)?;
    stack.add_output("S3EventHandlerName", construct.handler_name().clone())?;
    stack.add_output("S3EventHandlerArn", construct.handler_arn().clone())?;
    stack.add_output("BucketName", construct.bucket_name().clone())?;
    stack.add_output("BucketArn", construct.bucket_arn().clone())?;
    stack.add_output("QueueUrl", construct.queue_url().clone())?;
    Ok(stack)
}
