//! Defines configuration as read from the environment.

use anyhow::{bail, Result};
use serde::Deserialize;

/// What to do with a queue message that couldn't be processed.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Log the failure and consider the message processed. It won't
    /// be redelivered nor dead-lettered.
    #[default]
    Swallow,

    /// Report the message as a batch item failure, so that the queue
    /// redelivers it and eventually moves it to the dead-letter
    /// queue.
    Report,
}

/// The dispatcher settings, given as environment variables.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Settings {
    /// Policy applied to messages whose body isn't an S3 event.
    #[serde(default)]
    pub parse_failure_policy: FailurePolicy,

    /// Policy applied to messages for which the record handler
    /// failed.
    #[serde(default)]
    pub handler_failure_policy: FailurePolicy,
}

/// Default `sqs_visibility_timeout` value.
fn default_visibility_timeout() -> i32 {
    30
}

/// Default `sqs_max_number_of_messages` value.
fn default_max_number_of_messages() -> i32 {
    10
}

/// Settings for the standalone queue consumer.
#[derive(Clone, Debug, Deserialize)]
pub struct ConsumerSettings {
    /// The URL of the queue holding S3 event notifications.
    pub sqs_queue_url: String,

    /// Seconds received messages stay hidden from other consumers.
    #[serde(default = "default_visibility_timeout")]
    pub sqs_visibility_timeout: i32,

    /// Maximum amount of messages received per poll (1 to 10).
    #[serde(default = "default_max_number_of_messages")]
    pub sqs_max_number_of_messages: i32,
}

impl ConsumerSettings {
    /// Reject values the queue would refuse on every poll.
    pub fn validate(&self) -> Result<()> {
        if !(1..=10).contains(&self.sqs_max_number_of_messages) {
            bail!(
                "SQS_MAX_NUMBER_OF_MESSAGES must be between 1 and 10, got {}",
                self.sqs_max_number_of_messages
            );
        }
        if self.sqs_visibility_timeout < 0 {
            bail!(
                "SQS_VISIBILITY_TIMEOUT can't be negative, got {}",
                self.sqs_visibility_timeout
            );
        }
        Ok(())
    }
}

/// Default `stack_name` value.
fn default_stack_name() -> String {
    String::from("S3EventHandlerStack")
}

/// Default `construct_id` value.
fn default_construct_id() -> String {
    String::from("S3EventHandler")
}

/// Default `handler_runtime` value.
fn default_handler_runtime() -> String {
    String::from("provided.al2")
}

/// Default `handler_entry` value.
fn default_handler_entry() -> String {
    String::from("bootstrap")
}

/// Default `max_receive_count` value.
fn default_max_receive_count() -> u32 {
    1
}

/// Default `subscribe_event` value.
fn default_subscribe_event() -> String {
    String::from("s3:ObjectCreated:Put")
}

/// Settings used to synthesize the infrastructure template.
#[derive(Clone, Debug, Deserialize)]
pub struct SynthSettings {
    /// Name of the stack, used as the template description.
    #[serde(default = "default_stack_name")]
    pub stack_name: String,

    /// Identifier of the construct, prefixing the bucket and queue
    /// names.
    #[serde(default = "default_construct_id")]
    pub construct_id: String,

    /// Lambda runtime identifier of the handler function.
    #[serde(default = "default_handler_runtime")]
    pub handler_runtime: String,

    /// Entry point of the handler function.
    #[serde(default = "default_handler_entry")]
    pub handler_entry: String,

    /// Bucket holding the deployment package.
    pub handler_code_bucket: String,

    /// Key of the deployment package.
    pub handler_code_key: String,

    /// Deliveries attempted before a message is dead-lettered.
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,

    /// Maximum amount of messages given to a single invocation.
    #[serde(default)]
    pub batch_size: Option<u32>,

    /// Whether the function reports partial batch failures.
    #[serde(default)]
    pub report_batch_item_failures: bool,

    /// Event type of the subscriptions, e.g. `s3:ObjectCreated:Put`.
    #[serde(default = "default_subscribe_event")]
    pub subscribe_event: String,

    /// Key prefixes to subscribe to, one subscription each. If both
    /// these and the suffixes are empty, no subscription is made.
    #[serde(default)]
    pub subscribe_prefixes: Vec<String>,

    /// Key suffixes to subscribe to, one subscription each.
    #[serde(default)]
    pub subscribe_suffixes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatcher_settings_default_to_swallowing() {
        let settings: Settings = envy::from_iter(Vec::<(String, String)>::new()).unwrap();
        assert_eq!(settings.parse_failure_policy, FailurePolicy::Swallow);
        assert_eq!(settings.handler_failure_policy, FailurePolicy::Swallow);
    }

    #[test]
    fn dispatcher_settings_read_policies() {
        let settings: Settings = envy::from_iter(vec![
            (String::from("PARSE_FAILURE_POLICY"), String::from("report")),
            (String::from("HANDLER_FAILURE_POLICY"), String::from("swallow")),
        ])
        .unwrap();
        assert_eq!(settings.parse_failure_policy, FailurePolicy::Report);
        assert_eq!(settings.handler_failure_policy, FailurePolicy::Swallow);
    }

    #[test]
    fn synth_settings_split_lists() {
        let settings: SynthSettings = envy::from_iter(vec![
            (String::from("HANDLER_CODE_BUCKET"), String::from("artifacts")),
            (String::from("HANDLER_CODE_KEY"), String::from("handler.zip")),
            (
                String::from("SUBSCRIBE_PREFIXES"),
                String::from("path/auditable,path/other"),
            ),
        ])
        .unwrap();
        assert_eq!(settings.handler_runtime, "provided.al2");
        assert_eq!(settings.max_receive_count, 1);
        assert_eq!(
            settings.subscribe_prefixes,
            vec![String::from("path/auditable"), String::from("path/other")]
        );
        assert!(settings.subscribe_suffixes.is_empty());
    }

    fn consumer_settings(pairs: &[(&str, &str)]) -> ConsumerSettings {
        let mut vars = vec![(String::from("SQS_QUEUE_URL"), String::from("http://queue"))];
        vars.extend(
            pairs
                .iter()
                .map(|(k, v)| (String::from(*k), String::from(*v))),
        );
        envy::from_iter(vars).unwrap()
    }

    #[test]
    fn consumer_settings_defaults_are_valid() {
        let settings = consumer_settings(&[]);
        assert_eq!(settings.sqs_max_number_of_messages, 10);
        assert_eq!(settings.sqs_visibility_timeout, 30);
        assert!(settings.validate().is_ok());
        assert!(consumer_settings(&[("SQS_MAX_NUMBER_OF_MESSAGES", "1")])
            .validate()
            .is_ok());
    }

    #[test]
    fn consumer_settings_reject_out_of_range_values() {
        for count in ["0", "11", "-1"] {
            assert!(consumer_settings(&[("SQS_MAX_NUMBER_OF_MESSAGES", count)])
                .validate()
                .is_err());
        }
        assert!(consumer_settings(&[("SQS_VISIBILITY_TIMEOUT", "-5")])
            .validate()
            .is_err());
    }
}
