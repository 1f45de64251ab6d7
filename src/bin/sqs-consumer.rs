use anyhow::{Context, Result};
use aws_sdk_sqs::{types::DeleteMessageBatchRequestEntry, Client};
use core::time::Duration;
use envy::from_env;
use s3_event_handler::conf::ConsumerSettings;
use s3_event_handler::dispatch::Message;
use s3_event_handler::{app, client};
use tokio::time::sleep;
use tracing::{info, instrument, warn};

/// The minimum time to wait between ticks, in milliseconds.
const BASE_LAPSE_TIME: u64 = 300;

/// The base of the exponential backoff sequence.
const BACKOFF_BASE: u64 = 2;

/// The maximum amount of milliseconds to sleep between ticks. Set to
/// the equivalent of 20 minutes.
const MAX_SLEEP: u64 = 1200000;

/// Wrapper structure that executes successive SQS consumption cycles:
/// receive messages, dispatch their S3 events, and finally delete
/// the messages that weren't reported as failed.
struct SQSConsumer {
    settings: ConsumerSettings,
    client: &'static Client,
    backoff: u32,
}

impl SQSConsumer {
    /// Record a success and wait a little while.
    async fn pass(&mut self) {
        self.backoff = 0;
        sleep(Duration::from_millis(BASE_LAPSE_TIME)).await;
    }

    /// Record a failure and wait a while.
    async fn fail(&mut self) {
        sleep(Duration::from_millis(std::cmp::min(
            BASE_LAPSE_TIME.saturating_mul(BACKOFF_BASE.saturating_pow(self.backoff)),
            MAX_SLEEP,
        )))
        .await;
        self.backoff = self.backoff.saturating_add(1);
    }

    /// Perform a single pass of the SQS consumption cycle.
    #[instrument(skip(self))]
    pub async fn tick(&mut self) {
        let received = match self
            .client
            .receive_message()
            .queue_url(&self.settings.sqs_queue_url)
            .visibility_timeout(self.settings.sqs_visibility_timeout)
            .max_number_of_messages(self.settings.sqs_max_number_of_messages)
            .wait_time_seconds(20)
            .send()
            .await
        {
            Ok(received) => received,
            Err(e) => {
                warn!("Error while consuming messages from SQS queue: {:?}", e);
                return self.fail().await;
            }
        };

        let messages = received.messages().unwrap_or_default();
        if messages.is_empty() {
            return self.pass().await;
        }

        let messages: Vec<Message> = messages.iter().map(Message::from).collect();
        let dispatcher = &app::current().dispatcher;
        let report = dispatcher.dispatch(messages.clone()).await;
        let failed = report.failed_message_ids(dispatcher.settings()).len();
        if failed > 0 {
            warn!(
                "{} SQS messages failed and won't be deleted, so they can be redelivered",
                failed
            );
        }

        let entries: Vec<DeleteMessageBatchRequestEntry> = report
            .deletable(&messages, dispatcher.settings())
            .into_iter()
            .enumerate()
            .map(|(index, message)| {
                DeleteMessageBatchRequestEntry::builder()
                    .id(index.to_string())
                    .set_receipt_handle(message.receipt_handle.clone())
                    .build()
            })
            .collect();
        if entries.is_empty() {
            return self.pass().await;
        }

        info!("Deleting {} SQS messages", entries.len());
        let total = entries.len();
        let deleted = self
            .client
            .delete_message_batch()
            .queue_url(&self.settings.sqs_queue_url)
            .set_entries(Some(entries))
            .send()
            .await;
        match deleted {
            Err(e) => {
                warn!("Couldn't delete SQS messages: {:?}", e);
                return self.fail().await;
            }
            Ok(result) => {
                let failed = result.failed().unwrap_or_default().len();
                if failed > 0 {
                    warn!(
                        "Couldn't delete some SQS messages: {:?} out of {:?} weren't deleted",
                        failed, total
                    );
                }
            }
        }
        self.pass().await;
    }
}

/// Consume S3 events from an SQS queue outside of AWS Lambda, handing
/// each S3 event record to the record handler.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .without_time()
        .init();
    app::init()?;
    client::init().await?;
    let settings: ConsumerSettings = from_env().context("Invalid consumer settings")?;
    settings.validate()?;

    let mut consumer = SQSConsumer {
        settings,
        client: client::current(),
        backoff: 0,
    };

    // Listen for abort signals
    let (stop_processing, mut should_stop) = tokio::sync::oneshot::channel();
    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("CTRL-C");
        }
        let _ = stop_processing.send(());
    });

    // Continuously receive messages and dispatch the S3 events within
    loop {
        tokio::select! {
            _ = consumer.tick() => (),
            _ = &mut should_stop => break
        }
    }
    Ok(())
}
