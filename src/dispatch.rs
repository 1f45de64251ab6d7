//! Defines the event dispatcher: it unwraps S3 events from queue
//! messages and feeds each event record to a record handler, keeping
//! the failure of one message from affecting the others.

use crate::conf::{FailurePolicy, Settings};
use anyhow::{anyhow, Context, Error, Result};
use aws_lambda_events::event::s3::S3EventRecord;
use aws_lambda_events::event::sqs::{BatchItemFailure, SqsBatchResponse, SqsEvent, SqsMessage};
use lambda_runtime::LambdaEvent;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, instrument};

/// A queue message, as far as the dispatcher is concerned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub body: Option<String>,

    /// Needed to delete the message once handled. Lambda deletes
    /// messages itself, so it may be absent there.
    pub receipt_handle: Option<String>,
}

impl Message {
    pub fn new(id: impl Into<String>, body: impl Into<String>) -> Self {
        Message {
            id: id.into(),
            body: Some(body.into()),
            receipt_handle: None,
        }
    }
}

impl From<SqsMessage> for Message {
    fn from(message: SqsMessage) -> Self {
        Message {
            id: message.message_id.unwrap_or_default(),
            body: message.body,
            receipt_handle: message.receipt_handle,
        }
    }
}

impl From<&aws_sdk_sqs::types::Message> for Message {
    fn from(message: &aws_sdk_sqs::types::Message) -> Self {
        Message {
            id: message.message_id().unwrap_or_default().to_string(),
            body: message.body().map(String::from),
            receipt_handle: message.receipt_handle().map(String::from),
        }
    }
}

/// One record of an S3 event, exactly as it arrived in the message
/// body.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeRecord {
    raw: Value,
}

impl ChangeRecord {
    pub fn new(raw: Value) -> Self {
        ChangeRecord { raw }
    }

    /// The record as received, including fields unknown to
    /// `S3EventRecord`.
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn into_raw(self) -> Value {
        self.raw
    }

    /// The event name, e.g. `ObjectCreated:Put`.
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("eventName").and_then(Value::as_str)
    }

    pub fn bucket(&self) -> Option<&str> {
        self.raw.pointer("/s3/bucket/name").and_then(Value::as_str)
    }

    /// The object key, still URL-encoded as S3 sends it.
    pub fn key(&self) -> Option<&str> {
        self.raw.pointer("/s3/object/key").and_then(Value::as_str)
    }

    /// A typed view of the record. Fails if the record lacks a field
    /// `S3EventRecord` requires; unknown fields are left out.
    pub fn typed(&self) -> Result<S3EventRecord> {
        S3EventRecord::deserialize(&self.raw).context("record is not a standard S3 event record")
    }
}

/// Processes a single S3 event record. Handlers may be invoked from
/// several tasks at once.
pub trait RecordHandler: Send + Sync + 'static {
    fn handle(&self, record: &ChangeRecord) -> Result<()>;
}

impl<F> RecordHandler for F
where
    F: Fn(&ChangeRecord) -> Result<()> + Send + Sync + 'static,
{
    fn handle(&self, record: &ChangeRecord) -> Result<()> {
        self(record)
    }
}

/// A handler that only logs the records it receives.
#[derive(Clone, Copy, Debug, Default)]
pub struct EchoHandler;

impl RecordHandler for EchoHandler {
    fn handle(&self, record: &ChangeRecord) -> Result<()> {
        info!("Processing S3 record {}", record.raw());
        Ok(())
    }
}

/// What happened to a single message.
#[derive(Debug)]
pub enum MessageOutcome {
    /// All the records in the message were handled.
    Handled { records: usize },

    /// The body wasn't an S3 event; no record was handled.
    Unparseable(Error),

    /// The handler failed on a record. The records before it were
    /// handled and the ones after it were skipped.
    HandlerFailed { handled: usize, error: Error },

    /// The task processing the message never completed, so it's
    /// unknown how many records were handled.
    Lost,
}

/// The outcome of a message, tagged with its id.
#[derive(Debug)]
pub struct MessageReport {
    pub message_id: String,
    pub outcome: MessageOutcome,
}

/// The outcomes of every message in a batch, in completion order.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub messages: Vec<MessageReport>,
}

impl DispatchReport {
    /// Ids of the messages that must be reported back to the queue as
    /// failed, according to the given policies. Lost messages follow
    /// the handler failure policy.
    pub fn failed_message_ids(&self, settings: &Settings) -> Vec<String> {
        self.messages
            .iter()
            .filter(|report| match report.outcome {
                MessageOutcome::Handled { .. } => false,
                MessageOutcome::Unparseable(_) => {
                    settings.parse_failure_policy == FailurePolicy::Report
                }
                MessageOutcome::HandlerFailed { .. } | MessageOutcome::Lost => {
                    settings.handler_failure_policy == FailurePolicy::Report
                }
            })
            .map(|report| report.message_id.clone())
            .collect()
    }

    /// The messages that can be deleted from the queue: those not
    /// reported as failed and carrying a receipt handle.
    pub fn deletable<'a>(&self, messages: &'a [Message], settings: &Settings) -> Vec<&'a Message> {
        let failed: HashSet<String> = self.failed_message_ids(settings).into_iter().collect();
        messages
            .iter()
            .filter(|message| message.receipt_handle.is_some() && !failed.contains(&message.id))
            .collect()
    }

    /// Total amount of records handled successfully.
    pub fn handled_records(&self) -> usize {
        self.messages
            .iter()
            .map(|report| match report.outcome {
                MessageOutcome::Handled { records } => records,
                MessageOutcome::Unparseable(_) | MessageOutcome::Lost => 0,
                MessageOutcome::HandlerFailed { handled, .. } => handled,
            })
            .sum()
    }

    /// Add a `Lost` report for every dispatched id without a report.
    /// Repeated ids are accounted for one report at a time.
    fn account_for(&mut self, mut dispatched: Vec<String>) {
        for report in &self.messages {
            if let Some(position) = dispatched.iter().position(|id| *id == report.message_id) {
                dispatched.swap_remove(position);
            }
        }
        for message_id in dispatched {
            error!("SQS message {} was lost before being processed", message_id);
            self.messages.push(MessageReport {
                message_id,
                outcome: MessageOutcome::Lost,
            });
        }
    }
}

/// The S3 event envelope. Records are kept as received.
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "Records")]
    records: Vec<Value>,
}

/// The notification S3 sends when a notification configuration is
/// created. It carries no records.
#[derive(Deserialize)]
struct TestEvent {
    #[serde(rename = "Event")]
    event: String,
}

/// Parse a message body into its event records.
fn parse(message: &Message) -> Result<Vec<ChangeRecord>> {
    let body = message
        .body
        .as_deref()
        .ok_or_else(|| anyhow!("message has no body"))?;
    match serde_json::from_str::<Envelope>(body) {
        Ok(envelope) => Ok(envelope.records.into_iter().map(ChangeRecord::new).collect()),
        Err(e) => match serde_json::from_str::<TestEvent>(body) {
            Ok(test) if test.event == "s3:TestEvent" => {
                info!("Ignoring S3 test event in SQS message {}", message.id);
                Ok(Vec::new())
            }
            _ => Err(e).context("message body is not an S3 event"),
        },
    }
}

/// Handle the records of a single message, in order.
fn process<H: RecordHandler>(handler: &H, message: Message) -> MessageReport {
    info!("Parsing SQS message {}", message.id);
    let outcome = match parse(&message) {
        Err(e) => {
            error!("Failed to parse SQS message {}: {:?}", message.id, e);
            MessageOutcome::Unparseable(e)
        }
        Ok(records) => handle_records(handler, &message.id, &records),
    };
    MessageReport {
        message_id: message.id,
        outcome,
    }
}

/// Handle records until one fails. A panicking handler counts as a
/// failed one in builds that unwind; release builds abort on panic.
fn handle_records<H: RecordHandler>(
    handler: &H,
    message_id: &str,
    records: &[ChangeRecord],
) -> MessageOutcome {
    for (index, record) in records.iter().enumerate() {
        let result = catch_unwind(AssertUnwindSafe(|| handler.handle(record)))
            .unwrap_or_else(|_| Err(anyhow!("record handler panicked")));
        if let Err(error) = result {
            error!(
                "Failed to process record {} of SQS message {}: {:?}",
                index, message_id, error
            );
            return MessageOutcome::HandlerFailed {
                handled: index,
                error,
            };
        }
    }
    MessageOutcome::Handled {
        records: records.len(),
    }
}

/// Feeds queue messages to a record handler.
pub struct Dispatcher<H> {
    handler: Arc<H>,
    settings: Settings,
}

impl<H: RecordHandler> Dispatcher<H> {
    pub fn new(handler: H, settings: Settings) -> Self {
        Dispatcher {
            handler: Arc::new(handler),
            settings,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Process every message in its own task and wait for all of
    /// them. Never fails: failures are reported per message, and
    /// every message gets a report.
    #[instrument(skip_all, fields(messages = messages.len()))]
    pub async fn dispatch(&self, messages: Vec<Message>) -> DispatchReport {
        let dispatched = messages.iter().map(|m| m.id.clone()).collect();
        let mut tasks = JoinSet::new();
        for message in messages {
            let handler = Arc::clone(&self.handler);
            tasks.spawn(async move { process(&*handler, message) });
        }
        let mut report = DispatchReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(message_report) => report.messages.push(message_report),
                Err(e) => error!("SQS message task didn't complete: {:?}", e),
            }
        }
        report.account_for(dispatched);
        report
    }

    /// Handle a Lambda invocation carrying a batch of queue messages.
    /// Messages failed under a `report` policy are returned as batch
    /// item failures.
    pub async fn handle(&self, event: LambdaEvent<SqsEvent>) -> Result<SqsBatchResponse> {
        info!(
            "Handled SQS event {}",
            serde_json::to_string(&event.payload).context("Failed to serialize SQS event")?
        );
        let messages = event.payload.records.into_iter().map(Message::from).collect();
        let report = self.dispatch(messages).await;
        let failed = report.failed_message_ids(&self.settings);
        if !failed.is_empty() {
            info!("Reporting {} failed SQS messages", failed.len());
        }
        Ok(SqsBatchResponse {
            batch_item_failures: failed
                .into_iter()
                .map(|item_identifier| BatchItemFailure { item_identifier })
                .collect(),
        })
    }
}
