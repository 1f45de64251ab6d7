//! Defines the S3 event handler construct: a bucket whose change
//! notifications feed a queue, backed by a dead-letter queue, and
//! consumed by a single Lambda function.

use crate::notify::{EventType, NotificationKeyFilter, NotificationSubscription};
use crate::template::{Declare, Resource, Token};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::num::NonZeroU32;

const DEAD_LETTER_QUEUE_ID: &str = "DeadLetterQueue";
const QUEUE_ID: &str = "Queue";
const QUEUE_POLICY_ID: &str = "QueuePolicy";
const HANDLER_ID: &str = "QueueHandler";
const HANDLER_ROLE_ID: &str = "QueueHandlerServiceRole";
const EVENT_SOURCE_ID: &str = "QueueHandlerSqsEventSource";

/// Where the handler's code is deployed from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Code {
    /// A zip package stored in S3.
    S3 {
        bucket: String,
        key: String,
        object_version: Option<String>,
    },

    /// Source code given inline.
    Inline(String),

    /// A container image.
    Image(String),
}

impl Code {
    fn properties(&self) -> Value {
        match self {
            Code::S3 {
                bucket,
                key,
                object_version,
            } => {
                let mut code = json!({ "S3Bucket": bucket, "S3Key": key });
                if let Some(version) = object_version {
                    code["S3ObjectVersion"] = json!(version);
                }
                code
            }
            Code::Inline(source) => json!({ "ZipFile": source }),
            Code::Image(uri) => json!({ "ImageUri": uri }),
        }
    }
}

/// The handler function's configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandlerConfig {
    /// Runtime identifier, e.g. `provided.al2`. Ignored for images.
    pub runtime: String,

    pub code: Code,

    /// Entry point, e.g. `bootstrap`. Ignored for images.
    pub handler: String,

    /// Memory in MiB.
    pub memory_size: Option<u32>,

    /// Timeout in seconds.
    pub timeout: Option<u32>,

    pub environment: BTreeMap<String, String>,
}

impl HandlerConfig {
    pub fn new(runtime: impl Into<String>, code: Code, handler: impl Into<String>) -> Self {
        HandlerConfig {
            runtime: runtime.into(),
            code,
            handler: handler.into(),
            memory_size: None,
            timeout: None,
            environment: BTreeMap::new(),
        }
    }
}

/// Overrides for the queue pair and the way the function consumes it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueConfig {
    /// Redrive target replacing the construct's own dead-letter queue.
    pub dead_letter_queue: Option<Token>,

    /// Deliveries attempted before a message is dead-lettered. The
    /// default of 1 means no retry.
    pub max_receive_count: NonZeroU32,

    /// Visibility timeout of the primary queue, in seconds.
    pub visibility_timeout: Option<u32>,

    /// Retention period of the primary queue, in seconds.
    pub retention_period: Option<u32>,

    /// Maximum amount of messages per invocation.
    pub batch_size: Option<u32>,

    /// Whether the function reports individual failed messages instead
    /// of failing the whole batch.
    pub report_batch_item_failures: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            dead_letter_queue: None,
            max_receive_count: NonZeroU32::MIN,
            visibility_timeout: None,
            retention_period: None,
            batch_size: None,
            report_batch_item_failures: false,
        }
    }
}

/// Everything needed to build the construct.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct S3EventHandlerProps {
    /// Unique identifier, prefixing the bucket and the queue name.
    pub id: String,
    pub handler: HandlerConfig,
    pub queue: QueueConfig,
}

/// References to the declared resources, resolved at deploy time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionedResources {
    pub bucket_name: Token,
    pub bucket_arn: Token,
    pub queue_url: Token,
    pub queue_arn: Token,
    pub dead_letter_queue_arn: Token,
    pub handler_name: Token,
    pub handler_arn: Token,
}

/// The bucket, queue pair and handler function, declared as a unit.
#[derive(Clone, Debug)]
pub struct S3EventHandlerConstruct {
    props: S3EventHandlerProps,
    bucket_id: String,
    provisioned: ProvisionedResources,
    subscriptions: Vec<NotificationSubscription>,
}

impl S3EventHandlerConstruct {
    /// Declare the construct's resources. Nothing is validated here;
    /// invalid identifiers or runtimes are rejected when deployed.
    pub fn new(props: S3EventHandlerProps) -> Self {
        let bucket_id = format!("{}Bucket", props.id);
        let provisioned = ProvisionedResources {
            bucket_name: Token::reference(&bucket_id),
            bucket_arn: Token::attribute(&bucket_id, "Arn"),
            queue_url: Token::reference(QUEUE_ID),
            queue_arn: Token::attribute(QUEUE_ID, "Arn"),
            dead_letter_queue_arn: Token::attribute(DEAD_LETTER_QUEUE_ID, "Arn"),
            handler_name: Token::reference(HANDLER_ID),
            handler_arn: Token::attribute(HANDLER_ID, "Arn"),
        };
        S3EventHandlerConstruct {
            props,
            bucket_id,
            provisioned,
            subscriptions: Vec::new(),
        }
    }

    /// Route bucket events of the given type into the queue, one
    /// route per filter, or a single unfiltered route if no filter is
    /// given. Routes are never deduplicated.
    pub fn subscribe(&mut self, event: EventType, filters: &[NotificationKeyFilter]) {
        if filters.is_empty() {
            self.subscriptions.push(NotificationSubscription {
                event,
                filter: NotificationKeyFilter::default(),
            });
        }
        for filter in filters {
            self.subscriptions.push(NotificationSubscription {
                event,
                filter: filter.clone(),
            });
        }
    }

    pub fn id(&self) -> &str {
        &self.props.id
    }

    pub fn bucket_name(&self) -> &Token {
        &self.provisioned.bucket_name
    }

    pub fn bucket_arn(&self) -> &Token {
        &self.provisioned.bucket_arn
    }

    pub fn queue_url(&self) -> &Token {
        &self.provisioned.queue_url
    }

    pub fn handler_name(&self) -> &Token {
        &self.provisioned.handler_name
    }

    pub fn handler_arn(&self) -> &Token {
        &self.provisioned.handler_arn
    }

    pub fn provisioned(&self) -> &ProvisionedResources {
        &self.provisioned
    }

    pub fn subscriptions(&self) -> &[NotificationSubscription] {
        &self.subscriptions
    }

    /// The ARN the primary queue redrives failed messages to.
    pub fn redrive_target(&self) -> &Token {
        self.props
            .queue
            .dead_letter_queue
            .as_ref()
            .unwrap_or(&self.provisioned.dead_letter_queue_arn)
    }

    fn bucket(&self) -> Resource {
        let mut properties = Map::new();
        if !self.subscriptions.is_empty() {
            let configurations: Vec<Value> = self
                .subscriptions
                .iter()
                .map(|s| s.queue_configuration(&self.provisioned.queue_arn))
                .collect();
            properties.insert(
                String::from("NotificationConfiguration"),
                json!({ "QueueConfigurations": configurations }),
            );
        }
        // S3 checks it may publish to the queue when notifications are set
        Resource::new("AWS::S3::Bucket", Value::Object(properties)).depends_on(QUEUE_POLICY_ID)
    }

    fn queue(&self) -> Resource {
        let queue = &self.props.queue;
        let mut properties = json!({
            "QueueName": format!("{}Queue", self.props.id),
            "RedrivePolicy": {
                "deadLetterTargetArn": self.redrive_target(),
                "maxReceiveCount": queue.max_receive_count.get(),
            },
        });
        if let Some(timeout) = queue.visibility_timeout {
            properties["VisibilityTimeout"] = json!(timeout);
        }
        if let Some(period) = queue.retention_period {
            properties["MessageRetentionPeriod"] = json!(period);
        }
        Resource::new("AWS::SQS::Queue", properties)
    }

    fn queue_policy(&self) -> Resource {
        Resource::new(
            "AWS::SQS::QueuePolicy",
            json!({
                "Queues": [self.provisioned.queue_url],
                "PolicyDocument": {
                    "Version": "2012-10-17",
                    "Statement": [{
                        "Effect": "Allow",
                        "Principal": { "Service": "s3.amazonaws.com" },
                        "Action": ["sqs:SendMessage", "sqs:GetQueueAttributes", "sqs:GetQueueUrl"],
                        "Resource": self.provisioned.queue_arn,
                        "Condition": {
                            "StringEquals": { "aws:SourceAccount": { "Ref": "AWS::AccountId" } }
                        }
                    }]
                }
            }),
        )
    }

    fn handler_role(&self) -> Resource {
        Resource::new(
            "AWS::IAM::Role",
            json!({
                "AssumeRolePolicyDocument": {
                    "Version": "2012-10-17",
                    "Statement": [{
                        "Effect": "Allow",
                        "Principal": { "Service": "lambda.amazonaws.com" },
                        "Action": "sts:AssumeRole"
                    }]
                },
                "ManagedPolicyArns": [{
                    "Fn::Join": ["", [
                        "arn:",
                        { "Ref": "AWS::Partition" },
                        ":iam::aws:policy/service-role/AWSLambdaBasicExecutionRole"
                    ]]
                }],
                "Policies": [{
                    "PolicyName": "QueueConsumer",
                    "PolicyDocument": {
                        "Version": "2012-10-17",
                        "Statement": [{
                            "Effect": "Allow",
                            "Action": [
                                "sqs:ReceiveMessage",
                                "sqs:ChangeMessageVisibility",
                                "sqs:GetQueueUrl",
                                "sqs:DeleteMessage",
                                "sqs:GetQueueAttributes"
                            ],
                            "Resource": self.provisioned.queue_arn
                        }]
                    }
                }]
            }),
        )
    }

    fn handler(&self) -> Resource {
        let handler = &self.props.handler;
        let mut properties = json!({
            "Role": Token::attribute(HANDLER_ROLE_ID, "Arn"),
            "Code": handler.code.properties(),
        });
        if let Code::Image(_) = handler.code {
            properties["PackageType"] = json!("Image");
        } else {
            properties["Runtime"] = json!(handler.runtime);
            properties["Handler"] = json!(handler.handler);
        }
        if let Some(memory_size) = handler.memory_size {
            properties["MemorySize"] = json!(memory_size);
        }
        if let Some(timeout) = handler.timeout {
            properties["Timeout"] = json!(timeout);
        }
        if !handler.environment.is_empty() {
            properties["Environment"] = json!({ "Variables": handler.environment });
        }
        Resource::new("AWS::Lambda::Function", properties).depends_on(HANDLER_ROLE_ID)
    }

    fn event_source(&self) -> Resource {
        let queue = &self.props.queue;
        let mut properties = json!({
            "EventSourceArn": self.provisioned.queue_arn,
            "FunctionName": self.provisioned.handler_name,
        });
        if let Some(batch_size) = queue.batch_size {
            properties["BatchSize"] = json!(batch_size);
        }
        if queue.report_batch_item_failures {
            properties["FunctionResponseTypes"] = json!(["ReportBatchItemFailures"]);
        }
        Resource::new("AWS::Lambda::EventSourceMapping", properties).depends_on(HANDLER_ROLE_ID)
    }
}

impl Declare for S3EventHandlerConstruct {
    fn resources(&self) -> Vec<(String, Resource)> {
        vec![
            (self.bucket_id.clone(), self.bucket()),
            (String::from(DEAD_LETTER_QUEUE_ID), Resource::new("AWS::SQS::Queue", json!({}))),
            (String::from(QUEUE_ID), self.queue()),
            (String::from(QUEUE_POLICY_ID), self.queue_policy()),
            (String::from(HANDLER_ROLE_ID), self.handler_role()),
            (String::from(HANDLER_ID), self.handler()),
            (String::from(EVENT_SOURCE_ID), self.event_source()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::Stack;

    fn props() -> S3EventHandlerProps {
        S3EventHandlerProps {
            id: String::from("S3EventHandlerConstructTest"),
            handler: HandlerConfig::new(
                "provided.al2",
                Code::S3 {
                    bucket: String::from("artifacts"),
                    key: String::from("handler.zip"),
                    object_version: None,
                },
                "bootstrap",
            ),
            queue: QueueConfig::default(),
        }
    }

    fn declared(construct: &S3EventHandlerConstruct) -> BTreeMap<String, Resource> {
        construct.resources().into_iter().collect()
    }

    #[test]
    fn identifiers_are_never_empty() {
        let construct = S3EventHandlerConstruct::new(props());
        for token in [
            construct.bucket_name(),
            construct.bucket_arn(),
            construct.queue_url(),
            construct.handler_name(),
            construct.handler_arn(),
        ] {
            assert!(!token.to_string().is_empty());
            assert!(token.logical_id().is_some());
        }
        assert_eq!(
            construct.bucket_name(),
            &Token::reference("S3EventHandlerConstructTestBucket")
        );
    }

    #[test]
    fn queue_redrives_once_by_default() {
        let resources = declared(&S3EventHandlerConstruct::new(props()));
        let queue = &resources["Queue"].properties;
        assert_eq!(queue["QueueName"], "S3EventHandlerConstructTestQueue");
        assert_eq!(
            queue["RedrivePolicy"],
            json!({
                "deadLetterTargetArn": { "Fn::GetAtt": ["DeadLetterQueue", "Arn"] },
                "maxReceiveCount": 1
            })
        );
        assert_eq!(resources["DeadLetterQueue"].kind, "AWS::SQS::Queue");
    }

    #[test]
    fn queue_overrides_are_applied() {
        let mut props = props();
        props.queue.max_receive_count = NonZeroU32::new(5).unwrap();
        props.queue.dead_letter_queue = Some(Token::Literal(String::from(
            "arn:aws:sqs:us-east-1:123456789012:shared-dlq",
        )));
        props.queue.batch_size = Some(5);
        props.queue.report_batch_item_failures = true;
        let resources = declared(&S3EventHandlerConstruct::new(props));
        assert_eq!(
            resources["Queue"].properties["RedrivePolicy"],
            json!({
                "deadLetterTargetArn": "arn:aws:sqs:us-east-1:123456789012:shared-dlq",
                "maxReceiveCount": 5
            })
        );
        // The construct's own dead-letter queue is still declared
        assert!(resources.contains_key("DeadLetterQueue"));
        let mapping = &resources["QueueHandlerSqsEventSource"].properties;
        assert_eq!(mapping["BatchSize"], 5);
        assert_eq!(mapping["FunctionResponseTypes"], json!(["ReportBatchItemFailures"]));
    }

    #[test]
    fn the_handler_is_the_single_consumer() {
        let resources = declared(&S3EventHandlerConstruct::new(props()));
        let mappings: Vec<&Resource> = resources
            .values()
            .filter(|r| r.kind == "AWS::Lambda::EventSourceMapping")
            .collect();
        assert_eq!(mappings.len(), 1);
        assert_eq!(
            mappings[0].properties,
            json!({
                "EventSourceArn": { "Fn::GetAtt": ["Queue", "Arn"] },
                "FunctionName": { "Ref": "QueueHandler" }
            })
        );
        let function = &resources["QueueHandler"].properties;
        assert_eq!(function["Runtime"], "provided.al2");
        assert_eq!(function["Handler"], "bootstrap");
        assert_eq!(
            function["Code"],
            json!({ "S3Bucket": "artifacts", "S3Key": "handler.zip" })
        );
    }

    #[test]
    fn bucket_has_no_notifications_until_subscribed() {
        let resources = declared(&S3EventHandlerConstruct::new(props()));
        let bucket = &resources["S3EventHandlerConstructTestBucket"];
        assert!(bucket.properties.get("NotificationConfiguration").is_none());
        assert_eq!(bucket.depends_on, vec![String::from("QueuePolicy")]);
    }

    #[test]
    fn subscribe_adds_one_route_per_filter() {
        let mut construct = S3EventHandlerConstruct::new(props());
        construct.subscribe(
            EventType::ObjectCreatedPut,
            &[
                NotificationKeyFilter::prefix("path/auditable"),
                NotificationKeyFilter::suffix(".log"),
            ],
        );
        construct.subscribe(EventType::ObjectRemoved, &[]);
        assert_eq!(construct.subscriptions().len(), 3);
        let resources = declared(&construct);
        let configurations = &resources["S3EventHandlerConstructTestBucket"].properties
            ["NotificationConfiguration"]["QueueConfigurations"];
        assert_eq!(configurations.as_array().unwrap().len(), 3);
        assert_eq!(configurations[2]["Event"], "s3:ObjectRemoved:*");
        assert!(configurations[2].get("Filter").is_none());
    }

    #[test]
    fn repeated_subscriptions_are_not_deduplicated() {
        let mut construct = S3EventHandlerConstruct::new(props());
        let filters = [NotificationKeyFilter::prefix("path/auditable")];
        construct.subscribe(EventType::default(), &filters);
        construct.subscribe(EventType::default(), &filters);
        assert_eq!(construct.subscriptions().len(), 2);
        assert_eq!(construct.subscriptions()[0], construct.subscriptions()[1]);
    }

    #[test]
    fn two_constructs_collide_in_one_stack() {
        let mut stack = Stack::new("Test");
        stack.add(&S3EventHandlerConstruct::new(props())).unwrap();
        let mut other = props();
        other.id = String::from("Other");
        assert!(stack.add(&S3EventHandlerConstruct::new(other)).is_err());
    }

    #[test]
    fn image_handlers_omit_runtime_and_entry() {
        let mut props = props();
        props.handler.code = Code::Image(String::from(
            "123456789012.dkr.ecr.us-east-1.amazonaws.com/handler:latest",
        ));
        let resources = declared(&S3EventHandlerConstruct::new(props));
        let function = &resources["QueueHandler"].properties;
        assert_eq!(function["PackageType"], "Image");
        assert!(function.get("Runtime").is_none());
        assert!(function.get("Handler").is_none());
    }
}
