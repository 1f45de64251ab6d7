//! Defines the declarative resource graph: resources, references
//! between them, and the stack that renders them as a CloudFormation
//! template. Nothing here talks to AWS; deploying a template is the
//! job of an external engine.

use anyhow::{bail, Result};
use serde::{Serialize, Serializer};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;

/// A reference to a value that is only known once the template is
/// deployed, such as a generated bucket name or a queue ARN.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Token {
    /// The primary identifier of a resource, or a pseudo parameter
    /// such as `AWS::AccountId`.
    Ref(String),

    /// An attribute of a resource, e.g. its `Arn`.
    GetAtt(String, String),

    /// A value given verbatim, e.g. the ARN of a pre-existing queue.
    Literal(String),
}

impl Token {
    /// Reference the primary identifier of a resource.
    pub fn reference(logical_id: impl Into<String>) -> Self {
        Token::Ref(logical_id.into())
    }

    /// Reference an attribute of a resource.
    pub fn attribute(logical_id: impl Into<String>, attribute: impl Into<String>) -> Self {
        Token::GetAtt(logical_id.into(), attribute.into())
    }

    /// The logical id of the referenced resource, if any.
    pub fn logical_id(&self) -> Option<&str> {
        match self {
            Token::Ref(id) | Token::GetAtt(id, _) => Some(id),
            Token::Literal(_) => None,
        }
    }

    /// The template expression for this reference.
    pub fn to_value(&self) -> Value {
        match self {
            Token::Ref(id) => json!({ "Ref": id }),
            Token::GetAtt(id, attribute) => json!({ "Fn::GetAtt": [id, attribute] }),
            Token::Literal(value) => Value::String(value.clone()),
        }
    }
}

impl Serialize for Token {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ref(id) => write!(f, "${{{}}}", id),
            Token::GetAtt(id, attribute) => write!(f, "${{{}.{}}}", id, attribute),
            Token::Literal(value) => f.write_str(value),
        }
    }
}

/// A single resource declaration.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Resource {
    /// The resource type, e.g. `AWS::SQS::Queue`.
    #[serde(rename = "Type")]
    pub kind: String,

    #[serde(skip_serializing_if = "is_empty_object")]
    pub properties: Value,

    /// Logical ids of resources that must be created before this one.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

fn is_empty_object(value: &Value) -> bool {
    value.as_object().map_or(value.is_null(), |o| o.is_empty())
}

impl Resource {
    /// Declare a resource of the given type.
    pub fn new(kind: impl Into<String>, properties: Value) -> Self {
        Resource {
            kind: kind.into(),
            properties,
            depends_on: Vec::new(),
        }
    }

    /// Add an explicit creation-order dependency.
    pub fn depends_on(mut self, logical_id: impl Into<String>) -> Self {
        self.depends_on.push(logical_id.into());
        self
    }
}

/// A value exported by a deployed stack.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Output {
    pub value: Token,
}

/// Anything that contributes resources to a stack.
pub trait Declare {
    /// The resources to declare, keyed by logical id.
    fn resources(&self) -> Vec<(String, Resource)>;
}

/// The rendered template document.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Template {
    #[serde(rename = "AWSTemplateFormatVersion")]
    pub format_version: &'static str,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub resources: BTreeMap<String, Resource>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, Output>,
}

/// A named collection of resources and outputs, deployed as a unit.
#[derive(Clone, Debug)]
pub struct Stack {
    name: String,
    resources: BTreeMap<String, Resource>,
    outputs: BTreeMap<String, Output>,
}

impl Stack {
    pub fn new(name: impl Into<String>) -> Self {
        Stack {
            name: name.into(),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add every resource of a construct. Fails without adding
    /// anything if one of its logical ids is already taken.
    pub fn add(&mut self, construct: &impl Declare) -> Result<()> {
        let resources = construct.resources();
        for (logical_id, _) in &resources {
            self.ensure_vacant(logical_id)?;
        }
        self.resources.extend(resources);
        Ok(())
    }

    /// Add a single resource.
    pub fn add_resource(&mut self, logical_id: impl Into<String>, resource: Resource) -> Result<()> {
        let logical_id = logical_id.into();
        self.ensure_vacant(&logical_id)?;
        self.resources.insert(logical_id, resource);
        Ok(())
    }

    /// Export a value under the given output name.
    pub fn add_output(&mut self, name: impl Into<String>, value: Token) -> Result<()> {
        let name = name.into();
        if self.outputs.contains_key(&name) {
            bail!("There is already an output named {:?} in stack {:?}", name, self.name);
        }
        self.outputs.insert(name, Output { value });
        Ok(())
    }

    /// The resource declared under the given logical id.
    pub fn resource(&self, logical_id: &str) -> Option<&Resource> {
        self.resources.get(logical_id)
    }

    /// Render the stack as a template.
    pub fn template(&self) -> Template {
        Template {
            format_version: "2010-09-09",
            description: Some(self.name.clone()),
            resources: self.resources.clone(),
            outputs: self.outputs.clone(),
        }
    }

    fn ensure_vacant(&self, logical_id: &str) -> Result<()> {
        if self.resources.contains_key(logical_id) {
            bail!(
                "There is already a resource with logical id {:?} in stack {:?}",
                logical_id,
                self.name
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pair;

    impl Declare for Pair {
        fn resources(&self) -> Vec<(String, Resource)> {
            vec![
                (
                    String::from("First"),
                    Resource::new("AWS::SQS::Queue", json!({})),
                ),
                (
                    String::from("Second"),
                    Resource::new("AWS::SQS::Queue", json!({})).depends_on("First"),
                ),
            ]
        }
    }

    #[test]
    fn tokens_render_as_intrinsics() {
        assert_eq!(
            serde_json::to_value(Token::reference("Bucket")).unwrap(),
            json!({ "Ref": "Bucket" })
        );
        assert_eq!(
            serde_json::to_value(Token::attribute("Queue", "Arn")).unwrap(),
            json!({ "Fn::GetAtt": ["Queue", "Arn"] })
        );
        assert_eq!(
            serde_json::to_value(Token::Literal(String::from("arn:aws:sqs:::dlq"))).unwrap(),
            json!("arn:aws:sqs:::dlq")
        );
        assert_eq!(Token::attribute("Queue", "Arn").to_string(), "${Queue.Arn}");
    }

    #[test]
    fn template_lists_resources_and_outputs() {
        let mut stack = Stack::new("Test");
        stack.add(&Pair).unwrap();
        stack
            .add_output("QueueUrl", Token::reference("First"))
            .unwrap();
        let template = serde_json::to_value(stack.template()).unwrap();
        assert_eq!(template["AWSTemplateFormatVersion"], "2010-09-09");
        assert_eq!(template["Resources"]["First"], json!({ "Type": "AWS::SQS::Queue" }));
        assert_eq!(template["Resources"]["Second"]["DependsOn"], json!(["First"]));
        assert_eq!(
            template["Outputs"]["QueueUrl"],
            json!({ "Value": { "Ref": "First" } })
        );
    }

    #[test]
    fn colliding_logical_ids_are_rejected_atomically() {
        let mut stack = Stack::new("Test");
        stack
            .add_resource("Second", Resource::new("AWS::S3::Bucket", json!({})))
            .unwrap();
        assert!(stack.add(&Pair).is_err());
        assert!(stack.resource("First").is_none());
        assert_eq!(stack.resource("Second").unwrap().kind, "AWS::S3::Bucket");
    }

    #[test]
    fn colliding_outputs_are_rejected() {
        let mut stack = Stack::new("Test");
        stack.add_output("Name", Token::reference("A")).unwrap();
        assert!(stack.add_output("Name", Token::reference("B")).is_err());
    }
}
