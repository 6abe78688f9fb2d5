//! Body parsing for received messages.

use std::fmt;
use std::sync::Arc;
use tracing::error;

use ferry_common::{Message, Unit};
use crate::error::WorkerError;

/// A parsed message body
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Text(String),
    Json(serde_json::Value),
}

impl Body {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Body::Text(text) => Some(text),
            Body::Json(_) => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Body::Json(value) => Some(value),
            Body::Text(_) => None,
        }
    }
}

/// What the handler receives: one body per message. `None` marks a body that
/// failed to parse.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Single(Option<Body>),
    Batch(Vec<Option<Body>>),
}

impl Payload {
    pub fn single(&self) -> Option<&Body> {
        match self {
            Payload::Single(body) => body.as_ref(),
            Payload::Batch(_) => None,
        }
    }

    pub fn batch(&self) -> &[Option<Body>] {
        match self {
            Payload::Single(_) => &[],
            Payload::Batch(bodies) => bodies,
        }
    }
}

pub type CustomParser = Arc<dyn Fn(&Message) -> Result<Body, WorkerError> + Send + Sync>;

/// How a worker wants its message bodies decoded
#[derive(Clone, Default)]
pub enum BodyParser {
    #[default]
    Text,
    Json,
    Custom(CustomParser),
}

impl BodyParser {
    pub fn custom<F>(parser: F) -> Self
    where
        F: Fn(&Message) -> Result<Body, WorkerError> + Send + Sync + 'static,
    {
        BodyParser::Custom(Arc::new(parser))
    }

    pub fn name(&self) -> &'static str {
        match self {
            BodyParser::Text => "text",
            BodyParser::Json => "json",
            BodyParser::Custom(_) => "custom",
        }
    }

    pub fn parse(&self, message: &Message) -> Result<Body, WorkerError> {
        match self {
            BodyParser::Text => Ok(Body::Text(message.body.clone())),
            BodyParser::Json => serde_json::from_str(&message.body)
                .map(Body::Json)
                .map_err(|e| WorkerError::Parse(e.to_string())),
            BodyParser::Custom(parser) => parser(message),
        }
    }
}

impl fmt::Debug for BodyParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What to do when a body cannot be parsed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ParseFailurePolicy {
    /// Log the raw body and hand the handler an absent body
    #[default]
    Swallow,
    /// Fail the unit; the message is left for redelivery
    Fail,
}

fn parse_message(
    parser: &BodyParser,
    policy: ParseFailurePolicy,
    message: &Message,
) -> Result<Option<Body>, WorkerError> {
    match parser.parse(message) {
        Ok(body) => Ok(Some(body)),
        Err(e) => {
            error!(
                message_id = %message.message_id,
                body_parser = parser.name(),
                body = %message.body,
                error = %e,
                "Error parsing the message body"
            );
            match policy {
                ParseFailurePolicy::Swallow => Ok(None),
                ParseFailurePolicy::Fail => Err(e),
            }
        }
    }
}

/// Parse every message of a unit
pub fn parse_unit(
    parser: &BodyParser,
    policy: ParseFailurePolicy,
    unit: &Unit,
) -> Result<Payload, WorkerError> {
    match unit {
        Unit::Single(message) => Ok(Payload::Single(parse_message(parser, policy, message)?)),
        Unit::Batch { messages, .. } => messages
            .iter()
            .map(|message| parse_message(parser, policy, message))
            .collect::<Result<Vec<_>, _>>()
            .map(Payload::Batch),
    }
}
