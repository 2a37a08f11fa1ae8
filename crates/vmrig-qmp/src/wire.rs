//! QMP wire naming and frame types.
//!
//! QMP commands use hyphen-separated names on the wire while callers use
//! underscore-separated identifiers, except for a handful of commands
//! whose wire form itself contains underscores. Frames are
//! newline-delimited JSON objects; everything the client does not
//! inspect stays an untyped [`Value`].

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Command names whose wire form keeps underscores.
const UNDERSCORE_COMMANDS: &[&str] = &[
    "block_resize",
    "device_add",
    "device_del",
    "system_reset",
    "migrate_cancel",
];

/// Translates a caller-side command name to its wire form.
#[must_use]
pub fn wire_command_name(name: &str) -> String {
    if UNDERSCORE_COMMANDS.contains(&name) {
        name.to_owned()
    } else {
        name.replace('_', "-")
    }
}

/// Recursively rewrites argument object keys to the wire convention.
///
/// Array elements recurse; scalars pass through unchanged.
#[must_use]
pub fn wire_arguments(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, val)| (key.replace('_', "-"), wire_arguments(val)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(wire_arguments).collect()),
        other => other,
    }
}

/// Partial-match predicate over JSON values.
///
/// Every key present in `reference` must appear in `candidate` with a
/// recursively equal value; extra candidate keys are ignored. An empty
/// reference object matches any object.
#[must_use]
pub fn value_matches(reference: &Value, candidate: &Value) -> bool {
    match reference {
        Value::Object(reference_map) => {
            let Value::Object(candidate_map) = candidate else {
                return false;
            };
            reference_map.iter().all(|(key, reference_value)| {
                candidate_map
                    .get(key)
                    .is_some_and(|candidate_value| match reference_value {
                        Value::Object(_) => value_matches(reference_value, candidate_value),
                        other => candidate_value == other,
                    })
            })
        }
        other => candidate == other,
    }
}

/// A QMP command request.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    /// Wire-form command name.
    pub execute: String,
    /// Argument object, omitted from the frame when empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

/// The structured error object of an error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error-class tag, e.g. `GenericError` or `CommandNotFound`.
    pub class: String,
    /// Human-readable description.
    pub desc: String,
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}: {}", self.class, self.desc)
    }
}

/// An unsolicited notification.
///
/// The full frame is retained so match predicates can see every key,
/// including `event` and timestamp fields, not just `data`.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    value: Value,
}

impl Event {
    /// Wraps a raw event frame.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        Self { value }
    }

    /// The event name, when present.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.value.get("event").and_then(Value::as_str)
    }

    /// The event's data payload; `Null` when the frame carries none.
    #[must_use]
    pub fn data(&self) -> &Value {
        self.value.get("data").unwrap_or(&Value::Null)
    }

    /// Applies the partial-match predicate against the full frame.
    #[must_use]
    pub fn matches(&self, reference: &Value) -> bool {
        value_matches(reference, &self.value)
    }

    /// The full raw frame.
    #[must_use]
    pub fn as_value(&self) -> &Value {
        &self.value
    }

    /// Consumes the event, yielding the raw frame.
    #[must_use]
    pub fn into_value(self) -> Value {
        self.value
    }
}

/// Outcome of a command: exactly one of success or error.
#[derive(Debug, Clone)]
pub enum Response {
    /// `{"return": <value>}`.
    Success(Value),
    /// `{"error": {"class": .., "desc": ..}}`.
    Error(ErrorPayload),
}

/// Any frame the peer may send after the greeting.
#[derive(Debug, Clone)]
pub enum Message {
    /// A reply to an in-flight command.
    Response(Response),
    /// An unsolicited notification.
    Event(Event),
}

impl Message {
    /// Parses one received line.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError`] when the line is not valid JSON or is not
    /// recognizable as a response or an event.
    pub fn parse(line: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(line)?;
        Self::classify(value)
    }

    fn classify(value: Value) -> Result<Self, FrameError> {
        let Value::Object(mut map) = value else {
            return Err(FrameError::UnexpectedShape(value.to_string()));
        };
        if map.contains_key("event") {
            return Ok(Self::Event(Event::from_value(Value::Object(map))));
        }
        if let Some(result) = map.remove("return") {
            return Ok(Self::Response(Response::Success(result)));
        }
        if let Some(error) = map.remove("error") {
            let payload: ErrorPayload = serde_json::from_value(error)?;
            return Ok(Self::Response(Response::Error(payload)));
        }
        Err(FrameError::UnexpectedShape(Value::Object(map).to_string()))
    }
}

/// Errors raised while decoding a received frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The line was not valid JSON.
    #[error("malformed JSON frame: {0}")]
    Json(#[from] serde_json::Error),
    /// The frame is neither a response nor an event.
    #[error("frame is neither a response nor an event: {0}")]
    UnexpectedShape(String),
}
