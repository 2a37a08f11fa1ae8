//! The QMP protocol client.
//!
//! One client owns one connected channel. Construction runs the
//! capability handshake; afterwards all traffic is synchronous
//! command/response, with unsolicited events buffered in arrival order
//! for later retrieval.

use std::collections::VecDeque;

use serde_json::{Value, json};
use tracing::debug;

use crate::error::QmpError;
use crate::transport::{Channel, LineTransport, TraceHook};
use crate::wire::{Event, Message, Request, Response, wire_arguments, wire_command_name};

/// Tracing target for client operations.
const CLIENT_TARGET: &str = "vmrig_qmp::client";

/// Selects events out of the stream.
#[derive(Debug, Clone)]
pub enum EventFilter {
    /// Matches any event.
    Any,
    /// Matches events whose name equals the string.
    Name(String),
    /// Partial-match reference applied to the full event frame.
    Matches(Value),
}

impl EventFilter {
    fn matches(&self, event: &Event) -> bool {
        match self {
            Self::Any => true,
            Self::Name(name) => event.matches(&json!({"event": name})),
            Self::Matches(reference) => event.matches(reference),
        }
    }
}

impl From<&str> for EventFilter {
    fn from(name: &str) -> Self {
        Self::Name(name.to_owned())
    }
}

impl From<String> for EventFilter {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<Value> for EventFilter {
    fn from(reference: Value) -> Self {
        Self::Matches(reference)
    }
}

/// A negotiated QMP session over one channel.
pub struct QmpClient {
    transport: LineTransport,
    capabilities: Vec<String>,
    pub(crate) events: VecDeque<Event>,
    pub(crate) deferred: Vec<Event>,
}

impl std::fmt::Debug for QmpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QmpClient")
            .field("capabilities", &self.capabilities)
            .field("events", &self.events)
            .field("deferred", &self.deferred)
            .finish_non_exhaustive()
    }
}

impl QmpClient {
    /// Connects over the given channel and runs the handshake.
    ///
    /// The greeting is received and validated, then capability
    /// negotiation is sent and must succeed before the client is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns [`QmpError::Handshake`] for a malformed greeting or an
    /// unrecognized capability, or the failure of the negotiation
    /// command itself.
    pub fn new(channel: Box<dyn Channel>) -> Result<Self, QmpError> {
        Self::from_transport(LineTransport::new(channel))
    }

    /// Like [`QmpClient::new`], over an already-wrapped transport.
    ///
    /// # Errors
    ///
    /// See [`QmpClient::new`].
    pub fn from_transport(transport: LineTransport) -> Result<Self, QmpError> {
        let mut client = Self {
            transport,
            capabilities: Vec::new(),
            events: VecDeque::new(),
            deferred: Vec::new(),
        };
        client.handshake()?;
        Ok(client)
    }

    fn handshake(&mut self) -> Result<(), QmpError> {
        let line = self.transport.recv_line()?;
        let greeting: Value = serde_json::from_str(&line).map_err(|error| QmpError::Handshake {
            message: format!("greeting is not valid JSON: {error}"),
        })?;
        let section = greeting.get("QMP").ok_or_else(|| QmpError::Handshake {
            message: "greeting lacks the \"QMP\" section".to_owned(),
        })?;
        let advertised = section
            .get("capabilities")
            .and_then(Value::as_array)
            .ok_or_else(|| QmpError::Handshake {
                message: "greeting lacks a capability list".to_owned(),
            })?;
        for capability in advertised {
            let name = capability.as_str().ok_or_else(|| QmpError::Handshake {
                message: format!("capability entry is not a string: {capability}"),
            })?;
            match name {
                // Accepted but not exercised.
                "oob" => {}
                other => {
                    return Err(QmpError::Handshake {
                        message: format!("unknown capability \"{other}\""),
                    });
                }
            }
            self.capabilities.push(name.to_owned());
        }
        debug!(
            target: CLIENT_TARGET,
            capabilities = ?self.capabilities,
            "greeting accepted"
        );
        self.execute("qmp_capabilities", Value::Null)?;
        Ok(())
    }

    /// Capabilities the peer advertised in its greeting.
    #[must_use]
    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    /// Issues a command and blocks until its response.
    ///
    /// The name and arguments are sent as given, with the argument
    /// object omitted when empty (`Null` or `{}`). Events received
    /// while waiting are buffered in arrival order. There is no
    /// client-side timeout; the call returns when the peer answers or
    /// the channel closes.
    ///
    /// # Errors
    ///
    /// Returns [`QmpError::Command`] for an error response,
    /// [`QmpError::Violation`] for an undecodable frame, and
    /// [`QmpError::Transport`] for channel failure.
    pub fn execute(&mut self, command: &str, arguments: Value) -> Result<Value, QmpError> {
        let arguments = match arguments {
            Value::Null => None,
            Value::Object(map) if map.is_empty() => None,
            other => Some(other),
        };
        let request = Request {
            execute: command.to_owned(),
            arguments,
        };
        let line = serde_json::to_string(&request).map_err(|error| QmpError::Violation {
            message: format!("request not serializable: {error}"),
        })?;
        debug!(target: CLIENT_TARGET, command, "executing command");
        self.transport.send_line(&line)?;
        loop {
            let line = self.transport.recv_line()?;
            match parse_message(&line)? {
                Message::Event(event) => self.events.push_back(event),
                Message::Response(Response::Success(value)) => return Ok(value),
                Message::Response(Response::Error(payload)) => {
                    return Err(QmpError::Command(payload));
                }
            }
        }
    }

    /// Invokes an arbitrary command by its caller-side name.
    ///
    /// The name is translated to the wire convention (underscores to
    /// hyphens, except the fixed allow-list) and argument keys are
    /// rewritten recursively the same way.
    ///
    /// # Errors
    ///
    /// See [`QmpClient::execute`].
    pub fn invoke(&mut self, command: &str, arguments: Value) -> Result<Value, QmpError> {
        self.execute(&wire_command_name(command), wire_arguments(arguments))
    }

    /// Asks the hypervisor to quit.
    ///
    /// # Errors
    ///
    /// See [`QmpClient::execute`].
    pub fn quit(&mut self) -> Result<Value, QmpError> {
        self.execute("quit", Value::Null)
    }

    /// Queries the background job list.
    ///
    /// # Errors
    ///
    /// See [`QmpClient::execute`].
    pub fn query_jobs(&mut self) -> Result<Value, QmpError> {
        self.execute("query-jobs", Value::Null)
    }

    pub(crate) fn job_finalize(&mut self, id: &str) -> Result<Value, QmpError> {
        self.execute("job-finalize", json!({"id": id}))
    }

    pub(crate) fn job_dismiss(&mut self, id: &str) -> Result<Value, QmpError> {
        self.execute("job-dismiss", json!({"id": id}))
    }

    pub(crate) fn block_job_complete(&mut self, device: &str) -> Result<Value, QmpError> {
        self.execute("block-job-complete", json!({"device": device}))
    }

    /// Blocks until an event matching the filter arrives.
    ///
    /// Buffered events are scanned first, in insertion order; a match
    /// is removed and returned without channel I/O. Otherwise lines are
    /// read until a matching event arrives, buffering every
    /// non-matching event seen along the way.
    ///
    /// # Errors
    ///
    /// Returns [`QmpError::Violation`] when a non-event frame arrives
    /// while waiting, and [`QmpError::Transport`] for channel failure.
    pub fn event_wait(&mut self, filter: impl Into<EventFilter>) -> Result<Event, QmpError> {
        let filter = filter.into();
        if let Some(event) = self.take_buffered(&filter) {
            return Ok(event);
        }
        loop {
            let line = self.transport.recv_line()?;
            let event = parse_event(&line)?;
            if filter.matches(&event) {
                return Ok(event);
            }
            self.events.push_back(event);
        }
    }

    /// Attempts exactly one non-blocking event retrieval.
    ///
    /// Scans the buffer, then makes a single non-blocking read attempt:
    /// with no data available, returns `None` immediately; a complete
    /// but non-matching event is buffered and `None` is returned.
    ///
    /// # Errors
    ///
    /// See [`QmpClient::event_wait`].
    pub fn event_try_wait(
        &mut self,
        filter: impl Into<EventFilter>,
    ) -> Result<Option<Event>, QmpError> {
        let filter = filter.into();
        if let Some(event) = self.take_buffered(&filter) {
            return Ok(Some(event));
        }
        let Some(line) = self.transport.try_recv_line()? else {
            return Ok(None);
        };
        let event = parse_event(&line)?;
        if filter.matches(&event) {
            Ok(Some(event))
        } else {
            self.events.push_back(event);
            Ok(None)
        }
    }

    /// Discards all buffered events.
    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    /// Number of buffered events.
    #[must_use]
    pub fn buffered_events(&self) -> usize {
        self.events.len()
    }

    /// Installs or clears the raw-line trace hook.
    pub fn set_trace(&mut self, hook: Option<TraceHook>) {
        self.transport.set_trace(hook);
    }

    /// Sets the label included with traced lines.
    pub fn set_label(&mut self, label: Option<String>) {
        self.transport.set_label(label);
    }

    fn take_buffered(&mut self, filter: &EventFilter) -> Option<Event> {
        let index = self.events.iter().position(|event| filter.matches(event))?;
        self.events.remove(index)
    }
}

fn parse_message(line: &str) -> Result<Message, QmpError> {
    Message::parse(line).map_err(|error| QmpError::Violation {
        message: error.to_string(),
    })
}

fn parse_event(line: &str) -> Result<Event, QmpError> {
    match parse_message(line)? {
        Message::Event(event) => Ok(event),
        Message::Response(_) => Err(QmpError::Violation {
            message: format!("expected an event, got: {line}"),
        }),
    }
}
