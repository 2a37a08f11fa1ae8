//! QMP protocol client for the vmrig harness.
//!
//! The crate speaks the QEMU machine protocol over one connected stream
//! socket: it validates the greeting, negotiates capabilities, issues
//! synchronous commands, buffers unsolicited events for later retrieval,
//! and drives background block jobs through their lifecycle. Process
//! supervision lives in `vmrig-vm`; this crate only owns the channel it
//! is handed.

mod client;
mod error;
mod job;
mod transport;
mod wire;

pub use client::{EventFilter, QmpClient};
pub use error::QmpError;
pub use job::{JobPolicy, JobProgress, JobState};
pub use transport::{Channel, LineTransport, TraceDirection, TraceHook, TransportError};
pub use wire::{
    ErrorPayload, Event, FrameError, Message, Request, Response, value_matches, wire_arguments,
    wire_command_name,
};
