//! Process supervision for the vmrig harness.
//!
//! The crate owns the full lifetime of exactly one hypervisor child
//! process: it binds the control sockets before spawning so the child
//! can never connect before the parent listens, builds the command line
//! that wires the child to those sockets, accepts the control
//! connection lazily on first use, and guarantees teardown of the
//! child and its socket files on every exit path.

mod endpoint;
mod error;
mod supervisor;

pub use endpoint::{Endpoint, EndpointAddress};
pub use error::VmError;
pub use supervisor::{Vm, VmBuilder};

pub use nix::sys::signal::Signal;
