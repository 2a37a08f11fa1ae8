//! Error types for process supervision.

use std::io;

use thiserror::Error;

use vmrig_qmp::QmpError;

/// Errors raised while supervising the child process.
#[derive(Debug, Error)]
pub enum VmError {
    /// Binding a listening endpoint failed; reported before any child
    /// is spawned.
    #[error("failed to bind {address}: {source}")]
    Bind {
        /// The endpoint address.
        address: String,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Accepting the child's connection failed.
    #[error("failed to accept a connection on {address}: {source}")]
    Accept {
        /// The endpoint address.
        address: String,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Spawning the child process failed.
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        /// The program that could not be started.
        program: String,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Delivering a signal to the child failed.
    #[error("failed to signal child process {pid}: {source}")]
    Signal {
        /// The child's process id.
        pid: u32,
        /// The errno reported by the kernel.
        #[source]
        source: nix::Error,
    },

    /// Waiting for the child's exit failed.
    #[error("failed to wait for child process: {source}")]
    Wait {
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A channel was used before its connection was established.
    #[error("control channel is not connected")]
    NotConnected,

    /// Protocol-level failure from the control session.
    #[error(transparent)]
    Qmp(#[from] QmpError),
}
