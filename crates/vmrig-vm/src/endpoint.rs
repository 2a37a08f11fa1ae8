//! Listening endpoints handed to the child process.
//!
//! Every endpoint is created and bound in the parent before the child
//! is forked; the child is told the address on its command line and
//! connects after exec. Accepting is lazy: nothing blocks until the
//! first access to the corresponding channel.

use std::fmt;
use std::net::{TcpListener, TcpStream};
use std::os::unix::net::{UnixListener, UnixStream};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use vmrig_qmp::Channel;

use crate::error::VmError;

/// Tracing target for endpoint lifecycle.
const ENDPOINT_TARGET: &str = "vmrig_vm::endpoint";

/// Address of a communication endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointAddress {
    /// Unix domain socket, addressed by filesystem path.
    Unix {
        /// Socket file path.
        path: Utf8PathBuf,
    },
    /// Loopback TCP socket.
    Tcp {
        /// Host to bind and advertise.
        host: String,
        /// Bound port; zero until the listener reports the assigned
        /// port.
        port: u16,
    },
}

impl EndpointAddress {
    /// Builds a Unix domain socket address.
    #[must_use]
    pub fn unix(path: impl Into<Utf8PathBuf>) -> Self {
        Self::Unix { path: path.into() }
    }

    /// Builds a TCP address.
    #[must_use]
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// The socket path when this is a Unix endpoint.
    #[must_use]
    pub fn unix_path(&self) -> Option<&Utf8Path> {
        match self {
            Self::Unix { path } => Some(path.as_ref()),
            Self::Tcp { .. } => None,
        }
    }

    /// The `-chardev socket,..` address fragment for this endpoint.
    #[must_use]
    pub fn chardev_argument(&self) -> String {
        match self {
            Self::Unix { path } => format!("path={path}"),
            Self::Tcp { host, port } => format!("host={host},port={port}"),
        }
    }

    /// The `-qtest`/`-serial` address form for this endpoint.
    #[must_use]
    pub fn socket_argument(&self) -> String {
        match self {
            Self::Unix { path } => format!("unix:{path}"),
            Self::Tcp { host, port } => format!("tcp:{host}:{port}"),
        }
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix { path } => write!(formatter, "unix://{path}"),
            Self::Tcp { host, port } => write!(formatter, "tcp://{host}:{port}"),
        }
    }
}

#[derive(Debug)]
enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

/// A bound, listening endpoint.
#[derive(Debug)]
pub struct Endpoint {
    address: EndpointAddress,
    listener: Listener,
}

impl Endpoint {
    /// Binds a listener for the given address.
    ///
    /// A TCP address with port zero is rewritten to the
    /// kernel-assigned port so concurrently running harnesses never
    /// collide.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Bind`] when the listener cannot be created.
    pub fn bind(address: EndpointAddress) -> Result<Self, VmError> {
        let bind_error = |source| VmError::Bind {
            address: address.to_string(),
            source,
        };
        match &address {
            EndpointAddress::Unix { path } => {
                let listener = UnixListener::bind(path.as_std_path()).map_err(bind_error)?;
                debug!(target: ENDPOINT_TARGET, %address, "endpoint bound");
                Ok(Self {
                    address,
                    listener: Listener::Unix(listener),
                })
            }
            EndpointAddress::Tcp { host, port } => {
                let listener =
                    TcpListener::bind((host.as_str(), *port)).map_err(bind_error)?;
                let port = listener
                    .local_addr()
                    .map_err(|source| VmError::Bind {
                        address: address.to_string(),
                        source,
                    })?
                    .port();
                let address = EndpointAddress::tcp(host.clone(), port);
                debug!(target: ENDPOINT_TARGET, %address, "endpoint bound");
                Ok(Self {
                    address,
                    listener: Listener::Tcp(listener),
                })
            }
        }
    }

    /// The bound address, with any assigned TCP port filled in.
    #[must_use]
    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }

    /// Blocks until the child connects and returns the channel.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Accept`] when the accept fails.
    pub fn accept(&self) -> Result<Box<dyn Channel>, VmError> {
        let accept_error = |source| VmError::Accept {
            address: self.address.to_string(),
            source,
        };
        let channel: Box<dyn Channel> = match &self.listener {
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().map_err(accept_error)?;
                Box::<UnixStream>::new(stream)
            }
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().map_err(accept_error)?;
                Box::<TcpStream>::new(stream)
            }
        };
        debug!(target: ENDPOINT_TARGET, address = %self.address, "connection accepted");
        Ok(channel)
    }
}

/// Lazy accept state of an optional channel.
pub(crate) enum EndpointState {
    /// Bound, waiting for the first access.
    Listening(Endpoint),
    /// Accepted and live.
    Connected {
        address: EndpointAddress,
        channel: Box<dyn Channel>,
    },
}

impl EndpointState {
    pub(crate) fn address(&self) -> &EndpointAddress {
        match self {
            Self::Listening(endpoint) => endpoint.address(),
            Self::Connected { address, .. } => address,
        }
    }

    /// Resolves the channel, accepting the pending connection on first
    /// access.
    pub(crate) fn channel(&mut self) -> Result<&mut Box<dyn Channel>, VmError> {
        if let Self::Listening(endpoint) = self {
            let channel = endpoint.accept()?;
            let connected = Self::Connected {
                address: endpoint.address().clone(),
                channel,
            };
            *self = connected;
        }
        match self {
            Self::Connected { channel, .. } => Ok(channel),
            Self::Listening(_) => Err(VmError::NotConnected),
        }
    }
}
