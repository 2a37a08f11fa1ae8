//! Line-delimited JSON transport over a stream socket.
//!
//! One frame per line. Receiving keeps a pending-bytes buffer so a
//! partial line observed by a non-blocking poll survives until the next
//! read attempt.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;

use thiserror::Error;
use tracing::debug;

/// Tracing target for wire traffic.
const TRANSPORT_TARGET: &str = "vmrig_qmp::transport";

/// A connected stream the transport can drive.
///
/// Both address families QMP is reachable over implement this; the
/// non-blocking toggle backs the single-attempt event poll.
pub trait Channel: Read + Write + Send {
    /// Switches the underlying socket between blocking and
    /// non-blocking mode.
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;
}

impl Channel for UnixStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        UnixStream::set_nonblocking(self, nonblocking)
    }
}

impl Channel for TcpStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        TcpStream::set_nonblocking(self, nonblocking)
    }
}

/// Direction of a traced line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceDirection {
    /// Line written to the peer.
    Send,
    /// Line read from the peer.
    Recv,
}

impl TraceDirection {
    fn as_str(self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Recv => "recv",
        }
    }
}

/// Hook invoked with every raw line in both directions.
pub type TraceHook = Box<dyn Fn(TraceDirection, &str) + Send>;

/// Newline-delimited JSON channel with buffered receiving.
pub struct LineTransport {
    channel: Box<dyn Channel>,
    pending: Vec<u8>,
    trace: Option<TraceHook>,
    label: Option<String>,
}

/// Transport-layer errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error during read or write.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the channel mid-stream.
    #[error("channel closed by peer")]
    ChannelClosed,

    /// A received line was not valid UTF-8.
    #[error("received line is not valid UTF-8")]
    InvalidUtf8,
}

impl LineTransport {
    /// Wraps a connected channel.
    #[must_use]
    pub fn new(channel: Box<dyn Channel>) -> Self {
        Self {
            channel,
            pending: Vec::new(),
            trace: None,
            label: None,
        }
    }

    /// Installs or clears the raw-line trace hook.
    ///
    /// Diagnostics only; never used for control flow.
    pub fn set_trace(&mut self, hook: Option<TraceHook>) {
        self.trace = hook;
    }

    /// Sets the label included with traced lines.
    pub fn set_label(&mut self, label: Option<String>) {
        self.label = label;
    }

    /// Writes one line and flushes it.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] when the write fails.
    pub fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        self.trace_line(TraceDirection::Send, line);
        self.channel.write_all(line.as_bytes())?;
        self.channel.write_all(b"\n")?;
        self.channel.flush()?;
        Ok(())
    }

    /// Blocks until a full line has been received.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ChannelClosed`] on EOF and
    /// [`TransportError::Io`] on read failure.
    pub fn recv_line(&mut self) -> Result<String, TransportError> {
        loop {
            if let Some(line) = self.take_buffered_line()? {
                return Ok(line);
            }
            let mut chunk = [0u8; 4096];
            match self.channel.read(&mut chunk) {
                Ok(0) => return Err(TransportError::ChannelClosed),
                Ok(read) => self.pending.extend_from_slice(&chunk[..read]),
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Attempts one non-blocking receive.
    ///
    /// Drains whatever bytes are currently available and returns a line
    /// only if one is complete; otherwise the partial input stays
    /// buffered and `None` is returned immediately. The channel is
    /// restored to blocking mode before returning.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] when toggling socket modes or
    /// reading fails.
    pub fn try_recv_line(&mut self) -> Result<Option<String>, TransportError> {
        if let Some(line) = self.take_buffered_line()? {
            return Ok(Some(line));
        }
        self.channel.set_nonblocking(true)?;
        let drained = self.drain_available();
        let restored = self.channel.set_nonblocking(false);
        drained?;
        restored?;
        self.take_buffered_line()
    }

    fn drain_available(&mut self) -> Result<(), TransportError> {
        loop {
            if self.pending.contains(&b'\n') {
                return Ok(());
            }
            let mut chunk = [0u8; 4096];
            match self.channel.read(&mut chunk) {
                // EOF with nothing buffered looks like "no data"; the
                // next blocking read reports the closed channel.
                Ok(0) => return Ok(()),
                Ok(read) => self.pending.extend_from_slice(&chunk[..read]),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(error.into()),
            }
        }
    }

    fn take_buffered_line(&mut self) -> Result<Option<String>, TransportError> {
        let Some(position) = self.pending.iter().position(|&byte| byte == b'\n') else {
            return Ok(None);
        };
        let rest = self.pending.split_off(position + 1);
        let mut line_bytes = std::mem::replace(&mut self.pending, rest);
        line_bytes.pop();
        if line_bytes.last() == Some(&b'\r') {
            line_bytes.pop();
        }
        let line = String::from_utf8(line_bytes).map_err(|_| TransportError::InvalidUtf8)?;
        self.trace_line(TraceDirection::Recv, &line);
        Ok(Some(line))
    }

    fn trace_line(&self, direction: TraceDirection, line: &str) {
        debug!(
            target: TRANSPORT_TARGET,
            direction = direction.as_str(),
            label = self.label.as_deref(),
            line,
            "qmp wire"
        );
        if let Some(hook) = &self.trace {
            hook(direction, line);
        }
    }
}
