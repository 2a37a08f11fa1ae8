//! Spawning and supervising the hypervisor child process.

use std::env;
use std::fs;
use std::io;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};

use camino::Utf8PathBuf;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde_json::Value;
use tracing::{debug, info, warn};

use vmrig_qmp::{Channel, QmpClient, wire_arguments};

use crate::endpoint::{Endpoint, EndpointAddress, EndpointState};
use crate::error::VmError;

/// Tracing target for supervisor operations.
const SUPERVISOR_TARGET: &str = "vmrig_vm::supervisor";

/// Monotonic counter distinguishing concurrently live instances within
/// one controlling process.
static VM_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_instance_id() -> String {
    let counter = VM_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("{}-{}", std::process::id(), counter)
}

/// Configuration for one supervised hypervisor process.
///
/// Defaults mirror headless test use: the qtest channel is on, serial
/// is off, constrained mode (no display, no default networking, qtest
/// acceleration) is active, and stdio is inherited.
#[derive(Debug, Clone)]
pub struct VmBuilder {
    program: String,
    args: Vec<String>,
    qtest: bool,
    serial: bool,
    normal_vm: bool,
    kvm: bool,
    machine: String,
    tcp_sockets: bool,
    pipe_stdin: bool,
    capture_stdout: bool,
    capture_stderr: bool,
    print_command: bool,
}

impl VmBuilder {
    fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            qtest: true,
            serial: false,
            normal_vm: false,
            kvm: false,
            machine: "q35".to_owned(),
            tcp_sockets: false,
            pipe_stdin: false,
            capture_stdout: false,
            capture_stderr: false,
            print_command: false,
        }
    }

    /// Appends one plain command-line token.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several plain command-line tokens.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Appends a structured argument, flattened to a compact JSON token
    /// with its keys rewritten to the wire convention.
    #[must_use]
    pub fn json_arg(mut self, value: Value) -> Self {
        self.args.push(wire_arguments(value).to_string());
        self
    }

    /// Toggles the secondary qtest channel (default on).
    #[must_use]
    pub fn qtest(mut self, enabled: bool) -> Self {
        self.qtest = enabled;
        self
    }

    /// Toggles the serial redirection channel (default off).
    #[must_use]
    pub fn serial(mut self, enabled: bool) -> Self {
        self.serial = enabled;
        self
    }

    /// Runs with full device emulation instead of the constrained
    /// headless test mode. Disables the qtest channel.
    #[must_use]
    pub fn normal_vm(mut self, enabled: bool) -> Self {
        self.normal_vm = enabled;
        self
    }

    /// Prefers hardware acceleration; effective only in normal mode.
    #[must_use]
    pub fn kvm(mut self, enabled: bool) -> Self {
        self.kvm = enabled;
        self
    }

    /// Machine type passed to the hypervisor (default `q35`).
    #[must_use]
    pub fn machine(mut self, machine: impl Into<String>) -> Self {
        self.machine = machine.into();
        self
    }

    /// Uses loopback TCP endpoints instead of Unix sockets.
    #[must_use]
    pub fn tcp_sockets(mut self, enabled: bool) -> Self {
        self.tcp_sockets = enabled;
        self
    }

    /// Gives the child a pipe for stdin instead of inheriting.
    #[must_use]
    pub fn pipe_stdin(mut self, enabled: bool) -> Self {
        self.pipe_stdin = enabled;
        self
    }

    /// Captures the child's stdout as a pipe the caller can read.
    #[must_use]
    pub fn capture_stdout(mut self, enabled: bool) -> Self {
        self.capture_stdout = enabled;
        self
    }

    /// Captures the child's stderr as a pipe the caller can read.
    #[must_use]
    pub fn capture_stderr(mut self, enabled: bool) -> Self {
        self.capture_stderr = enabled;
        self
    }

    /// Raises the resolved command line to info-level logging.
    #[must_use]
    pub fn print_command(mut self, enabled: bool) -> Self {
        self.print_command = enabled;
        self
    }

    fn endpoint_address(&self, instance_id: &str, kind: &str) -> EndpointAddress {
        if self.tcp_sockets {
            EndpointAddress::tcp("127.0.0.1", 0)
        } else {
            let mut path = Utf8PathBuf::from_path_buf(env::temp_dir())
                .unwrap_or_else(|_| Utf8PathBuf::from("/tmp"));
            path.push(format!("vmrig-{kind}-{instance_id}"));
            EndpointAddress::unix(path)
        }
    }

    /// Binds all requested endpoints and spawns the child.
    ///
    /// Every listener exists before the fork, so the child's connect
    /// can never race the parent's listen. A spawn failure after the
    /// endpoints were bound removes the socket files again.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Bind`] when an endpoint cannot be created and
    /// [`VmError::Spawn`] when the executable cannot be started.
    pub fn spawn(self) -> Result<Vm, VmError> {
        let instance_id = next_instance_id();

        // Mode interlock: normal mode has no qtest channel, constrained
        // mode never uses hardware acceleration.
        let qtest = self.qtest && !self.normal_vm;
        let kvm = self.kvm && self.normal_vm;

        let qmp_endpoint = Endpoint::bind(self.endpoint_address(&instance_id, "qmp"))?;
        let qtest_endpoint = if qtest {
            Some(Endpoint::bind(self.endpoint_address(&instance_id, "qtest"))?)
        } else {
            None
        };
        let serial_endpoint = if self.serial {
            Some(Endpoint::bind(self.endpoint_address(&instance_id, "serial"))?)
        } else {
            None
        };

        let mut cleanup_paths = Vec::new();
        for endpoint in [Some(&qmp_endpoint), qtest_endpoint.as_ref(), serial_endpoint.as_ref()]
            .into_iter()
            .flatten()
        {
            if let Some(path) = endpoint.address().unix_path() {
                cleanup_paths.push(path.to_path_buf());
            }
        }

        let mut argv = self.args.clone();
        argv.push("-chardev".to_owned());
        argv.push(format!(
            "socket,id=mon0,{}",
            qmp_endpoint.address().chardev_argument()
        ));
        argv.push("-mon".to_owned());
        argv.push("mon0,mode=control".to_owned());

        let accel = if qtest {
            "qtest:tcg"
        } else if kvm {
            "kvm:tcg"
        } else {
            "tcg"
        };
        argv.push("-machine".to_owned());
        argv.push(format!("{},accel={accel}", self.machine));

        if let Some(endpoint) = &qtest_endpoint {
            argv.push("-qtest".to_owned());
            argv.push(endpoint.address().socket_argument());
        }
        if !self.normal_vm {
            argv.push("-display".to_owned());
            argv.push("none".to_owned());
        }
        if let Some(endpoint) = &serial_endpoint {
            argv.push("-serial".to_owned());
            argv.push(endpoint.address().socket_argument());
        }
        if !self.normal_vm {
            argv.push("-net".to_owned());
            argv.push("none".to_owned());
        }

        let mut command_line = Vec::with_capacity(argv.len() + 1);
        command_line.push(self.program.clone());
        command_line.extend(argv.iter().cloned());
        let rendered = command_line.join(" ");
        if self.print_command {
            info!(target: SUPERVISOR_TARGET, instance_id, command = %rendered, "resolved command line");
        } else {
            debug!(target: SUPERVISOR_TARGET, instance_id, command = %rendered, "resolved command line");
        }

        let mut command = Command::new(&self.program);
        command.args(&argv);
        if self.pipe_stdin {
            command.stdin(Stdio::piped());
        }
        if self.capture_stdout {
            command.stdout(Stdio::piped());
        }
        if self.capture_stderr {
            command.stderr(Stdio::piped());
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                for path in &cleanup_paths {
                    let _ = fs::remove_file(path.as_std_path());
                }
                return Err(VmError::Spawn {
                    program: self.program,
                    source,
                });
            }
        };
        debug!(
            target: SUPERVISOR_TARGET,
            instance_id,
            pid = child.id(),
            "child process spawned"
        );

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        Ok(Vm {
            instance_id,
            command_line,
            child: Some(child),
            qmp_endpoint,
            qmp: None,
            qtest: qtest_endpoint.map(EndpointState::Listening),
            serial: serial_endpoint.map(EndpointState::Listening),
            stdin,
            stdout,
            stderr,
            cleanup_paths,
        })
    }
}

/// One supervised hypervisor process and its channels.
pub struct Vm {
    instance_id: String,
    command_line: Vec<String>,
    child: Option<Child>,
    qmp_endpoint: Endpoint,
    qmp: Option<QmpClient>,
    qtest: Option<EndpointState>,
    serial: Option<EndpointState>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    cleanup_paths: Vec<Utf8PathBuf>,
}

impl Vm {
    /// Starts configuring a supervised process.
    #[must_use]
    pub fn builder(program: impl Into<String>) -> VmBuilder {
        VmBuilder::new(program)
    }

    /// Unique identifier of this instance (controlling pid + counter).
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// The resolved command line, program first.
    #[must_use]
    pub fn command_line(&self) -> &[String] {
        &self.command_line
    }

    /// The child's process id while it is still tracked.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Address of the control endpoint.
    #[must_use]
    pub fn qmp_address(&self) -> &EndpointAddress {
        self.qmp_endpoint.address()
    }

    /// Address of the qtest endpoint, when requested.
    #[must_use]
    pub fn qtest_address(&self) -> Option<&EndpointAddress> {
        self.qtest.as_ref().map(EndpointState::address)
    }

    /// Address of the serial endpoint, when requested.
    #[must_use]
    pub fn serial_address(&self) -> Option<&EndpointAddress> {
        self.serial.as_ref().map(EndpointState::address)
    }

    /// The negotiated control session, accepting the child's pending
    /// connection and running the handshake on first access.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Accept`] when the accept fails and the
    /// handshake errors from [`QmpClient::new`] otherwise.
    pub fn qmp(&mut self) -> Result<&mut QmpClient, VmError> {
        if self.qmp.is_none() {
            let channel = self.qmp_endpoint.accept()?;
            let client = QmpClient::new(channel)?;
            debug!(
                target: SUPERVISOR_TARGET,
                instance_id = %self.instance_id,
                "control session established"
            );
            return Ok(self.qmp.insert(client));
        }
        self.qmp.as_mut().ok_or(VmError::NotConnected)
    }

    /// The raw qtest channel, accepted lazily; `None` when the channel
    /// was not requested.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Accept`] when the accept fails.
    pub fn qtest_channel(&mut self) -> Result<Option<&mut Box<dyn Channel>>, VmError> {
        match self.qtest.as_mut() {
            Some(state) => state.channel().map(Some),
            None => Ok(None),
        }
    }

    /// The raw serial channel, accepted lazily; `None` when the channel
    /// was not requested.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Accept`] when the accept fails.
    pub fn serial_channel(&mut self) -> Result<Option<&mut Box<dyn Channel>>, VmError> {
        match self.serial.as_mut() {
            Some(state) => state.channel().map(Some),
            None => Ok(None),
        }
    }

    /// The child's stdin pipe, when one was requested.
    pub fn stdin(&mut self) -> Option<&mut ChildStdin> {
        self.stdin.as_mut()
    }

    /// Takes ownership of the captured stdout pipe.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Takes ownership of the captured stderr pipe.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// Delivers a signal to the child if it is still tracked.
    ///
    /// Signaling an already-exited child is a no-op. With `wait` set
    /// the call blocks until the child exits and cleans up, returning
    /// the exit status.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Signal`] for delivery failures other than the
    /// benign missing-process case, and [`VmError::Wait`] from the
    /// waiting phase.
    pub fn signal(&mut self, signal: Signal, wait: bool) -> Result<Option<ExitStatus>, VmError> {
        if let Some(child) = &self.child {
            let pid = child.id();
            match kill(Pid::from_raw(pid as i32), signal) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(source) => return Err(VmError::Signal { pid, source }),
            }
            debug!(target: SUPERVISOR_TARGET, instance_id = %self.instance_id, pid, ?signal, "signal delivered");
        }
        if wait { self.wait() } else { Ok(None) }
    }

    /// Blocks until the child exits, then cleans up.
    ///
    /// Returns `None` when no child is tracked anymore; calling again
    /// after an earlier `wait` or waited `signal` is a safe no-op.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Wait`] when the wait itself fails; cleanup
    /// failures are logged and swallowed.
    pub fn wait(&mut self) -> Result<Option<ExitStatus>, VmError> {
        let status = match self.child.take() {
            Some(mut child) => {
                let status = child.wait().map_err(|source| VmError::Wait { source })?;
                debug!(
                    target: SUPERVISOR_TARGET,
                    instance_id = %self.instance_id,
                    ?status,
                    "child process exited"
                );
                Some(status)
            }
            None => None,
        };
        self.cleanup();
        Ok(status)
    }

    fn cleanup(&mut self) {
        self.stdin = None;
        self.stdout = None;
        self.stderr = None;
        for path in &self.cleanup_paths {
            match fs::remove_file(path.as_std_path()) {
                Ok(()) => {}
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => {
                    warn!(
                        target: SUPERVISOR_TARGET,
                        file = %path,
                        error = %error,
                        "failed to remove socket file"
                    );
                }
            }
        }
        self.cleanup_paths.clear();
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(error) = child.kill() {
                warn!(
                    target: SUPERVISOR_TARGET,
                    instance_id = %self.instance_id,
                    error = %error,
                    "failed to kill child process on drop"
                );
            } else {
                let _ = child.wait();
            }
        }
        self.cleanup();
    }
}
