//! Launching and stopping sandboxed child processes.

use tracing::{debug, info};

use crate::channel::{PipeEndpoint, channel_with};
use crate::config::{LaunchConfig, WaitPolicy};
use crate::error::PlatformError;
use crate::os::{self, CommandLine, NativeBindings, RawEndpoint};

const PROCESS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::process");

/// Lifecycle state of a sandboxed child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// The child was created and has not been stopped.
    Running,
    /// The stop sequence ran; every owned handle is released.
    Stopped,
}

/// Launches child processes that inherit an exhaustive handle whitelist.
#[derive(Debug)]
pub struct Launcher {
    config: LaunchConfig,
}

impl Launcher {
    /// Creates a launcher with the supplied configuration.
    #[must_use]
    pub fn new(config: LaunchConfig) -> Self {
        Self { config }
    }

    /// Spawns a child connected to the parent by two private pipes.
    ///
    /// Two channels are created: the output channel (parent reads, child
    /// writes), then the input channel (parent writes, child reads). The
    /// whitelist handed to process creation is `[output child end, input
    /// child end]` followed by the configured extra handles, in that order.
    /// `command_line` receives the raw values of the child's two endpoints,
    /// input end first, so the command line can name them for the child
    /// program; handle values survive process creation unchanged.
    ///
    /// On success the parent's copies of the two child ends are closed and
    /// the returned record owns only the process handle and the two local
    /// endpoints.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError`] when pipe creation, whitelist encoding, or
    /// process creation fails. Endpoints already created for the failed
    /// attempt are released before the error reaches the caller.
    pub fn spawn<F>(&self, command_line: F) -> Result<SandboxedProcess, PlatformError>
    where
        F: FnOnce(RawEndpoint, RawEndpoint) -> CommandLine,
    {
        self.spawn_with(*NativeBindings::table(), command_line)
    }

    pub(crate) fn spawn_with<F>(
        &self,
        bindings: NativeBindings,
        command_line: F,
    ) -> Result<SandboxedProcess, PlatformError>
    where
        F: FnOnce(RawEndpoint, RawEndpoint) -> CommandLine,
    {
        let output = channel_with(&bindings)?;
        let input = channel_with(&bindings)?;

        let mut whitelisted = vec![output.write.raw(), input.read.raw()];
        whitelisted.extend_from_slice(self.config.extra_handles());
        let mut whitelist = os::HandleWhitelist::build(&whitelisted)?;

        let line = command_line(input.read.raw(), output.write.raw());
        let child = os::create_child(&bindings, &line, &mut whitelist)?;

        // The child now owns the only live copies of its two endpoints.
        drop(output.write);
        drop(input.read);

        let pid = child.pid();
        info!(
            target: PROCESS_TARGET,
            pid,
            whitelisted = whitelisted.len(),
            "sandboxed child launched"
        );
        Ok(SandboxedProcess {
            bindings,
            child: Some(child),
            local_input: Some(input.write),
            local_output: Some(output.read),
            pid,
            state: ProcessState::Running,
            wait: self.config.wait_policy(),
        })
    }
}

/// A sandboxed child process and the parent's ends of its channel.
///
/// While running, the record owns the process handle and the two local
/// endpoints: `input` is the write end (the child reads it), `output` is the
/// read end (the child writes it). Dropping the record releases the handles
/// without terminating the child; call [`Self::stop`] to end it.
#[derive(Debug)]
pub struct SandboxedProcess {
    bindings: NativeBindings,
    child: Option<os::ChildHandle>,
    local_input: Option<PipeEndpoint>,
    local_output: Option<PipeEndpoint>,
    pid: u32,
    state: ProcessState,
    wait: WaitPolicy,
}

impl SandboxedProcess {
    /// OS process id of the child. Stays readable after a stop.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ProcessState {
        self.state
    }

    /// True until [`Self::stop`] has run.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self.state, ProcessState::Running)
    }

    /// Raw value of the local input endpoint (parent writes, child reads),
    /// or `None` once stopped. The record keeps ownership of the handle.
    #[must_use]
    pub fn input(&self) -> Option<RawEndpoint> {
        self.local_input.as_ref().map(PipeEndpoint::raw)
    }

    /// Raw value of the local output endpoint (parent reads, child writes),
    /// or `None` once stopped.
    #[must_use]
    pub fn output(&self) -> Option<RawEndpoint> {
        self.local_output.as_ref().map(PipeEndpoint::raw)
    }

    /// Borrows the input endpoint for writing bytes to the child.
    #[must_use]
    pub fn input_endpoint(&mut self) -> Option<&mut PipeEndpoint> {
        self.local_input.as_mut()
    }

    /// Borrows the output endpoint for reading bytes from the child.
    #[must_use]
    pub fn output_endpoint(&mut self) -> Option<&mut PipeEndpoint> {
        self.local_output.as_mut()
    }

    /// Stops the child: closes the local endpoints, terminates the process
    /// with a fixed non-zero exit code, waits for the exit, then releases
    /// the process handle.
    ///
    /// The wait follows the configured [`WaitPolicy`]. Stopping an already
    /// stopped record is a no-op reporting success. A stop that fails part
    /// way still leaves the record stopped; the remaining native resources
    /// are released as their owners drop.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError`] when the termination request or the wait
    /// fails at the platform level, including an elapsed
    /// [`WaitPolicy::Timeout`] deadline.
    pub fn stop(&mut self) -> Result<(), PlatformError> {
        if matches!(self.state, ProcessState::Stopped) {
            debug!(
                target: PROCESS_TARGET,
                pid = self.pid,
                "stop requested for stopped child"
            );
            return Ok(());
        }
        self.state = ProcessState::Stopped;
        // Closing the locals first lets a cooperative child notice the
        // channel is gone before the termination lands.
        drop(self.local_input.take());
        drop(self.local_output.take());
        if let Some(mut child) = self.child.take() {
            os::terminate_child(&self.bindings, &child)?;
            os::wait_for_child(&self.bindings, &mut child, self.wait.timeout())?;
        }
        info!(target: PROCESS_TARGET, pid = self.pid, "sandboxed child stopped");
        Ok(())
    }
}
