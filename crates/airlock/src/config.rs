//! Launch options for sandboxed child processes.

use std::time::Duration;

use crate::os::RawEndpoint;

/// Wait strategy applied while stopping a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitPolicy {
    /// Block until the child has exited, without a deadline.
    #[default]
    Unbounded,
    /// Block for at most the given duration; an elapsed deadline surfaces as
    /// a failure of the native wait call.
    Timeout(Duration),
}

impl WaitPolicy {
    /// Returns the deadline, or `None` for an unbounded wait.
    #[must_use]
    pub const fn timeout(self) -> Option<Duration> {
        match self {
            Self::Unbounded => None,
            Self::Timeout(timeout) => Some(timeout),
        }
    }

    /// Returns true when the policy waits without a deadline.
    #[must_use]
    pub const fn is_unbounded(self) -> bool {
        matches!(self, Self::Unbounded)
    }
}

/// Declarative description of a sandboxed launch.
///
/// The configuration defaults to the tightest launch: the child inherits the
/// two channel endpoints and nothing else, and stopping it waits for the exit
/// without a deadline. Callers whitelist further handles and bound the stop
/// wait explicitly.
///
/// # Defaults
///
/// - no extra inheritable handles
/// - [`WaitPolicy::Unbounded`] for the stop sequence
#[derive(Debug, Clone, Default)]
pub struct LaunchConfig {
    extra_handles: Vec<RawEndpoint>,
    wait: WaitPolicy,
}

impl LaunchConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whitelists one additional handle for inheritance by the child.
    ///
    /// The handle is appended to the pass list after the two channel
    /// endpoints, preserving call order. On Windows the handle itself must
    /// have been created inheritable; on Unix the descriptor's close-on-exec
    /// flag is cleared in the child regardless of its state in the parent.
    #[must_use]
    pub fn pass_handle(mut self, handle: RawEndpoint) -> Self {
        self.extra_handles.push(handle);
        self
    }

    /// Whitelists several additional handles, preserving iteration order.
    #[must_use]
    pub fn pass_handles(mut self, handles: impl IntoIterator<Item = RawEndpoint>) -> Self {
        self.extra_handles.extend(handles);
        self
    }

    /// Sets the wait strategy applied by [`SandboxedProcess::stop`].
    ///
    /// [`SandboxedProcess::stop`]: crate::SandboxedProcess::stop
    #[must_use]
    pub fn stop_wait(mut self, policy: WaitPolicy) -> Self {
        self.wait = policy;
        self
    }

    /// Extra handles whitelisted beyond the channel endpoints.
    #[must_use]
    pub fn extra_handles(&self) -> &[RawEndpoint] {
        &self.extra_handles
    }

    /// The configured stop wait strategy.
    #[must_use]
    pub const fn wait_policy(&self) -> WaitPolicy {
        self.wait
    }
}
