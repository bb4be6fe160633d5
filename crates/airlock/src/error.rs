//! Domain error raised when a native call fails.

use std::io;

use thiserror::Error;

/// Failure of a native operating-system call.
///
/// Every fallible operation in this crate reports the same error kind: the
/// name of the native call that failed plus the OS error captured at the call
/// site. Failures are treated as non-transient; nothing in the crate retries,
/// recovery is the caller's responsibility.
#[derive(Debug, Error)]
#[error("native call {call} failed: {source}")]
pub struct PlatformError {
    call: &'static str,
    source: io::Error,
}

impl PlatformError {
    pub(crate) const fn new(call: &'static str, source: io::Error) -> Self {
        Self { call, source }
    }

    /// Captures `io::Error::last_os_error` for the named call.
    #[cfg(windows)]
    pub(crate) fn last_os_error(call: &'static str) -> Self {
        Self::new(call, io::Error::last_os_error())
    }

    /// Name of the native call that failed, e.g. `"pipe2"` or
    /// `"CreateProcessW"`.
    #[must_use]
    pub const fn call(&self) -> &'static str {
        self.call
    }
}
